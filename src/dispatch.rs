//! Callback orchestration: authenticate, decrypt, parse, respond, build, encrypt

use std::borrow::Cow;

use serde::Deserialize;
use tracing::{debug, info};

use crate::config::Config;
use crate::crypt::{CryptError, EncryptedEnvelope, MsgCrypt};
use crate::message::{self, MessageKind, ParseError};
use crate::reply::{self, ReplyError};
use crate::responder::Responder;
use crate::session::Sessions;
use crate::signature;

/// Query parameters the platform appends to every callback
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub nonce: String,
    /// Only sent with the handshake
    pub echostr: Option<String>,
    /// Only sent in encrypted mode
    pub msg_signature: Option<String>,
    pub encrypt_type: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Crypt(#[from] CryptError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Reply(#[from] ReplyError),
    #[error("msg_signature does not match the ciphertext")]
    BadMessageSignature,
    #[error(transparent)]
    Responder(anyhow::Error),
}

pub struct Dispatcher<R: Responder> {
    token: String,
    crypt: Option<MsgCrypt>,
    responder: R,
    sessions: Sessions<R::Session>,
}

impl<R: Responder> Dispatcher<R> {
    /// Creates the dispatcher; the codec is enabled iff an `encoding_aes_key` is configured.
    pub fn new(config: &Config, responder: R, sessions: Sessions<R::Session>) -> Result<Self, CryptError> {
        let crypt = config
            .encoding_aes_key
            .as_deref()
            .map(|key| MsgCrypt::new(&config.token, &config.app_id, key))
            .transpose()?;
        Ok(Self {
            token: config.token.clone(),
            crypt,
            responder,
            sessions,
        })
    }

    pub fn sessions(&self) -> &Sessions<R::Session> {
        &self.sessions
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypt.is_some()
    }

    /// Checks the request signature over token, timestamp and nonce.
    pub fn verify(&self, query: &CallbackQuery) -> bool {
        signature::verify(
            &self.token,
            &query.timestamp,
            &query.nonce,
            &query.signature,
            None,
        )
    }

    /// Returns the `echostr` to answer the developer handshake with, or `None` if the
    /// signature does not match. A missing `echostr` is answered with an empty one.
    pub fn handshake(&self, query: &CallbackQuery) -> Option<String> {
        if !self.verify(query) {
            return None;
        }
        info!("handshake succeeded");
        Some(query.echostr.clone().unwrap_or_default())
    }

    /// Handles the body of an already authenticated callback and returns the response body.
    pub async fn handle(&self, query: &CallbackQuery, body: &[u8]) -> Result<Vec<u8>, DispatchError> {
        let plaintext = match &self.crypt {
            Some(crypt) => {
                let envelope = EncryptedEnvelope::from_xml(body)?;
                if let Some(msg_signature) = &query.msg_signature {
                    let valid = signature::verify(
                        &self.token,
                        &query.timestamp,
                        &query.nonce,
                        msg_signature,
                        Some(&envelope.encrypt),
                    );
                    if !valid {
                        return Err(DispatchError::BadMessageSignature);
                    }
                }
                Cow::Owned(crypt.open(&envelope.encrypt)?)
            }
            None => Cow::Borrowed(body),
        };

        let (header, message) = message::parse(&plaintext)?;
        debug!(
            from = %header.from_user_name,
            msg_id = %header.msg_id,
            kind = ?message.kind(),
            "received message"
        );

        let session = self.sessions.get_or_create(&header.from_user_name, || {
            self.responder.new_session(&header.from_user_name)
        });
        let reply = {
            let mut session = session.lock().await;
            self.responder
                .respond(&mut session, &header, &message)
                .await
                .map_err(DispatchError::Responder)?
        };

        if message.kind() == MessageKind::Unsubscribe {
            self.sessions.remove(&header.from_user_name);
            debug!(user = %header.from_user_name, "session dropped");
        }

        let xml = reply::build(&header, &reply)?;
        match &self.crypt {
            Some(crypt) => Ok(crypt.encrypt(&xml)?),
            None => Ok(xml),
        }
    }
}
