//! Envelope encryption of callback messages
//!
//! Messages are framed, padded to 32 bytes and encrypted with AES-256-CBC. The scheme provides
//! confidentiality only: there is no MAC, and a tampered ciphertext decrypts to garbage (or fails
//! framing) instead of being rejected up front. This is mandated by the platform and must stay
//! wire compatible.

mod frame;
mod key;

use std::fmt;

use aes::Aes256;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::signature::signature;

pub use key::KeyMaterial;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const AES_BLOCK_SIZE: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptError {
    #[error("invalid EncodingAESKey: {0}")]
    InvalidKeyMaterial(String),
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] EnvelopeError),
    #[error("ciphertext of {0} bytes is not a non-empty multiple of the block size")]
    InvalidCiphertext(usize),
    #[error("frame declares a message of {declared} bytes, but only {available} bytes follow")]
    FrameLengthMismatch { declared: usize, available: usize },
    #[error("payload of {0} bytes does not fit into a frame")]
    PayloadTooLarge(usize),
    #[error("failed to serialize encrypted reply")]
    Xml(#[from] quick_xml::SeError),
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid xml")]
    Xml(#[from] quick_xml::DeError),
    #[error("invalid base64")]
    Base64(#[from] base64::DecodeError),
}

/// Inbound encrypted POST body
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EncryptedEnvelope {
    #[serde(default)]
    pub to_user_name: Option<String>,
    pub encrypt: String,
}

impl EncryptedEnvelope {
    pub fn from_xml(xml: &[u8]) -> Result<Self, CryptError> {
        let envelope = quick_xml::de::from_reader(xml).map_err(EnvelopeError::from)?;
        Ok(envelope)
    }
}

/// Outbound encrypted response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename = "xml", rename_all = "PascalCase")]
pub struct EncryptedReply {
    pub encrypt: String,
    pub msg_signature: String,
    pub time_stamp: String,
    pub nonce: String,
}

impl EncryptedReply {
    pub fn to_xml(&self) -> Result<Vec<u8>, CryptError> {
        Ok(quick_xml::se::to_string(self)?.into_bytes())
    }
}

/// Encrypts and decrypts message envelopes of one official account.
///
/// Immutable after construction; share it by reference between requests.
#[derive(Clone)]
pub struct MsgCrypt {
    token: String,
    app_id: String,
    key: KeyMaterial,
}

impl MsgCrypt {
    pub fn new(
        token: impl Into<String>,
        app_id: impl Into<String>,
        encoding_aes_key: &str,
    ) -> Result<Self, CryptError> {
        let key = KeyMaterial::from_encoding_aes_key(encoding_aes_key)?;
        Ok(Self::with_key(token, app_id, key))
    }

    pub fn with_key(token: impl Into<String>, app_id: impl Into<String>, key: KeyMaterial) -> Self {
        Self {
            token: token.into(),
            app_id: app_id.into(),
            key,
        }
    }

    /// Decrypts the envelope XML and returns the inner message XML.
    ///
    /// The `msg_signature` of the request is not checked here.
    pub fn decrypt(&self, envelope_xml: &[u8]) -> Result<Vec<u8>, CryptError> {
        let envelope = EncryptedEnvelope::from_xml(envelope_xml)?;
        self.open(&envelope.encrypt)
    }

    /// Decrypts the base64 content of the `Encrypt` element.
    pub fn open(&self, encrypt: &str) -> Result<Vec<u8>, CryptError> {
        let mut buf = STANDARD
            .decode(encrypt.trim())
            .map_err(EnvelopeError::from)?;
        let plain = self.cbc_decrypt(&mut buf)?;
        let frame = frame::unpack(frame::unpad(plain))?;

        // the embedded app id lets the sender verify itself; it is not enforced
        if frame.app_id != self.app_id.as_bytes() {
            warn!(
                app_id = %String::from_utf8_lossy(frame.app_id),
                "app id of the decrypted frame does not match the configured one"
            );
        }

        Ok(frame.message.to_vec())
    }

    /// Encrypts the reply XML and returns the serialized encrypted envelope.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptError> {
        self.seal(plaintext)?.to_xml()
    }

    /// Encrypts the reply XML with a fresh timestamp and nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<EncryptedReply, CryptError> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let nonce = rand::random::<u32>().to_string();
        self.seal_with(plaintext, timestamp, nonce)
    }

    pub fn seal_with(
        &self,
        plaintext: &[u8],
        timestamp: String,
        nonce: String,
    ) -> Result<EncryptedReply, CryptError> {
        let mut random = [0; frame::RANDOM_LEN];
        rand::rngs::OsRng.fill_bytes(&mut random);

        let mut buf = frame::pack(&random, plaintext, self.app_id.as_bytes())?;
        frame::pad(&mut buf);
        let encrypt = STANDARD.encode(self.cbc_encrypt(buf)?);

        let msg_signature = signature(&[&self.token, &timestamp, &nonce, &encrypt]);
        Ok(EncryptedReply {
            encrypt,
            msg_signature,
            time_stamp: timestamp,
            nonce,
        })
    }

    fn cbc_encrypt(&self, mut buf: Vec<u8>) -> Result<Vec<u8>, CryptError> {
        let len = buf.len();
        Aes256CbcEnc::new_from_slices(self.key.key(), self.key.iv())
            .map_err(|e| CryptError::InvalidKeyMaterial(e.to_string()))?
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .map_err(|_| CryptError::InvalidCiphertext(len))?;
        Ok(buf)
    }

    fn cbc_decrypt<'a>(&self, buf: &'a mut [u8]) -> Result<&'a [u8], CryptError> {
        let len = buf.len();
        if len == 0 || len % AES_BLOCK_SIZE != 0 {
            return Err(CryptError::InvalidCiphertext(len));
        }
        Aes256CbcDec::new_from_slices(self.key.key(), self.key.iv())
            .map_err(|e| CryptError::InvalidKeyMaterial(e.to_string()))?
            .decrypt_padded_mut::<NoPadding>(buf)
            .map_err(|_| CryptError::InvalidCiphertext(len))
    }
}

impl fmt::Debug for MsgCrypt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgCrypt")
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use quickcheck_macros::quickcheck;

    use super::*;
    use crate::signature::verify;

    const ENCODING_AES_KEY: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8";
    const APP_ID: &str = "wx1234567890abcdef";
    const TOKEN: &str = "token123";

    const MESSAGE: &str = "<xml><ToUserName><![CDATA[gh_1]]></ToUserName>\
        <FromUserName><![CDATA[u1]]></FromUserName><CreateTime>123</CreateTime>\
        <MsgType><![CDATA[text]]></MsgType><Content><![CDATA[hi]]></Content></xml>";

    // Produced by an independent AES-256-CBC implementation from MESSAGE, APP_ID and the random
    // prefix "abcdefghijklmnop".
    const KNOWN_ENCRYPT: &str = "ZnOlBYhoWuZLTtzBJSU1bQ4bohzY9FEU51eAjFvvb73WfdZV25LmTqYVQglEY3Tj\
        MTlTHGYjS3PMo/hdrBgLn7USstJSZ/ltjDEXIdf+rK9boECwkshQuWEpXYGzqLhT7g2MbsNCIOloMI58MxVXpPFV\
        yl/ZCMPWxxXopiQMv4AtHI3FpgjxJ2DjTx35Fy49wmfK8bg5pgSmEFLasb9YVnXimKMqeBUrJ6lgJE8PyRQQEmSf\
        XaaABrc/yyzSmepmI0XaWKclMXCv9wCEq6b3K1p78pY2AP5OF6aMIWAUDa6BJWo5ZGgRhyAYuy3HI3L/uD43CPUI\
        JiaNe5iNVkW6xg==";

    fn msg_crypt() -> MsgCrypt {
        MsgCrypt::new(TOKEN, APP_ID, ENCODING_AES_KEY).unwrap()
    }

    fn envelope(encrypt: &str) -> Vec<u8> {
        format!("<xml><ToUserName><![CDATA[gh_1]]></ToUserName><Encrypt><![CDATA[{encrypt}]]></Encrypt></xml>")
            .into_bytes()
    }

    #[test]
    fn test_decrypt_known_answer() {
        let plaintext = msg_crypt().decrypt(&envelope(KNOWN_ENCRYPT)).unwrap();
        assert_eq!(plaintext, MESSAGE.as_bytes());
    }

    #[test]
    fn test_encrypt_known_answer() {
        let crypt = msg_crypt();
        let mut buf = frame::pack(b"abcdefghijklmnop", MESSAGE.as_bytes(), APP_ID.as_bytes()).unwrap();
        frame::pad(&mut buf);
        let encrypted = STANDARD.encode(crypt.cbc_encrypt(buf).unwrap());
        assert_eq!(encrypted, KNOWN_ENCRYPT);
    }

    #[test]
    fn test_round_trip() {
        let crypt = msg_crypt();
        let reply = crypt.seal(MESSAGE.as_bytes()).unwrap();
        assert_eq!(crypt.open(&reply.encrypt).unwrap(), MESSAGE.as_bytes());
    }

    #[quickcheck]
    fn test_round_trip_any_key(payload: Vec<u8>, seed: Vec<u8>) -> bool {
        let mut key = [0; 32];
        for (k, s) in key.iter_mut().zip(seed.iter().cycle()) {
            *k = *s;
        }
        let crypt = MsgCrypt::with_key(TOKEN, APP_ID, KeyMaterial::from_key(key));
        let reply = crypt.seal(&payload).unwrap();
        crypt.open(&reply.encrypt).unwrap() == payload
    }

    #[test]
    fn test_random_prefix_differs() {
        let crypt = msg_crypt();
        let a = crypt.seal(MESSAGE.as_bytes()).unwrap();
        let b = crypt.seal(MESSAGE.as_bytes()).unwrap();
        assert_ne!(a.encrypt, b.encrypt);
    }

    #[test]
    fn test_sealed_reply_signature() {
        let crypt = msg_crypt();
        let reply = crypt
            .seal_with(b"<xml/>", "1400000000".into(), "1437364".into())
            .unwrap();
        assert_eq!(reply.time_stamp, "1400000000");
        assert_eq!(reply.nonce, "1437364");
        assert!(verify(
            TOKEN,
            &reply.time_stamp,
            &reply.nonce,
            &reply.msg_signature,
            Some(&reply.encrypt)
        ));

        let xml = String::from_utf8(reply.to_xml().unwrap()).unwrap();
        assert!(xml.starts_with("<xml><Encrypt>"));
        assert!(xml.contains(&format!("<MsgSignature>{}</MsgSignature>", reply.msg_signature)));
        assert!(xml.contains("<TimeStamp>1400000000</TimeStamp>"));
        assert!(xml.ends_with("<Nonce>1437364</Nonce></xml>"));
    }

    #[test]
    fn test_truncated_ciphertext() {
        let encrypt = STANDARD.encode([0u8; 15]);
        assert!(matches!(
            msg_crypt().open(&encrypt),
            Err(CryptError::InvalidCiphertext(15))
        ));
        assert!(matches!(
            msg_crypt().open(""),
            Err(CryptError::InvalidCiphertext(0))
        ));
    }

    #[test]
    fn test_malformed_envelope() {
        assert!(matches!(
            msg_crypt().open("not base64!"),
            Err(CryptError::MalformedEnvelope(EnvelopeError::Base64(_)))
        ));
        assert!(matches!(
            msg_crypt().decrypt(b"<xml><ToUserName>gh_1</ToUserName></xml>"),
            Err(CryptError::MalformedEnvelope(EnvelopeError::Xml(_)))
        ));
    }

    #[test]
    fn test_frame_length_mismatch() {
        let crypt = msg_crypt();
        let mut buf = frame::pack(b"abcdefghijklmnop", b"<xml/>", b"").unwrap();
        buf[16..20].copy_from_slice(&1000u32.to_be_bytes());
        frame::pad(&mut buf);
        let encrypt = STANDARD.encode(crypt.cbc_encrypt(buf).unwrap());
        assert!(matches!(
            crypt.open(&encrypt),
            Err(CryptError::FrameLengthMismatch { declared: 1000, .. })
        ));
    }

    #[test]
    fn test_foreign_app_id_is_tolerated() {
        let crypt = msg_crypt();
        let other = MsgCrypt::new(TOKEN, "wx_other", ENCODING_AES_KEY).unwrap();
        let reply = other.seal(b"<xml/>").unwrap();
        assert_eq!(crypt.open(&reply.encrypt).unwrap(), b"<xml/>");
    }

    #[test]
    fn test_tampered_ciphertext() {
        let crypt = msg_crypt();
        let ciphertext = STANDARD.decode(KNOWN_ENCRYPT).unwrap();
        // Flips behind the message only garble the app id and padding tail, which is not part of
        // the returned plaintext.
        let covered = 20 + MESSAGE.len();
        for bit in (0..covered * 8).step_by(7) {
            let mut tampered = ciphertext.clone();
            tampered[bit / 8] ^= 1 << (bit % 8);
            // no integrity protection: either framing fails or the plaintext differs
            match crypt.open(&STANDARD.encode(&tampered)) {
                Ok(plaintext) => assert_ne!(plaintext, MESSAGE.as_bytes(), "bit {bit}"),
                Err(_) => {}
            }
        }
    }

    #[test]
    fn test_wrong_key() {
        let crypt = MsgCrypt::with_key(TOKEN, APP_ID, KeyMaterial::from_key([42; 32]));
        match crypt.open(KNOWN_ENCRYPT) {
            Ok(plaintext) => assert_ne!(plaintext, MESSAGE.as_bytes()),
            Err(e) => assert!(matches!(e, CryptError::FrameLengthMismatch { .. })),
        }
    }
}
