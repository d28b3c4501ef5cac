//! HTTP boundary: developer handshake and message callback

use std::future::Future;
use std::io;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dispatch::{CallbackQuery, DispatchError, Dispatcher};
use crate::responder::Responder;

/// Routes `GET` (handshake) and `POST` (callback) on `path` to the dispatcher.
pub fn router<R: Responder>(path: &str, dispatcher: Arc<Dispatcher<R>>) -> Router {
    Router::new()
        .route(path, get(handshake::<R>).post(callback::<R>))
        .with_state(dispatcher)
}

/// Serves the callback endpoint until ctrl-c is received.
pub async fn serve<R: Responder>(config: &Config, dispatcher: Arc<Dispatcher<R>>) -> anyhow::Result<()> {
    let addr = config.server.listen;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, path = %config.server.path, encrypted = dispatcher.is_encrypted(), "listening");

    axum::serve(listener, router(&config.server.path, dispatcher))
        .with_graceful_shutdown(shutdown_on(tokio::signal::ctrl_c()))
        .await
        .context("server failed")?;

    info!("server stopped");
    Ok(())
}

/// Completes once `signal` fires. Never completes if the handler could not be installed.
async fn shutdown_on(signal: impl Future<Output = io::Result<()>>) {
    if let Err(error) = signal.await {
        error!(%error, "failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    info!("received ctrl-c, shutting down");
}

async fn handshake<R: Responder>(
    State(dispatcher): State<Arc<Dispatcher<R>>>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    match dispatcher.handshake(&query) {
        Some(echostr) => echostr.into_response(),
        None => {
            warn!(timestamp = %query.timestamp, "handshake rejected");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

async fn callback<R: Responder>(
    State(dispatcher): State<Arc<Dispatcher<R>>>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> Response {
    if !dispatcher.verify(&query) {
        warn!(timestamp = %query.timestamp, "callback with invalid signature");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    match dispatcher.handle(&query, &body).await {
        Ok(reply) => ([(header::CONTENT_TYPE, "application/xml")], reply).into_response(),
        Err(DispatchError::BadMessageSignature) => {
            warn!(timestamp = %query.timestamp, "callback with invalid msg_signature");
            StatusCode::UNAUTHORIZED.into_response()
        }
        Err(error) => {
            // an empty body acknowledges the message without a reply
            error!(%error, "failed to handle callback");
            StatusCode::OK.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::crypt::{EncryptedEnvelope, MsgCrypt};
    use crate::responder::{EchoResponder, GREETING};
    use crate::session::Sessions;
    use crate::signature::signature;

    const TOKEN: &str = "token123";
    const APP_ID: &str = "wx1234567890abcdef";
    const ENCODING_AES_KEY: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8";

    fn app(config: &Config) -> Router {
        let dispatcher = Dispatcher::new(config, EchoResponder, Sessions::new()).unwrap();
        router(&config.server.path, Arc::new(dispatcher))
    }

    fn signed_uri(extra: &str) -> String {
        let sig = signature(&[TOKEN, "1400000000", "1437364"]);
        format!("/wechat?signature={sig}&timestamp=1400000000&nonce=1437364{extra}")
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_handshake() {
        let app = app(&Config::new(APP_ID, "secret", TOKEN));

        let request = Request::get(signed_uri("&echostr=hello123"))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "hello123");

        let request = Request::get("/wechat?signature=bad&timestamp=1400000000&nonce=1437364&echostr=x")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_callback_plaintext() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let app = app(&Config::new(APP_ID, "secret", TOKEN));

        let body = "<xml><ToUserName>gh_1</ToUserName><FromUserName>u1</FromUserName>\
            <CreateTime>123</CreateTime><MsgType>event</MsgType><Event>subscribe</Event></xml>";
        let request = Request::post(signed_uri(""))
            .body(Body::from(body))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/xml"
        );
        let reply = body_string(response).await;
        assert!(reply.contains("<ToUserName>u1</ToUserName><FromUserName>gh_1</FromUserName>"));
        assert!(reply.contains(&format!("<Content>{GREETING}</Content>")));
    }

    #[tokio::test]
    async fn test_callback_rejects_bad_signature() {
        let app = app(&Config::new(APP_ID, "secret", TOKEN));
        let request = Request::post("/wechat?signature=bad&timestamp=1&nonce=2")
            .body(Body::from("<xml/>"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_callback_failure_is_empty_ok() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let app = app(&Config::new(APP_ID, "secret", TOKEN));

        let request = Request::post(signed_uri(""))
            .body(Body::from("definitely not xml"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "");
    }

    #[tokio::test]
    async fn test_callback_encrypted() {
        let config = Config {
            encoding_aes_key: Some(ENCODING_AES_KEY.to_owned()),
            ..Config::new(APP_ID, "secret", TOKEN)
        };
        let app = app(&config);
        let crypt = MsgCrypt::new(TOKEN, APP_ID, ENCODING_AES_KEY).unwrap();

        let message = "<xml><ToUserName>gh_1</ToUserName><FromUserName>u1</FromUserName>\
            <CreateTime>123</CreateTime><MsgType>text</MsgType><Content>hi</Content>\
            <MsgId>42</MsgId></xml>";
        let inbound = crypt
            .seal_with(message.as_bytes(), "1400000000".to_owned(), "1437364".to_owned())
            .unwrap();
        let body = format!(
            "<xml><ToUserName>gh_1</ToUserName><Encrypt>{}</Encrypt></xml>",
            inbound.encrypt
        );

        let uri = signed_uri(&format!(
            "&encrypt_type=aes&msg_signature={}",
            inbound.msg_signature
        ));
        let request = Request::post(uri).body(Body::from(body.clone())).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let envelope = EncryptedEnvelope::from_xml(body_string(response).await.as_bytes()).unwrap();
        let reply = String::from_utf8(crypt.open(&envelope.encrypt).unwrap()).unwrap();
        assert!(reply.contains("<Content>hi</Content>"));

        let uri = signed_uri(&format!("&encrypt_type=aes&msg_signature={}", "0".repeat(40)));
        let request = Request::post(uri).body(Body::from(body)).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_handshake_without_echostr() {
        let app = app(&Config::new(APP_ID, "secret", TOKEN));
        let request = Request::get(signed_uri("")).body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "");
    }

    #[tokio::test]
    async fn test_shutdown_on_signal() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let timeout = std::time::Duration::from_millis(50);

        let fired = async { io::Result::Ok(()) };
        assert!(tokio::time::timeout(timeout, shutdown_on(fired)).await.is_ok());

        let failed = async { io::Result::<()>::Err(io::Error::other("no signal support")) };
        let never = tokio::time::timeout(timeout, shutdown_on(failed)).await;
        assert!(never.is_err());
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let app = app(&Config::new(APP_ID, "secret", TOKEN));
        let request = Request::get("/other").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
