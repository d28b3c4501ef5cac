//! Business logic answering inbound messages

use async_trait::async_trait;

use crate::message::{Message, MessageHeader};
use crate::reply::Reply;

/// Produces the reply to an inbound message
///
/// The dispatcher keeps one session per user and serializes calls for the same user.
#[async_trait]
pub trait Responder: Send + Sync + 'static {
    type Session: Send + 'static;

    /// Creates the state of a user seen for the first time.
    fn new_session(&self, user: &str) -> Self::Session;

    async fn respond(
        &self,
        session: &mut Self::Session,
        header: &MessageHeader,
        message: &Message,
    ) -> anyhow::Result<Reply>;
}

pub const GREETING: &str = "Welcome! Send me anything and I will send it back.";
pub const FALLBACK: &str = "Sorry, I can only handle text messages.";

/// Menu key restarting the conversation
pub const RESTART_KEY: &str = "Start";

/// Echoes text messages back to the user
#[derive(Debug, Default, Clone)]
pub struct EchoResponder;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EchoSession {
    /// Number of text messages echoed since the session started
    pub echoed: usize,
}

#[async_trait]
impl Responder for EchoResponder {
    type Session = EchoSession;

    fn new_session(&self, _user: &str) -> EchoSession {
        EchoSession::default()
    }

    async fn respond(
        &self,
        session: &mut EchoSession,
        _header: &MessageHeader,
        message: &Message,
    ) -> anyhow::Result<Reply> {
        let reply = match message {
            Message::Subscribe(_) => Reply::text(GREETING),
            Message::Text(text) => {
                session.echoed += 1;
                Reply::text(text.content.clone())
            }
            Message::MenuClick(click) if click.event_key == RESTART_KEY => {
                *session = EchoSession::default();
                Reply::text(GREETING)
            }
            Message::MenuClick(click) => Reply::text(format!("You clicked {}", click.event_key)),
            _ => Reply::text(FALLBACK),
        };
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::parse;

    async fn respond(session: &mut EchoSession, xml: &str) -> Reply {
        let (header, message) = parse(xml.as_bytes()).unwrap();
        EchoResponder
            .respond(session, &header, &message)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_echo() {
        let mut session = EchoResponder.new_session("u1");
        let reply = respond(
            &mut session,
            "<xml><ToUserName>gh_1</ToUserName><FromUserName>u1</FromUserName>\
            <CreateTime>123</CreateTime><MsgType>text</MsgType><Content>hi</Content></xml>",
        )
        .await;
        assert_eq!(reply, Reply::text("hi"));
        assert_eq!(session.echoed, 1);
    }

    #[tokio::test]
    async fn test_subscribe_greets() {
        let mut session = EchoSession::default();
        let reply = respond(
            &mut session,
            "<xml><ToUserName>gh_1</ToUserName><FromUserName>u1</FromUserName>\
            <CreateTime>123</CreateTime><MsgType>event</MsgType><Event>subscribe</Event></xml>",
        )
        .await;
        assert_eq!(reply, Reply::text(GREETING));
    }

    #[tokio::test]
    async fn test_menu_click() {
        let mut session = EchoSession { echoed: 3 };
        let reply = respond(
            &mut session,
            "<xml><ToUserName>gh_1</ToUserName><FromUserName>u1</FromUserName>\
            <CreateTime>123</CreateTime><MsgType>event</MsgType><Event>CLICK</Event>\
            <EventKey>Yes</EventKey></xml>",
        )
        .await;
        assert_eq!(reply, Reply::text("You clicked Yes"));
        assert_eq!(session.echoed, 3);

        let reply = respond(
            &mut session,
            "<xml><ToUserName>gh_1</ToUserName><FromUserName>u1</FromUserName>\
            <CreateTime>123</CreateTime><MsgType>event</MsgType><Event>CLICK</Event>\
            <EventKey>Start</EventKey></xml>",
        )
        .await;
        assert_eq!(reply, Reply::text(GREETING));
        assert_eq!(session.echoed, 0);
    }

    #[tokio::test]
    async fn test_fallback() {
        let mut session = EchoSession::default();
        let reply = respond(
            &mut session,
            "<xml><ToUserName>gh_1</ToUserName><FromUserName>u1</FromUserName>\
            <CreateTime>123</CreateTime><MsgType>image</MsgType>\
            <PicUrl>http://example.com/a.png</PicUrl><MediaId>m1</MediaId><MsgId>1</MsgId></xml>",
        )
        .await;
        assert_eq!(reply, Reply::text(FALLBACK));
    }
}
