//! Callback handler for WeChat official account server push

pub mod api;
pub mod config;
pub mod crypt;
pub mod dispatch;
pub mod message;
pub mod reply;
pub mod responder;
pub mod server;
pub mod session;
pub mod signature;
