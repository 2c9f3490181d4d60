//! Classification of frames arriving from the browser.

use super::upstream::truthy;
use axum::extract::ws::{CloseFrame, Message};
use bytes::Bytes;
use serde_json::Value;

/// What the relay does with one client frame.
#[derive(Debug, PartialEq)]
pub enum ClientFrame {
    /// Audio, forwarded upstream as a binary frame without modification.
    Audio(Bytes),
    /// A JSON control message, re-serialized, forwarded upstream as text.
    Control(String),
    /// Text that is not JSON or has no `type`. Dropped.
    Unparseable,
    /// Ping/pong, answered by the transport itself.
    Heartbeat,
    /// The client is closing the connection.
    Close(Option<CloseFrame>),
}

impl From<Message> for ClientFrame {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Binary(data) => ClientFrame::Audio(data),
            Message::Text(text) => control(text.as_str()),
            Message::Ping(_) | Message::Pong(_) => ClientFrame::Heartbeat,
            Message::Close(frame) => ClientFrame::Close(frame),
        }
    }
}

/// Accepts a control message only if it parses as JSON and carries a `type`.
fn control(text: &str) -> ClientFrame {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return ClientFrame::Unparseable;
    };
    if !value.get("type").is_some_and(truthy) {
        return ClientFrame::Unparseable;
    }
    match serde_json::to_string(&value) {
        Ok(serialized) => ClientFrame::Control(serialized),
        Err(_) => ClientFrame::Unparseable,
    }
}
