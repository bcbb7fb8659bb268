//! Conversions between axum and tungstenite WebSocket messages
//!
//! Ping and Pong are answered per hop by each WebSocket layer and are
//! never converted.

use axum::extract::ws::{CloseFrame, Message};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as BackendCloseFrame;
use tokio_tungstenite::tungstenite::Message as BackendMessage;

/// Close codes that must not appear in a Close frame on the wire
fn reserved(code: u16) -> bool {
    matches!(code, 1005 | 1006 | 1015)
}

pub fn close_to_backend(frame: Option<CloseFrame<'static>>) -> Option<BackendCloseFrame<'static>> {
    frame
        .filter(|f| !reserved(f.code))
        .map(|f| BackendCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason,
        })
}

pub fn close_to_client(
    frame: Option<BackendCloseFrame<'static>>,
) -> Option<CloseFrame<'static>> {
    frame
        .map(|f| (u16::from(f.code), f.reason))
        .filter(|(code, _)| !reserved(*code))
        .map(|(code, reason)| CloseFrame { code, reason })
}

/// Backend frame to client frame
pub fn to_client(message: BackendMessage) -> Option<Message> {
    match message {
        BackendMessage::Text(text) => Some(Message::Text(text)),
        BackendMessage::Binary(data) => Some(Message::Binary(data)),
        BackendMessage::Close(frame) => Some(Message::Close(close_to_client(frame))),
        BackendMessage::Ping(_) | BackendMessage::Pong(_) | BackendMessage::Frame(_) => None,
    }
}
