//! Fake control-plane API server
//!
//! Answers Admin.Login (password "secret" succeeds) and echoes every other
//! frame. Two text commands drive teardown from the backend side:
//! - `backend:close` sends a Close frame and ends the connection
//! - `backend:drop` drops the TCP stream without a closing handshake

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

pub const CLOSE_COMMAND: &str = "backend:close";
pub const DROP_COMMAND: &str = "backend:drop";

pub struct FakeBackend {
    pub addr: SocketAddr,
    /// Origin header of each accepted connection
    pub origins: mpsc::UnboundedReceiver<Option<String>>,
    /// One entry per Close frame received from the gateway
    pub closes: mpsc::UnboundedReceiver<Option<u16>>,
}

impl FakeBackend {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (origin_tx, origins) = mpsc::unbounded_channel();
        let (close_tx, closes) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let origin_tx = origin_tx.clone();
                let close_tx = close_tx.clone();
                tokio::spawn(async move {
                    let callback =
                        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                            let origin = req
                                .headers()
                                .get("origin")
                                .and_then(|v| v.to_str().ok())
                                .map(str::to_string);
                            let _ = origin_tx.send(origin);
                            Ok(resp)
                        };
                    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                    else {
                        return;
                    };
                    while let Some(Ok(message)) = ws.next().await {
                        let reply = match message {
                            Message::Text(text) if text == CLOSE_COMMAND => {
                                let _ = ws
                                    .send(Message::Close(Some(CloseFrame {
                                        code: CloseCode::Normal,
                                        reason: "backend going away".into(),
                                    })))
                                    .await;
                                break;
                            }
                            Message::Text(text) if text == DROP_COMMAND => break,
                            Message::Text(text) => Message::Text(reply_to(text)),
                            Message::Binary(data) => Message::Binary(data),
                            Message::Close(frame) => {
                                let _ = close_tx.send(frame.map(|f| u16::from(f.code)));
                                break;
                            }
                            _ => continue,
                        };
                        if ws.send(reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        Self {
            addr,
            origins,
            closes,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }
}

fn reply_to(text: String) -> String {
    let Ok(request) = serde_json::from_str::<Value>(&text) else {
        return text;
    };
    if request["Type"] == "Admin" && request["Request"] == "Login" {
        let reply = if request["Params"]["Password"] == "secret" {
            json!({"RequestId": request["RequestId"], "Response": {"AuthTag": request["Params"]["AuthTag"]}})
        } else {
            json!({"RequestId": request["RequestId"], "Error": "invalid entity name or password"})
        };
        return reply.to_string();
    }
    text
}
