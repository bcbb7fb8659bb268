//! Shared helpers for the gateway integration tests
//!
//! - FakeBackend: scripted control-plane API server
//! - spawn_gateway / connect: a served gateway and a console client

#![allow(dead_code)]

pub mod fake_backend;

pub use fake_backend::{FakeBackend, CLOSE_COMMAND, DROP_COMMAND};

use futures::{SinkExt, StreamExt};
use guisrv_gateway::{build_router, AppState, GatewayConfig};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn spawn_gateway(config: GatewayConfig) -> (SocketAddr, AppState) {
    let state = AppState::new(config);
    let app = build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

/// Gateway in front of a fresh fake backend
pub async fn setup() -> (SocketAddr, AppState, FakeBackend) {
    setup_with(GatewayConfig::default()).await
}

pub async fn setup_with(config: GatewayConfig) -> (SocketAddr, AppState, FakeBackend) {
    let backend = FakeBackend::spawn().await;
    let config = GatewayConfig {
        api_url: backend.url(),
        ..config
    };
    let (gateway, state) = spawn_gateway(config).await;
    (gateway, state, backend)
}

pub async fn connect(gateway: SocketAddr) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", gateway))
        .await
        .unwrap();
    ws
}

/// Next data or close frame, skipping control frames
pub async fn recv(ws: &mut Client) -> Message {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        match message {
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            other => return other,
        }
    }
}

pub async fn recv_json(ws: &mut Client) -> Value {
    match recv(ws).await {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text frame, got {:?}", other),
    }
}

pub async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

pub async fn login(ws: &mut Client, password: &str) -> Value {
    send_json(
        ws,
        serde_json::json!({
            "RequestId": 1,
            "Type": "Admin",
            "Request": "Login",
            "Params": {"AuthTag": "user-admin", "Password": password}
        }),
    )
    .await;
    recv_json(ws).await
}

pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
