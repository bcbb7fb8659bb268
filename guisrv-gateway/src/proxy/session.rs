//! Relay of one console session
//!
//! ```text
//!   client ──► upstream task ──► backend
//!                   │ (deployer frames answered locally)
//!                   ▼
//!   client ◄── writer task ◄── mpsc ◄── downstream task ◄── backend
//! ```
//!
//! The session exclusively owns both sockets. Whichever direction ends
//! first (close, error, or gateway shutdown) sends a Close frame to the
//! other side and both connections are dropped.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::http::HeaderValue;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use guisrv_common::events::GatewayEvent;
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as BackendMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::auth::LoginTracker;
use super::convert;
use super::deployer::DeployerHandler;
use super::frames::{classify, ClientFrame, Direction, FrameTracer};
use crate::jobs::SessionId;
use crate::AppState;

/// Client-bound frames buffered before the relay applies backpressure
const OUTBOUND_CAPACITY: usize = 256;

/// Close code sent to the client when the backend cannot be reached
pub const CLOSE_BACKEND_UNREACHABLE: u16 = 1011;

/// Close code sent to both sides on gateway shutdown
const CLOSE_GOING_AWAY: u16 = 1001;

/// How long teardown waits for the client writer to flush
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

type BackendStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type BackendSink = SplitSink<BackendStream, BackendMessage>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid backend URL {url}: {source}")]
    InvalidUrl {
        url: String,
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("invalid Origin header: {0}")]
    InvalidOrigin(String),

    #[error("cannot connect to {url}: {source}")]
    Connect {
        url: String,
        source: tokio_tungstenite::tungstenite::Error,
    },
}

/// Open the backend side of a session
pub async fn connect_backend(url: &str, origin: &str) -> Result<BackendStream, ConnectError> {
    let mut request = url
        .into_client_request()
        .map_err(|source| ConnectError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
    let origin_value =
        HeaderValue::from_str(origin).map_err(|_| ConnectError::InvalidOrigin(origin.to_string()))?;
    request.headers_mut().insert("Origin", origin_value);

    let (stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|source| ConnectError::Connect {
            url: url.to_string(),
            source,
        })?;
    Ok(stream)
}

/// Why a relay direction stopped
#[derive(Debug, Clone, PartialEq, Eq)]
enum Ended {
    ClientClosed,
    ClientError(String),
    BackendClosed,
    BackendError(String),
    Shutdown,
}

impl Ended {
    fn describe(&self) -> String {
        match self {
            Ended::ClientClosed => "client closed".to_string(),
            Ended::ClientError(e) => format!("client error: {}", e),
            Ended::BackendClosed => "backend closed".to_string(),
            Ended::BackendError(e) => format!("backend error: {}", e),
            Ended::Shutdown => "gateway shutdown".to_string(),
        }
    }
}

/// Per-session state shared by both relay directions
struct Relay {
    id: SessionId,
    login: Mutex<LoginTracker>,
    tracer: FrameTracer,
    deployer: DeployerHandler,
    state: AppState,
}

impl Relay {
    fn credentials(&self) -> Option<guisrv_common::protocol::Credentials> {
        self.login
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .credentials()
            .cloned()
    }
}

/// Run one session until either side ends
pub async fn run(state: AppState, client: WebSocket, backend_url: String, origin: String) {
    let session_id = Uuid::new_v4();
    let (mut client_tx, mut client_rx) = client.split();

    let backend = match connect_backend(&backend_url, &origin).await {
        Ok(backend) => backend,
        Err(e) => {
            warn!(session_id = %session_id, "Backend unreachable: {}", e);
            let body = json!({ "error": "BackendUnreachable", "message": e.to_string() });
            let _ = client_tx.send(Message::Text(body.to_string())).await;
            let _ = client_tx
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_BACKEND_UNREACHABLE,
                    reason: "backend unreachable".into(),
                })))
                .await;
            let _ = client_tx.close().await;
            return;
        }
    };
    let (mut backend_tx, mut backend_rx) = backend.split();

    state.sessions.open(session_id, backend_url.clone());
    info!(session_id = %session_id, backend = %backend_url, "Session opened");
    state.event_bus.emit_lossy(GatewayEvent::SessionOpened {
        session_id,
        backend_url,
        timestamp: Utc::now(),
    });

    let relay = Arc::new(Relay {
        id: session_id,
        login: Mutex::new(LoginTracker::new()),
        tracer: state.frame_tracer.clone(),
        deployer: DeployerHandler::new(
            state.scheduler.clone(),
            state.sessions.clone(),
            session_id,
        ),
        state: state.clone(),
    });

    let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
    let writer = tokio::spawn(write_client(client_tx, out_rx));
    let mut long_polls = JoinSet::new();

    let ended = tokio::select! {
        ended = upstream(&relay, &mut client_rx, &mut backend_tx, &out_tx, &mut long_polls) => ended,
        ended = downstream(&relay, &mut backend_rx, &out_tx) => ended,
        _ = state.shutdown.cancelled() => Ended::Shutdown,
    };

    // Paired teardown
    long_polls.abort_all();
    match &ended {
        Ended::ClientClosed | Ended::ClientError(_) => {
            let _ = backend_tx.send(BackendMessage::Close(None)).await;
        }
        Ended::BackendClosed | Ended::BackendError(_) => {
            // A backend Close frame was already forwarded by downstream
            let _ = out_tx.try_send(Message::Close(None));
        }
        Ended::Shutdown => {
            let _ = backend_tx
                .send(BackendMessage::Close(Some(
                    tokio_tungstenite::tungstenite::protocol::CloseFrame {
                        code: CloseCode::Away,
                        reason: "gateway shutdown".into(),
                    },
                )))
                .await;
            let _ = out_tx.try_send(Message::Close(Some(CloseFrame {
                code: CLOSE_GOING_AWAY,
                reason: "gateway shutdown".into(),
            })));
        }
    }
    let _ = backend_tx.close().await;
    drop(out_tx);
    while long_polls.join_next().await.is_some() {}
    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
        debug!(session_id = %session_id, "Client writer did not finish in time");
    }

    state.registry.drop_watchers(session_id);
    let jobs = state
        .sessions
        .close(session_id)
        .map(|info| info.jobs)
        .unwrap_or_default();
    info!(
        session_id = %session_id,
        jobs = ?jobs,
        "Session closed: {}",
        ended.describe()
    );
    state.event_bus.emit_lossy(GatewayEvent::SessionClosed {
        session_id,
        reason: ended.describe(),
        timestamp: Utc::now(),
    });
}

/// Single writer for every client-bound frame
async fn write_client(
    mut client_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Message>,
) {
    while let Some(message) = out_rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if client_tx.send(message).await.is_err() || closing {
            break;
        }
    }
    let _ = client_tx.close().await;
}

/// Client → backend
async fn upstream(
    relay: &Arc<Relay>,
    client_rx: &mut SplitStream<WebSocket>,
    backend_tx: &mut BackendSink,
    out_tx: &mpsc::Sender<Message>,
    long_polls: &mut JoinSet<()>,
) -> Ended {
    while let Some(message) = client_rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => return Ended::ClientError(e.to_string()),
        };

        match message {
            Message::Text(text) => match classify(&text) {
                ClientFrame::Deployer(request) => {
                    let credentials = relay.credentials();
                    if request.is_long_poll() {
                        let relay = relay.clone();
                        let out_tx = out_tx.clone();
                        long_polls.spawn(async move {
                            let reply = relay.deployer.handle(request, credentials).await;
                            let _ = out_tx.send(Message::Text(reply.to_string())).await;
                        });
                    } else {
                        let reply = relay.deployer.handle(request, credentials).await;
                        if out_tx.send(Message::Text(reply.to_string())).await.is_err() {
                            return Ended::ClientClosed;
                        }
                    }
                }
                frame => {
                    if let ClientFrame::Login {
                        request_id,
                        credentials,
                    } = frame
                    {
                        debug!(session_id = %relay.id, user = %credentials.user, "Login requested");
                        relay
                            .login
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .begin(request_id, credentials);
                    }
                    if let Err(e) = backend_tx.send(BackendMessage::Text(text.clone())).await {
                        return Ended::BackendError(e.to_string());
                    }
                    relay
                        .tracer
                        .trace_text(relay.id, Direction::ClientToBackend, &text);
                }
            },
            Message::Binary(data) => {
                let len = data.len();
                if let Err(e) = backend_tx.send(BackendMessage::Binary(data)).await {
                    return Ended::BackendError(e.to_string());
                }
                relay
                    .tracer
                    .trace_binary(relay.id, Direction::ClientToBackend, len);
            }
            Message::Close(frame) => {
                let _ = backend_tx
                    .send(BackendMessage::Close(convert::close_to_backend(frame)))
                    .await;
                return Ended::ClientClosed;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    Ended::ClientClosed
}

/// Backend → client
async fn downstream(
    relay: &Arc<Relay>,
    backend_rx: &mut SplitStream<BackendStream>,
    out_tx: &mpsc::Sender<Message>,
) -> Ended {
    while let Some(message) = backend_rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => return Ended::BackendError(e.to_string()),
        };

        if let BackendMessage::Text(text) = &message {
            observe_login(relay, text);
        }

        let closing = matches!(message, BackendMessage::Close(_));
        let traced = match &message {
            BackendMessage::Text(text) => Some(text.clone()),
            _ => None,
        };
        let binary_len = match &message {
            BackendMessage::Binary(data) => Some(data.len()),
            _ => None,
        };

        if let Some(client_message) = convert::to_client(message) {
            if out_tx.send(client_message).await.is_err() {
                return Ended::ClientClosed;
            }
            if let Some(text) = traced {
                relay
                    .tracer
                    .trace_text(relay.id, Direction::BackendToClient, &text);
            }
            if let Some(len) = binary_len {
                relay
                    .tracer
                    .trace_binary(relay.id, Direction::BackendToClient, len);
            }
        }
        if closing {
            return Ended::BackendClosed;
        }
    }
    Ended::BackendClosed
}

/// Track the login response while one is pending
fn observe_login(relay: &Relay, text: &str) {
    let outcome = {
        let mut login = relay.login.lock().unwrap_or_else(PoisonError::into_inner);
        if !login.in_progress() {
            return;
        }
        login
            .observe_response(text)
            .map(|ok| (ok, login.credentials().map(|c| c.user.clone())))
    };

    match outcome {
        Some((true, user)) => {
            info!(session_id = %relay.id, user = ?user, "Session authenticated");
            relay.state.sessions.set_user(relay.id, user);
        }
        Some((false, _)) => {
            info!(session_id = %relay.id, "Login rejected by backend");
            relay.state.sessions.set_user(relay.id, None);
        }
        None => {}
    }
}
