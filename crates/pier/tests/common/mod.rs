//! In-process relay stub for manager integration tests.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::debug;
use uuid::Uuid;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Poll `probe` until it reports true or five seconds elapse.
#[allow(dead_code)]
pub async fn wait_for<F, Fut>(what: &str, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if probe().await {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Minimal relay: acknowledges registrations and forwards peer signals to
/// the client registered under `peer_uuid`.
pub struct RelayStub {
    url: String,
    state: Arc<StubState>,
    server: JoinHandle<()>,
}

#[derive(Default)]
struct StubState {
    clients: AsyncMutex<HashMap<Uuid, mpsc::UnboundedSender<WsMessage>>>,
    registrations: AtomicUsize,
    ack_override: StdMutex<Option<Uuid>>,
}

impl RelayStub {
    pub async fn start() -> Self {
        let state = Arc::new(StubState::default());
        let router = Router::new()
            .route("/ws", get(ws_handler))
            .with_state(Arc::clone(&state));
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind relay stub");
        let addr: SocketAddr = listener.local_addr().expect("relay stub addr");
        let server = tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        Self {
            url: format!("ws://{addr}/ws"),
            state,
            server,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    #[allow(dead_code)]
    pub fn registration_count(&self) -> usize {
        self.state.registrations.load(Ordering::SeqCst)
    }

    /// Acknowledge the next registration with this uuid instead of the
    /// client's own.
    #[allow(dead_code)]
    pub fn override_next_ack(&self, uuid: Uuid) {
        *self
            .state
            .ack_override
            .lock()
            .expect("ack override lock") = Some(uuid);
    }

    /// Push a raw text frame to a registered client.
    #[allow(dead_code)]
    pub async fn inject(&self, target: Uuid, text: impl Into<String>) {
        let clients = self.state.clients.lock().await;
        let tx = clients.get(&target).expect("target not registered");
        tx.send(WsMessage::Text(text.into()))
            .expect("relay stub send");
    }
}

impl Drop for RelayStub {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<StubState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<StubState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut self_uuid: Option<Uuid> = None;
    while let Some(Ok(message)) = receiver.next().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        match value.get("type").and_then(Value::as_str) {
            Some("register") => {
                let Some(uuid) = value
                    .get("uuid")
                    .and_then(Value::as_str)
                    .and_then(|raw| Uuid::parse_str(raw).ok())
                else {
                    continue;
                };
                state.clients.lock().await.insert(uuid, tx.clone());
                self_uuid = Some(uuid);
                state.registrations.fetch_add(1, Ordering::SeqCst);
                let ack = state
                    .ack_override
                    .lock()
                    .expect("ack override lock")
                    .take()
                    .unwrap_or(uuid);
                debug!(%uuid, %ack, "stub: registered client");
                let frame = json!({"type": "register_ack", "uuid": ack});
                if tx.send(WsMessage::Text(frame.to_string())).is_err() {
                    break;
                }
            }
            Some("peer_signal") => {
                let Some(peer) = value
                    .get("peer_uuid")
                    .and_then(Value::as_str)
                    .and_then(|raw| Uuid::parse_str(raw).ok())
                else {
                    continue;
                };
                let clients = state.clients.lock().await;
                match clients.get(&peer) {
                    Some(peer_tx) => {
                        let _ = peer_tx.send(WsMessage::Text(text.clone()));
                    }
                    None => debug!(%peer, "stub: dropping signal for unknown peer"),
                }
            }
            _ => {}
        }
    }

    if let Some(uuid) = self_uuid {
        state.clients.lock().await.remove(&uuid);
    }
    send_task.abort();
}
