pub mod registry;

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::signaling::envelope::{self, Envelope};
use crate::signaling::{RelayFrame, RelayReader, SignalingClient, SignalingError, UnsupportedMessage};
use crate::supervisor::{GuardedTask, TaskOutcome};
use crate::transport::{ConnectOptions, PeerConnection, PeerConnector, TransportError};
use registry::{PairKey, Registry};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("invalid relay address: {0}")]
    Validation(String),
    #[error("relay acknowledged uuid {received} but {expected} was registered")]
    Registration { expected: Uuid, received: Uuid },
    #[error("signaling handshake failed: {0}")]
    Handshake(String),
    #[error("peer {peer} did not become ready in time")]
    ConnectionTimeout { peer: Uuid },
    #[error("peer connection error: {0}")]
    Connection(String),
    #[error("manager is not active")]
    Closed,
}

impl From<SignalingError> for ManagerError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::Registration { expected, received } => {
                ManagerError::Registration { expected, received }
            }
            other => ManagerError::Handshake(other.to_string()),
        }
    }
}

/// Lifecycle of a manager instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Registering,
    Active,
    Closing,
    Closed,
}

/// Orchestrates peer connections over one signaling relay session.
///
/// Owns the connection and pump-task registries, the dispatch loop reading
/// the relay socket, and the shared inbound queue that [`PeerManager::recv`]
/// drains.
pub struct PeerManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ManagerConfig,
    connector: Arc<dyn PeerConnector>,
    registry: AsyncMutex<Registry>,
    state: AsyncMutex<ManagerState>,
    signaling: AsyncMutex<Option<Arc<SignalingClient>>>,
    dispatch: AsyncMutex<Option<GuardedTask>>,
    inbound_tx: StdMutex<Option<mpsc::UnboundedSender<(Uuid, Vec<u8>)>>>,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<(Uuid, Vec<u8>)>>,
}

impl PeerManager {
    /// The config carries the validated relay address; construction itself
    /// performs no I/O.
    pub fn new(config: ManagerConfig, connector: Arc<dyn PeerConnector>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ManagerInner {
                config,
                connector,
                registry: AsyncMutex::new(Registry::default()),
                state: AsyncMutex::new(ManagerState::Uninitialized),
                signaling: AsyncMutex::new(None),
                dispatch: AsyncMutex::new(None),
                inbound_tx: StdMutex::new(Some(inbound_tx)),
                inbound_rx: AsyncMutex::new(inbound_rx),
            }),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.config.identity().uuid
    }

    pub fn name(&self) -> &str {
        &self.inner.config.identity().name
    }

    pub async fn state(&self) -> ManagerState {
        *self.inner.state.lock().await
    }

    /// Number of live peer connections; the pump-task registry always has
    /// the same size.
    pub async fn connection_count(&self) -> usize {
        self.inner.registry.lock().await.len()
    }

    /// Register with the relay and start the dispatch loop.
    ///
    /// Idempotent: calling this on an already-registered manager opens no
    /// second socket and spawns no second dispatch task. The state lock is
    /// held across the whole handshake, so a concurrent caller awaits the
    /// in-flight attempt and then either sees it succeed or runs its own;
    /// nobody is told `Ok` for a handshake that later failed. A failed
    /// handshake leaves no background task running and the manager can
    /// retry.
    pub async fn init(&self) -> Result<(), ManagerError> {
        let mut state = self.inner.state.lock().await;
        match *state {
            ManagerState::Active => return Ok(()),
            ManagerState::Closing | ManagerState::Closed => return Err(ManagerError::Closed),
            ManagerState::Uninitialized | ManagerState::Registering => {}
        }
        *state = ManagerState::Registering;

        match SignalingClient::connect(&self.inner.config).await {
            Ok((client, reader)) => {
                let client = Arc::new(client);
                *self.inner.signaling.lock().await = Some(Arc::clone(&client));
                let task = GuardedTask::spawn(
                    "signaling-dispatch",
                    run_dispatch(Arc::clone(&self.inner), client, reader),
                );
                *self.inner.dispatch.lock().await = Some(task);
                *state = ManagerState::Active;
                info!(target: "pier::manager", uuid = %self.uuid(), "manager active");
                Ok(())
            }
            Err(err) => {
                *state = ManagerState::Uninitialized;
                Err(err.into())
            }
        }
    }

    /// Resolve or create the single connection for `{self, peer}`.
    ///
    /// Race-free against the dispatch loop creating the same pair for a
    /// concurrently arriving inbound offer: both paths insert under the
    /// registry lock before the outbound offer is sent.
    pub async fn connection(&self, peer: Uuid) -> Result<Arc<dyn PeerConnection>, ManagerError> {
        let client = self
            .inner
            .signaling
            .lock()
            .await
            .clone()
            .ok_or(ManagerError::Closed)?;
        self.inner.resolve_connection(&client, peer, true).await
    }

    /// Send one application message, waiting up to `timeout` for the
    /// connection to become ready.
    ///
    /// On timeout or failure the connection's own pump task performs the
    /// registry teardown; this method only reports the error.
    pub async fn send(
        &self,
        peer: Uuid,
        message: Vec<u8>,
        timeout: Duration,
    ) -> Result<(), ManagerError> {
        let conn = self.connection(peer).await?;
        match tokio::time::timeout(timeout, conn.ready()).await {
            Err(_) => Err(ManagerError::ConnectionTimeout { peer }),
            Ok(Err(err)) => Err(ManagerError::Connection(err.to_string())),
            Ok(Ok(())) => conn
                .send(message)
                .await
                .map_err(|err| ManagerError::Connection(err.to_string())),
        }
    }

    /// Next inbound `(peer, message)` entry. Pends until one is available;
    /// a failed peer simply stops producing entries, it never surfaces an
    /// error here. Returns `None` once the manager has been closed and the
    /// queue is drained.
    pub async fn recv(&self) -> Option<(Uuid, Vec<u8>)> {
        let mut rx = self.inner.inbound_rx.lock().await;
        rx.recv().await
    }

    /// Ordered teardown. Safe to call at any point, including after a
    /// failed or absent `init`, and more than once.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if matches!(*state, ManagerState::Closing | ManagerState::Closed) {
                return;
            }
            *state = ManagerState::Closing;
        }

        if let Some(task) = self.inner.dispatch.lock().await.take() {
            task.shutdown().await;
        }

        let tasks = {
            let mut registry = self.inner.registry.lock().await;
            registry.take_tasks()
        };
        for task in tasks {
            task.shutdown().await;
        }

        {
            let mut registry = self.inner.registry.lock().await;
            for conn in registry.drain_peers() {
                conn.close().await;
            }
        }

        if let Some(client) = self.inner.signaling.lock().await.take() {
            client.close().await;
        }

        self.inner
            .inbound_tx
            .lock()
            .expect("inbound sender lock")
            .take();
        *self.inner.state.lock().await = ManagerState::Closed;
        info!(target: "pier::manager", uuid = %self.uuid(), "manager closed");
    }
}

impl Drop for PeerManager {
    fn drop(&mut self) {
        // Best-effort teardown when the manager goes out of scope without
        // an explicit close().
        if let Ok(mut guard) = self.inner.dispatch.try_lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
        if let Ok(mut registry) = self.inner.registry.try_lock() {
            registry.abort_tasks();
        }
    }
}

impl ManagerInner {
    async fn resolve_connection(
        self: &Arc<Self>,
        client: &Arc<SignalingClient>,
        peer: Uuid,
        initiator: bool,
    ) -> Result<Arc<dyn PeerConnection>, ManagerError> {
        let key = PairKey::new(self.config.identity().uuid, peer);
        let mut registry = self.registry.lock().await;
        if let Some(existing) = registry.get(&key) {
            return Ok(existing);
        }

        // close() moves to Closing before it drains the registry, so a
        // creation racing teardown is refused here instead of registering
        // a pump task close() would never shut down.
        {
            let state = self.state.lock().await;
            if matches!(*state, ManagerState::Closing | ManagerState::Closed) {
                return Err(ManagerError::Closed);
            }
        }

        let signals = client.signal_sender(peer).map_err(|_| ManagerError::Closed)?;
        let inbound = self
            .inbound_tx
            .lock()
            .expect("inbound sender lock")
            .clone()
            .ok_or(ManagerError::Closed)?;
        let conn = self.connector.create(
            self.config.identity(),
            peer,
            signals,
            ConnectOptions {
                initiator,
                channels: self.config.channels_per_peer(),
            },
        );
        let pump = GuardedTask::spawn(
            format!("peer-pump-{peer}"),
            run_pump(Arc::clone(self), key, peer, Arc::clone(&conn), inbound),
        );
        registry.insert(key, Arc::clone(&conn), pump);
        drop(registry);
        debug!(target: "pier::manager", %peer, initiator, "created peer connection");

        // The new entry is already visible to the dispatch loop; only now
        // does the initiating side open negotiation.
        if initiator {
            conn.start_negotiation();
        }
        Ok(conn)
    }

    async fn teardown_pair(&self, key: PairKey, conn: &Arc<dyn PeerConnection>) {
        conn.close().await;
        let mut registry = self.registry.lock().await;
        registry.remove(&key);
    }
}

/// Dispatch loop: decode inbound relay frames and route negotiation
/// payloads into the right peer connection. Runs once per manager, under
/// the guarded-task supervisor.
async fn run_dispatch(
    inner: Arc<ManagerInner>,
    client: Arc<SignalingClient>,
    mut reader: RelayReader,
) -> TaskOutcome {
    let local = inner.config.identity().uuid;
    loop {
        match reader.next_frame().await {
            RelayFrame::Closed { error: None } => {
                debug!(target: "pier::manager", "relay session ended");
                break;
            }
            RelayFrame::Closed { error: Some(err) } => {
                warn!(target: "pier::manager", %err, "relay session ended with transport error");
                break;
            }
            RelayFrame::Text(text) => match envelope::decode(&text) {
                Err(err) => {
                    warn!(target: "pier::manager", %err, "dropping malformed relay frame");
                }
                Ok(Envelope::PeerSignal {
                    source_uuid,
                    source_name,
                    peer_uuid,
                    payload,
                }) => {
                    if peer_uuid != local {
                        warn!(
                            target: "pier::manager",
                            %peer_uuid,
                            "dropping peer signal addressed to another client"
                        );
                        continue;
                    }
                    if source_uuid == local {
                        warn!(target: "pier::manager", "dropping peer signal from ourselves");
                        continue;
                    }
                    debug!(
                        target: "pier::manager",
                        source = %source_name,
                        %source_uuid,
                        "routing inbound peer signal"
                    );
                    match inner.resolve_connection(&client, source_uuid, false).await {
                        Ok(conn) => conn.handle_signal(payload).await,
                        Err(err) => {
                            warn!(
                                target: "pier::manager",
                                %source_uuid,
                                %err,
                                "failed to resolve connection for inbound signal"
                            );
                        }
                    }
                }
                Ok(other) => {
                    // The manager never issues request/response calls, so a
                    // relay acknowledgement (or a registration request) has
                    // no business arriving here.
                    let unsupported = UnsupportedMessage { kind: other.kind() };
                    error!(target: "pier::manager", %unsupported, "ignoring envelope");
                }
            },
        }
    }
    TaskOutcome::Completed
}

/// Per-connection pump: wait for readiness, then move inbound application
/// messages into the shared queue until the connection ends.
///
/// Every exit path is an expected one as far as the supervisor is
/// concerned; failures are contained here and never reach other peers.
async fn run_pump(
    inner: Arc<ManagerInner>,
    key: PairKey,
    peer: Uuid,
    conn: Arc<dyn PeerConnection>,
    inbound: mpsc::UnboundedSender<(Uuid, Vec<u8>)>,
) -> TaskOutcome {
    match tokio::time::timeout(inner.config.connect_timeout(), conn.ready()).await {
        Err(_) => {
            warn!(target: "pier::manager", %peer, "peer connection did not become ready in time");
            inner.teardown_pair(key, &conn).await;
            return TaskOutcome::CancelledExpected;
        }
        Ok(Err(err)) => {
            warn!(target: "pier::manager", %peer, %err, "peer connection failed during negotiation");
            inner.teardown_pair(key, &conn).await;
            return TaskOutcome::CancelledExpected;
        }
        Ok(Ok(())) => {
            debug!(target: "pier::manager", %peer, "peer connection ready");
        }
    }

    loop {
        match conn.recv().await {
            Ok(payload) => {
                if inbound.send((peer, payload)).is_err() {
                    break;
                }
            }
            Err(TransportError::Closed | TransportError::ChannelClosed) => {
                debug!(target: "pier::manager", %peer, "peer connection closed");
                break;
            }
            Err(err) => {
                warn!(target: "pier::manager", %peer, %err, "peer connection receive error");
                break;
            }
        }
    }
    inner.teardown_pair(key, &conn).await;
    TaskOutcome::CancelledExpected
}
