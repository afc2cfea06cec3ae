pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::config::Identity;
use crate::signaling::SignalSender;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out waiting for the peer connection")]
    Timeout,
    #[error("peer connection closed")]
    Closed,
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("peer connection failed: {0}")]
    Failed(String),
}

/// Options handed to the connector when the manager mints a connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// True when this side called `connection()` first; false when the
    /// connection exists because an inbound negotiation envelope arrived.
    pub initiator: bool,
    /// Parallel channel count requested for the connection.
    pub channels: usize,
}

/// One logical channel to a specific peer.
///
/// The negotiation internals (offer/answer exchange, data framing) live
/// behind this contract and are not the manager's concern.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Resolves once the connection can carry application data; errors if
    /// it closed or failed first.
    async fn ready(&self) -> Result<(), TransportError>;

    async fn send(&self, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Idempotent.
    async fn close(&self);

    /// Feed one negotiation payload forwarded through the relay into the
    /// connection.
    async fn handle_signal(&self, payload: Value);

    /// Kick off outbound negotiation. Called exactly once, by the
    /// initiating side, after the connection has been published in the
    /// registry.
    fn start_negotiation(&self);
}

/// Factory for not-yet-ready peer connections.
///
/// `create` runs while the registry lock is held, which is what makes the
/// two-sided rendezvous race-free; it must not suspend or block.
pub trait PeerConnector: Send + Sync {
    fn create(
        &self,
        local: &Identity,
        peer: Uuid,
        signals: SignalSender,
        options: ConnectOptions,
    ) -> Arc<dyn PeerConnection>;
}
