//! Peer-to-peer connection management over a shared signaling relay.
//!
//! A [`PeerManager`] registers with a relay over one persistent websocket,
//! forwards opaque negotiation payloads between peers, and maintains at
//! most one [`transport::PeerConnection`] per unordered peer pair. The
//! relay carries negotiation only; application data flows over the peer
//! connections themselves, whose implementation is supplied through a
//! [`transport::PeerConnector`].

pub mod config;
pub mod manager;
pub mod signaling;
pub mod supervisor;
pub mod transport;

pub use config::{Identity, ManagerConfig};
pub use manager::{ManagerError, PeerManager};
pub use transport::{ConnectOptions, PeerConnection, PeerConnector};
