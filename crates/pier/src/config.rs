use std::time::Duration;
use url::Url;
use uuid::Uuid;

use crate::manager::ManagerError;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Process-wide identity of a manager instance, immutable after construction.
#[derive(Debug, Clone)]
pub struct Identity {
    pub uuid: Uuid,
    pub name: String,
}

/// Configuration for a [`crate::manager::PeerManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    relay_url: Url,
    identity: Identity,
    connect_timeout: Duration,
    channels_per_peer: usize,
    verify_certificates: bool,
}

impl ManagerConfig {
    /// Validates the relay address before any I/O: only websocket schemes
    /// are accepted.
    pub fn new(uuid: Uuid, relay_url: impl AsRef<str>) -> Result<Self, ManagerError> {
        let raw = relay_url.as_ref().trim();
        if raw.is_empty() {
            return Err(ManagerError::Validation(
                "relay url cannot be empty".into(),
            ));
        }
        let parsed = Url::parse(raw)
            .map_err(|err| ManagerError::Validation(format!("invalid relay url: {err}")))?;
        match parsed.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(ManagerError::Validation(format!(
                    "unsupported relay url scheme '{other}', expected ws or wss"
                )));
            }
        }
        Ok(Self {
            relay_url: parsed,
            identity: Identity {
                uuid,
                name: default_display_name(uuid),
            },
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            channels_per_peer: 1,
            verify_certificates: true,
        })
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.identity.name = name.into();
        self
    }

    /// Bound for the registration handshake and for peer readiness in the
    /// pump tasks.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Parallel channel count requested from the connector per peer
    /// connection.
    pub fn with_channels_per_peer(mut self, channels: usize) -> Self {
        self.channels_per_peer = channels.max(1);
        self
    }

    pub fn with_verify_certificates(mut self, verify: bool) -> Self {
        self.verify_certificates = verify;
        self
    }

    pub fn relay_url(&self) -> &Url {
        &self.relay_url
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn channels_per_peer(&self) -> usize {
        self.channels_per_peer
    }

    pub fn verify_certificates(&self) -> bool {
        self.verify_certificates
    }
}

fn default_display_name(uuid: Uuid) -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| uuid.to_string())
}
