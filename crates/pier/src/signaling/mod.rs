pub mod envelope;

use std::sync::Mutex;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Identity, ManagerConfig};
use envelope::Envelope;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("registration handshake failed: {0}")]
    Handshake(String),
    #[error("relay acknowledged uuid {received} but {expected} was registered")]
    Registration { expected: Uuid, received: Uuid },
    #[error("signaling channel closed")]
    ChannelClosed,
}

/// A valid envelope that has no business arriving on the dispatch path.
#[derive(Debug, Error)]
#[error("unsupported envelope on dispatch path: {kind}")]
pub struct UnsupportedMessage {
    pub kind: &'static str,
}

/// One frame as seen by the dispatch loop, after the socket layer
/// normalized transport details away.
#[derive(Debug)]
pub enum RelayFrame {
    Text(String),
    /// The socket ended. `error` is `None` for a clean close.
    Closed { error: Option<String> },
}

/// Read half of the relay socket, consumed by the dispatch loop.
pub struct RelayReader {
    stream: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl RelayReader {
    pub async fn next_frame(&mut self) -> RelayFrame {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Text(text)) => return RelayFrame::Text(text),
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => return RelayFrame::Text(text),
                    Err(_) => {
                        warn!(target: "pier::signaling", "dropping non-utf8 binary frame");
                    }
                },
                Ok(Message::Close(_)) => return RelayFrame::Closed { error: None },
                Ok(_) => {}
                Err(
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake),
                ) => return RelayFrame::Closed { error: None },
                Err(err) => {
                    return RelayFrame::Closed {
                        error: Some(err.to_string()),
                    };
                }
            }
        }
        RelayFrame::Closed { error: None }
    }
}

/// Handle a peer connection uses to push its negotiation payloads to the
/// other side of its pair, wrapped in [`Envelope::PeerSignal`].
#[derive(Clone)]
pub struct SignalSender {
    outbound: mpsc::UnboundedSender<Envelope>,
    local: Identity,
    peer: Uuid,
}

impl SignalSender {
    pub fn new(outbound: mpsc::UnboundedSender<Envelope>, local: Identity, peer: Uuid) -> Self {
        Self {
            outbound,
            local,
            peer,
        }
    }

    pub fn send(&self, payload: Value) -> Result<(), SignalingError> {
        self.outbound
            .send(Envelope::PeerSignal {
                source_uuid: self.local.uuid,
                source_name: self.local.name.clone(),
                peer_uuid: self.peer,
                payload,
            })
            .map_err(|_| SignalingError::ChannelClosed)
    }

    pub fn peer(&self) -> Uuid {
        self.peer
    }
}

/// Owns the single persistent connection to the relay.
///
/// Outbound envelopes go through an unbounded channel into a writer task;
/// the read half is handed to the manager's dispatch loop as a
/// [`RelayReader`].
pub struct SignalingClient {
    identity: Identity,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Connect to the relay and perform the registration handshake.
    ///
    /// On any failure the socket tasks are torn down before the error is
    /// returned, so a failed connect leaves nothing running.
    pub async fn connect(
        config: &ManagerConfig,
    ) -> Result<(Self, RelayReader), SignalingError> {
        let connector = tls_connector(config)?;
        let (ws_stream, _) =
            connect_async_tls_with_config(config.relay_url().as_str(), None, false, connector)
                .await
                .map_err(|err| SignalingError::Connect(err.to_string()))?;
        debug!(target: "pier::signaling", url = %config.relay_url(), "relay websocket connected");

        let (mut ws_write, ws_read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                match envelope::encode(&message) {
                    Ok(text) => {
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(target: "pier::signaling", %err, "dropping unencodable envelope");
                    }
                }
            }
            let _ = ws_write.close().await;
        });

        let client = Self {
            identity: config.identity().clone(),
            outbound_tx: Mutex::new(Some(outbound_tx)),
            writer: Mutex::new(Some(writer)),
        };
        let mut reader = RelayReader { stream: ws_read };

        let identity = client.identity.clone();
        client.send(Envelope::Register {
            uuid: identity.uuid,
            name: identity.name.clone(),
        })?;

        let ack = tokio::time::timeout(config.connect_timeout(), await_ack(&mut reader)).await;
        match ack {
            Err(_) => {
                client.close().await;
                Err(SignalingError::Handshake(
                    "timed out waiting for registration response".into(),
                ))
            }
            Ok(Err(reason)) => {
                client.close().await;
                Err(SignalingError::Handshake(reason))
            }
            Ok(Ok(received)) if received != identity.uuid => {
                client.close().await;
                Err(SignalingError::Registration {
                    expected: identity.uuid,
                    received,
                })
            }
            Ok(Ok(_)) => {
                info!(
                    target: "pier::signaling",
                    uuid = %identity.uuid,
                    name = %identity.name,
                    "registered with relay"
                );
                Ok((client, reader))
            }
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn send(&self, message: Envelope) -> Result<(), SignalingError> {
        let guard = self.outbound_tx.lock().expect("outbound sender lock");
        match guard.as_ref() {
            Some(tx) => tx.send(message).map_err(|_| SignalingError::ChannelClosed),
            None => Err(SignalingError::ChannelClosed),
        }
    }

    /// Mint the outbound-signal handle a new peer connection is built with.
    pub fn signal_sender(&self, peer: Uuid) -> Result<SignalSender, SignalingError> {
        let guard = self.outbound_tx.lock().expect("outbound sender lock");
        let tx = guard.as_ref().ok_or(SignalingError::ChannelClosed)?.clone();
        Ok(SignalSender::new(tx, self.identity.clone(), peer))
    }

    /// Close the underlying transport. Idempotent.
    pub async fn close(&self) {
        let tx = self.outbound_tx.lock().expect("outbound sender lock").take();
        drop(tx);
        let handle = self.writer.lock().expect("writer handle lock").take();
        if let Some(handle) = handle {
            // Outstanding SignalSender clones can keep the writer alive past
            // the sender drop above, so cancel instead of waiting it out.
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.writer.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

async fn await_ack(reader: &mut RelayReader) -> Result<Uuid, String> {
    loop {
        match reader.next_frame().await {
            RelayFrame::Closed { error } => {
                return Err(error.unwrap_or_else(|| "relay closed during registration".into()));
            }
            RelayFrame::Text(text) => match envelope::decode(&text) {
                Ok(Envelope::RegisterAck { uuid }) => return Ok(uuid),
                Ok(other) => {
                    debug!(
                        target: "pier::signaling",
                        kind = other.kind(),
                        "ignoring frame before registration ack"
                    );
                }
                Err(err) => {
                    warn!(target: "pier::signaling", %err, "dropping malformed frame during registration");
                }
            },
        }
    }
}

fn tls_connector(config: &ManagerConfig) -> Result<Option<Connector>, SignalingError> {
    if config.verify_certificates() {
        return Ok(None);
    }
    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|err| SignalingError::Connect(format!("tls connector: {err}")))?;
    Ok(Some(Connector::NativeTls(tls)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signal_sender_wraps_payload_in_peer_signal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let local = Identity {
            uuid: Uuid::new_v4(),
            name: "alice".into(),
        };
        let peer = Uuid::new_v4();
        let sender = SignalSender::new(tx, local.clone(), peer);
        sender.send(json!({"kind": "offer"})).unwrap();

        match rx.try_recv().unwrap() {
            Envelope::PeerSignal {
                source_uuid,
                source_name,
                peer_uuid,
                payload,
            } => {
                assert_eq!(source_uuid, local.uuid);
                assert_eq!(source_name, "alice");
                assert_eq!(peer_uuid, peer);
                assert_eq!(payload, json!({"kind": "offer"}));
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn signal_sender_reports_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sender = SignalSender::new(
            tx,
            Identity {
                uuid: Uuid::new_v4(),
                name: "alice".into(),
            },
            Uuid::new_v4(),
        );
        assert!(matches!(
            sender.send(json!({})),
            Err(SignalingError::ChannelClosed)
        ));
    }
}
