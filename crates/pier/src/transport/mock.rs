//! In-memory peer connections for tests and examples.
//!
//! Two mock connections created for the same unordered pair share a pair of
//! channels inside a [`MockNetwork`], and run a miniature offer/answer
//! negotiation over the relay so the manager's rendezvous and dispatch
//! paths are exercised for real.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::debug;
use uuid::Uuid;

use crate::config::Identity;
use crate::signaling::SignalSender;

use super::{ConnectOptions, PeerConnection, PeerConnector, TransportError};

/// Shared fabric connecting mock endpoints by unordered UUID pair.
#[derive(Default)]
pub struct MockNetwork {
    links: Mutex<HashMap<(Uuid, Uuid), Link>>,
}

struct Link {
    low_to_high: Slot,
    high_to_low: Slot,
}

struct Slot {
    tx: UnboundedSender<Vec<u8>>,
    rx: Option<UnboundedReceiver<Vec<u8>>>,
}

impl Link {
    fn new() -> Self {
        let (low_tx, low_rx) = unbounded_channel();
        let (high_tx, high_rx) = unbounded_channel();
        Self {
            low_to_high: Slot {
                tx: low_tx,
                rx: Some(low_rx),
            },
            high_to_low: Slot {
                tx: high_tx,
                rx: Some(high_rx),
            },
        }
    }
}

fn ordered(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b { (a, b) } else { (b, a) }
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the endpoint for `local` on the `{local, peer}` link.
    fn endpoint(
        &self,
        local: Uuid,
        peer: Uuid,
    ) -> (UnboundedSender<Vec<u8>>, UnboundedReceiver<Vec<u8>>) {
        let mut links = self.links.lock().expect("mock network lock");
        let link = links.entry(ordered(local, peer)).or_insert_with(Link::new);
        if local <= peer {
            let rx = link
                .high_to_low
                .rx
                .take()
                .expect("mock endpoint claimed twice");
            (link.low_to_high.tx.clone(), rx)
        } else {
            let rx = link
                .low_to_high
                .rx
                .take()
                .expect("mock endpoint claimed twice");
            (link.high_to_low.tx.clone(), rx)
        }
    }

    fn drop_link(&self, a: Uuid, b: Uuid) {
        self.links
            .lock()
            .expect("mock network lock")
            .remove(&ordered(a, b));
    }
}

pub struct MockConnection {
    local: Uuid,
    peer: Uuid,
    signals: SignalSender,
    network: Arc<MockNetwork>,
    tx: Mutex<Option<UnboundedSender<Vec<u8>>>>,
    rx: AsyncMutex<UnboundedReceiver<Vec<u8>>>,
    ready: Notify,
    ready_flag: AtomicBool,
    closed: AtomicBool,
    responsive: bool,
}

impl MockConnection {
    fn mark_ready(&self) {
        if !self.ready_flag.swap(true, Ordering::SeqCst) {
            debug!(target: "pier::mock", peer = %self.peer, "mock connection ready");
            self.ready.notify_waiters();
        }
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn ready(&self) -> Result<(), TransportError> {
        loop {
            // Register for the notification before checking the flags so a
            // concurrent mark_ready/close cannot slip between check and await.
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            if self.ready_flag.load(Ordering::SeqCst) {
                return Ok(());
            }
            notified.await;
        }
    }

    async fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let guard = self.tx.lock().expect("mock sender lock");
        match guard.as_ref() {
            Some(tx) => tx.send(payload).map_err(|_| TransportError::ChannelClosed),
            None => Err(TransportError::Closed),
        }
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tx.lock().expect("mock sender lock").take();
        self.network.drop_link(self.local, self.peer);
        self.ready.notify_waiters();
    }

    async fn handle_signal(&self, payload: Value) {
        if !self.responsive || self.closed.load(Ordering::SeqCst) {
            return;
        }
        match payload.get("kind").and_then(Value::as_str) {
            Some("offer") => {
                let _ = self.signals.send(json!({"kind": "answer"}));
                self.mark_ready();
            }
            Some("answer") => self.mark_ready(),
            other => {
                debug!(target: "pier::mock", kind = ?other, "ignoring unknown mock signal");
            }
        }
    }

    fn start_negotiation(&self) {
        if !self.responsive {
            return;
        }
        let _ = self.signals.send(json!({"kind": "offer"}));
    }
}

/// Connector producing [`MockConnection`]s over a shared [`MockNetwork`].
pub struct MockConnector {
    network: Arc<MockNetwork>,
    responsive: bool,
}

impl MockConnector {
    pub fn new(network: Arc<MockNetwork>) -> Self {
        Self {
            network,
            responsive: true,
        }
    }

    /// A connector whose connections never complete negotiation; useful for
    /// readiness-timeout tests.
    pub fn unresponsive(network: Arc<MockNetwork>) -> Self {
        Self {
            network,
            responsive: false,
        }
    }
}

impl PeerConnector for MockConnector {
    fn create(
        &self,
        local: &Identity,
        peer: Uuid,
        signals: SignalSender,
        _options: ConnectOptions,
    ) -> Arc<dyn PeerConnection> {
        let (tx, rx) = self.network.endpoint(local.uuid, peer);
        Arc::new(MockConnection {
            local: local.uuid,
            peer,
            signals,
            network: Arc::clone(&self.network),
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
            ready: Notify::new(),
            ready_flag: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            responsive: self.responsive,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::envelope::Envelope;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn identity(name: &str) -> Identity {
        Identity {
            uuid: Uuid::new_v4(),
            name: name.into(),
        }
    }

    /// Wire two mock connections together, playing relay by forwarding each
    /// side's outbound signals into the other side's handler.
    async fn negotiated_pair() -> (Arc<dyn PeerConnection>, Arc<dyn PeerConnection>) {
        let network = MockNetwork::new();
        let alice = identity("alice");
        let bob = identity("bob");
        let (alice_tx, mut alice_out) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_out) = mpsc::unbounded_channel();

        let connector = MockConnector::new(Arc::clone(&network));
        let a = connector.create(
            &alice,
            bob.uuid,
            SignalSender::new(alice_tx, alice.clone(), bob.uuid),
            ConnectOptions {
                initiator: true,
                channels: 1,
            },
        );
        let b = connector.create(
            &bob,
            alice.uuid,
            SignalSender::new(bob_tx, bob.clone(), alice.uuid),
            ConnectOptions {
                initiator: false,
                channels: 1,
            },
        );

        a.start_negotiation();
        let relay_a = Arc::clone(&b);
        tokio::spawn(async move {
            while let Some(Envelope::PeerSignal { payload, .. }) = alice_out.recv().await {
                relay_a.handle_signal(payload).await;
            }
        });
        let relay_b = Arc::clone(&a);
        tokio::spawn(async move {
            while let Some(Envelope::PeerSignal { payload, .. }) = bob_out.recv().await {
                relay_b.handle_signal(payload).await;
            }
        });

        tokio::time::timeout(Duration::from_secs(1), a.ready())
            .await
            .expect("initiator never became ready")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), b.ready())
            .await
            .expect("responder never became ready")
            .unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn offer_answer_negotiation_completes() {
        let _ = negotiated_pair().await;
    }

    #[tokio::test]
    async fn payloads_cross_the_link() {
        let (a, b) = negotiated_pair().await;
        a.send(b"ping".to_vec()).await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"ping");

        b.send(b"pong".to_vec()).await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), a.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"pong");
    }

    #[tokio::test]
    async fn close_fails_pending_ready_waiters() {
        let network = MockNetwork::new();
        let alice = identity("alice");
        let peer = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = MockConnector::unresponsive(Arc::clone(&network)).create(
            &alice,
            peer,
            SignalSender::new(tx, alice.clone(), peer),
            ConnectOptions {
                initiator: true,
                channels: 1,
            },
        );

        let waiter = Arc::clone(&conn);
        let handle = tokio::spawn(async move { waiter.ready().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close().await;
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn peer_recv_ends_after_close() {
        let (a, b) = negotiated_pair().await;
        a.close().await;
        let result = tokio::time::timeout(Duration::from_secs(1), b.recv())
            .await
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
