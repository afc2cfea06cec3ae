use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::supervisor::GuardedTask;
use crate::transport::PeerConnection;

/// Unordered pair of UUIDs: `PairKey::new(a, b) == PairKey::new(b, a)`.
///
/// At most one peer connection exists per key, regardless of which side
/// initiated negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairKey {
    low: Uuid,
    high: Uuid,
}

impl PairKey {
    pub fn new(a: Uuid, b: Uuid) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }
}

/// The two registries backing a manager: connections and their pump tasks.
///
/// Lives behind one lock and is only ever mutated as a whole, so the two
/// maps cannot diverge.
#[derive(Default)]
pub struct Registry {
    peers: HashMap<PairKey, Arc<dyn PeerConnection>>,
    tasks: HashMap<PairKey, GuardedTask>,
}

impl Registry {
    pub fn get(&self, key: &PairKey) -> Option<Arc<dyn PeerConnection>> {
        self.peers.get(key).cloned()
    }

    pub fn insert(&mut self, key: PairKey, conn: Arc<dyn PeerConnection>, task: GuardedTask) {
        self.peers.insert(key, conn);
        self.tasks.insert(key, task);
    }

    /// Remove both entries for `key`. A pump task removing itself drops its
    /// own handle here, which merely detaches it.
    pub fn remove(&mut self, key: &PairKey) {
        self.peers.remove(key);
        self.tasks.remove(key);
        debug_assert_eq!(self.peers.len(), self.tasks.len());
    }

    /// Take every pump task, leaving the connections in place for the close
    /// sequence to drain.
    pub fn take_tasks(&mut self) -> Vec<GuardedTask> {
        self.tasks.drain().map(|(_, task)| task).collect()
    }

    pub fn drain_peers(&mut self) -> Vec<Arc<dyn PeerConnection>> {
        self.peers.drain().map(|(_, conn)| conn).collect()
    }

    pub fn abort_tasks(&mut self) {
        for task in self.tasks.values() {
            task.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
