//! Keyed peer registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::keys::NodeKey;

/// Registry of per-peer objects keyed by [`NodeKey`].
///
/// The factory runs at most once per key; concurrent
/// [`get_or_create`](Self::get_or_create) calls for the same key all
/// receive the same instance.
pub struct PeerManager<P: Send + Sync> {
    peers: RwLock<HashMap<NodeKey, Arc<P>>>,
    factory: Box<dyn Fn(&NodeKey) -> Arc<P> + Send + Sync>,
}

impl<P: Send + Sync> PeerManager<P> {
    pub fn new(factory: impl Fn(&NodeKey) -> Arc<P> + Send + Sync + 'static) -> Self {
        PeerManager {
            peers: RwLock::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    /// Return the peer for `node_key`, creating it on first use.
    pub fn get_or_create(&self, node_key: &NodeKey) -> Arc<P> {
        if let Some(peer) = self.peers.read().get(node_key) {
            return Arc::clone(peer);
        }
        let mut peers = self.peers.write();
        // Re-check under the write lock: another caller may have raced
        // the factory for the same key.
        if let Some(peer) = peers.get(node_key) {
            return Arc::clone(peer);
        }
        let peer = (self.factory)(node_key);
        peers.insert(node_key.clone(), Arc::clone(&peer));
        peer
    }

    pub fn get(&self, node_key: &NodeKey) -> Option<Arc<P>> {
        self.peers.read().get(node_key).map(Arc::clone)
    }

    /// Drop the peer from the registry. Outstanding `Arc`s stay valid;
    /// the next `get_or_create` builds a fresh instance.
    pub fn remove(&self, node_key: &NodeKey) -> Option<Arc<P>> {
        self.peers.write().remove(node_key)
    }

    pub fn node_keys(&self) -> Vec<NodeKey> {
        self.peers.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
