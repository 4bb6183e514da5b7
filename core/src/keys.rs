//! Pre-shared key resolution for the DTLS handshake.
//!
//! During a handshake the layer-graph engine asks for the key matching a
//! peer identity and key id. Resolution walks an ordered, append-only
//! chain of [`KeyResolver`]s: first registered is tried first, and the
//! first non-`None` answer wins. The registry seeds the fixed default
//! resolvers before any caller registration, so a later generic resolver
//! can never shadow the bootstrap contract.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

/// Opaque identity of a remote peer (e.g. a Bluetooth address).
///
/// Scopes key resolution and stack association; distinct from a
/// [`PeerDescriptor`](crate::peer::PeerDescriptor), which says how to
/// physically reach the peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeKey(String);

impl NodeKey {
    pub fn new(value: impl Into<String>) -> Self {
        NodeKey(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeKey {
    fn from(value: &str) -> Self {
        NodeKey::new(value)
    }
}

/// Key identity for the "hello" default resolver.
pub const HELLO_KEY_IDENTITY: &[u8] = b"hello";

/// 16-byte key for the "hello" identity. Part of the bootstrap handshake
/// contract with device firmware; preserved byte-for-byte.
pub const HELLO_KEY: [u8; 16] = [
    0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, //
    0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c,
];

/// Key identity for the bootstrap default resolver.
pub const BOOTSTRAP_KEY_IDENTITY: &[u8] = b"BOOTSTRAP";

/// 16-byte key for the "BOOTSTRAP" identity. Part of the bootstrap
/// handshake contract with device firmware; preserved byte-for-byte.
pub const BOOTSTRAP_KEY: [u8; 16] = [
    0x81, 0x06, 0x54, 0x36, 0x85, 0x21, 0xf3, 0x64, //
    0x0e, 0xab, 0xfb, 0xb4, 0x52, 0x32, 0x5d, 0x75,
];

/// Resolves a pre-shared key from a key identity.
///
/// Returning `None` is not an error; it means "try the next resolver in
/// the chain". Only exhausting the whole chain is a handshake-level miss,
/// surfaced by the DTLS layer.
pub trait KeyResolver: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &str;

    /// Resolve `key_id` for `node`, or `None` to delegate.
    fn resolve_key(&self, node: &NodeKey, key_id: &[u8]) -> Option<Vec<u8>>;
}

/// Resolver holding a single identity → key pair, ignoring the peer.
pub struct StaticKeyResolver {
    name: String,
    key_id: Vec<u8>,
    key: Vec<u8>,
}

impl StaticKeyResolver {
    pub fn new(name: impl Into<String>, key_id: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            key_id: key_id.into(),
            key: key.into(),
        }
    }
}

impl KeyResolver for StaticKeyResolver {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve_key(&self, _node: &NodeKey, key_id: &[u8]) -> Option<Vec<u8>> {
        if key_id == self.key_id.as_slice() {
            Some(self.key.clone())
        } else {
            None
        }
    }
}

/// Ordered, append-only chain of key resolvers.
///
/// Constructed once and passed explicitly into stack construction;
/// concurrent resolution during registration is safe (the chain is
/// snapshotted under a read lock before traversal).
pub struct KeyResolverRegistry {
    chain: RwLock<Vec<Arc<dyn KeyResolver>>>,
}

impl KeyResolverRegistry {
    /// Registry seeded with the default resolvers: "hello" first, then
    /// "BOOTSTRAP".
    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        registry.register(Arc::new(StaticKeyResolver::new(
            "hello",
            HELLO_KEY_IDENTITY,
            HELLO_KEY,
        )));
        registry.register(Arc::new(StaticKeyResolver::new(
            "bootstrap",
            BOOTSTRAP_KEY_IDENTITY,
            BOOTSTRAP_KEY,
        )));
        registry
    }

    /// Registry with no resolvers at all.
    pub fn empty() -> Self {
        Self {
            chain: RwLock::new(Vec::new()),
        }
    }

    /// Append a resolver to the end of the chain. Registration order is
    /// resolution order; there is no removal.
    pub fn register(&self, resolver: Arc<dyn KeyResolver>) {
        let mut chain = self.chain.write();
        debug!(resolver = resolver.name(), position = chain.len(), "key resolver registered");
        chain.push(resolver);
    }

    /// Walk the chain first-registered-first-tried, stopping at the first
    /// non-`None` result.
    pub fn resolve(&self, node: &NodeKey, key_id: &[u8]) -> Option<Vec<u8>> {
        let snapshot: Vec<Arc<dyn KeyResolver>> = self.chain.read().clone();
        for resolver in &snapshot {
            if let Some(key) = resolver.resolve_key(node, key_id) {
                debug!(
                    resolver = resolver.name(),
                    node = %node,
                    key_id = %String::from_utf8_lossy(key_id),
                    "key resolved"
                );
                return Some(key);
            }
        }
        debug!(
            node = %node,
            key_id = %String::from_utf8_lossy(key_id),
            "no resolver matched key id"
        );
        None
    }

    /// Number of registered resolvers.
    pub fn len(&self) -> usize {
        self.chain.read().len()
    }

    /// True when no resolvers are registered.
    pub fn is_empty(&self) -> bool {
        self.chain.read().is_empty()
    }
}

impl Default for KeyResolverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
