//! In-process layer-graph engine.
//!
//! Stands in for the native layer graph wherever a real transport is not
//! involved: tests, tooling and the demo binary. Stack instances live in
//! an arena indexed by [`RawStackHandle`], ports in a table keyed by
//! opaque ids, so every operation on a released resource is a checked
//! lookup. The protocol layers themselves are identity transforms; the
//! DTLS handshake is simulated far enough to exercise key resolution and
//! status projection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::StackRole;
use crate::error::codes;
use crate::keys::{KeyResolverRegistry, NodeKey};
use crate::port::{PortPair, SharedPortDataListener, SinkRef, SourceRef};
use crate::runtime::driver::{
    CreateStackRequest, RawStackHandle, StackDriver, StackEventListener,
};
use crate::stack::event::{dtls_state, event_ids};

/// What happens to bytes written into a sink.
enum SinkWiring {
    /// Hand the bytes to the listener registered on this source.
    DeliverTo(u64),
    /// Relay the bytes into another sink.
    ForwardTo(u64),
}

struct StackInstance {
    node_key: NodeKey,
    role: StackRole,
    has_dtls: bool,
    transport_source: SourceRef,
    top: PortPair,
    listener: Option<Arc<dyn StackEventListener>>,
    key_resolvers: Arc<KeyResolverRegistry>,
    started: bool,
    mtu: u32,
}

#[derive(Default)]
struct Tables {
    stacks: Vec<Option<StackInstance>>,
    sinks: HashMap<u64, SinkWiring>,
    sources: HashMap<u64, Option<SharedPortDataListener>>,
}

struct Shared {
    tables: Mutex<Tables>,
    next_port: AtomicU64,
}

impl Shared {
    fn alloc_port(&self) -> u64 {
        self.next_port.fetch_add(1, Ordering::Relaxed)
    }

    /// Deliver bytes to the listener on `source`, outside the table lock.
    fn deliver(&self, source: u64, data: &[u8]) {
        let listener = {
            let tables = self.tables.lock();
            match tables.sources.get(&source) {
                Some(Some(listener)) => Some(Arc::clone(listener)),
                _ => None,
            }
        };
        if let Some(listener) = listener {
            listener.on_data(data);
        }
    }
}

/// In-process [`StackDriver`] with linked port pipes.
pub struct LoopbackDriver {
    shared: Arc<Shared>,
    /// PSK identity the simulated handshake offers to the resolver chain.
    offered_psk_identity: Vec<u8>,
}

impl LoopbackDriver {
    pub fn new() -> Self {
        Self::with_psk_identity(crate::keys::HELLO_KEY_IDENTITY.to_vec())
    }

    /// Engine offering a specific PSK identity during the simulated
    /// handshake. An identity no resolver knows produces a DTLS `Error`
    /// status with a TLS-range code.
    pub fn with_psk_identity(identity: Vec<u8>) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                next_port: AtomicU64::new(1),
            }),
            offered_psk_identity: identity,
        }
    }

    /// Create two linked transport endpoints: bytes written into one
    /// pair's sink surface on the other pair's source.
    pub fn create_port_pair(&self) -> (PortPair, PortPair) {
        let mut tables = self.shared.tables.lock();
        let (sink_a, source_a) = (self.shared.alloc_port(), self.shared.alloc_port());
        let (sink_b, source_b) = (self.shared.alloc_port(), self.shared.alloc_port());
        tables.sinks.insert(sink_a, SinkWiring::DeliverTo(source_b));
        tables.sinks.insert(sink_b, SinkWiring::DeliverTo(source_a));
        tables.sources.insert(source_a, None);
        tables.sources.insert(source_b, None);
        (
            PortPair::new(SinkRef(sink_a), SourceRef(source_a)),
            PortPair::new(SinkRef(sink_b), SourceRef(source_b)),
        )
    }

    /// Inject a link-layer event into a stack's listener (test/demo hook
    /// standing in for Gattlink-internal triggers).
    pub fn emit_stack_event(&self, handle: RawStackHandle, event_id: u32, data: u32) -> bool {
        let listener = {
            let tables = self.shared.tables.lock();
            tables
                .stacks
                .get(handle.0 as usize)
                .and_then(|slot| slot.as_ref())
                .and_then(|instance| instance.listener.clone())
        };
        match listener {
            Some(listener) => {
                listener.on_stack_event(event_id, data);
                true
            }
            None => false,
        }
    }

    /// Number of live stack instances.
    pub fn active_stacks(&self) -> usize {
        let tables = self.shared.tables.lock();
        tables.stacks.iter().filter(|slot| slot.is_some()).count()
    }

    fn instance_slot<'a>(
        tables: &'a mut Tables,
        handle: RawStackHandle,
    ) -> Option<&'a mut StackInstance> {
        tables
            .stacks
            .get_mut(handle.0 as usize)
            .and_then(|slot| slot.as_mut())
    }
}

impl Default for LoopbackDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl StackDriver for LoopbackDriver {
    fn create_stack(&self, request: &CreateStackRequest) -> (i32, Option<RawStackHandle>) {
        let mut tables = self.shared.tables.lock();

        // The bottom transport must name live ports.
        if !tables.sinks.contains_key(&request.transport_sink.0)
            || !tables.sources.contains_key(&request.transport_source.0)
        {
            warn!(
                node = %request.node_key,
                "stack creation rejected: unknown transport refs"
            );
            return (codes::ERROR_INVALID_PARAMETERS, None);
        }

        // Application-facing top port. Outbound writes relay straight to
        // the bottom transport sink (identity layers); inbound bytes are
        // delivered to the top source in set-up below.
        let top_sink = self.shared.alloc_port();
        let top_source = self.shared.alloc_port();
        tables
            .sinks
            .insert(top_sink, SinkWiring::ForwardTo(request.transport_sink.0));
        tables.sources.insert(top_source, None);

        let instance = StackInstance {
            node_key: request.node_key.clone(),
            role: request.role,
            has_dtls: request.config.descriptor.has_dtls(),
            transport_source: request.transport_source,
            top: PortPair::new(SinkRef(top_sink), SourceRef(top_source)),
            listener: None,
            key_resolvers: Arc::clone(&request.key_resolvers),
            started: false,
            mtu: 0,
        };

        let index = tables.stacks.len() as u32;
        tables.stacks.push(Some(instance));

        // Relay inbound transport bytes up to the top source.
        let shared = Arc::clone(&self.shared);
        let relay: SharedPortDataListener = Arc::new(move |data: &[u8]| {
            shared.deliver(top_source, data);
        });
        tables
            .sources
            .insert(request.transport_source.0, Some(relay));

        debug!(
            node = %request.node_key,
            descriptor = %request.config.descriptor,
            handle = index,
            "loopback stack created"
        );
        (codes::SUCCESS, Some(RawStackHandle(index)))
    }

    fn attach_event_listener(
        &self,
        handle: RawStackHandle,
        listener: Arc<dyn StackEventListener>,
    ) -> i32 {
        let mut tables = self.shared.tables.lock();
        match Self::instance_slot(&mut tables, handle) {
            Some(instance) => {
                instance.listener = Some(listener);
                codes::SUCCESS
            }
            None => codes::ERROR_INVALID_PARAMETERS,
        }
    }

    fn start_stack(&self, handle: RawStackHandle) -> i32 {
        let (listener, resolvers, node_key, role, has_dtls) = {
            let mut tables = self.shared.tables.lock();
            let Some(instance) = Self::instance_slot(&mut tables, handle) else {
                return codes::ERROR_INVALID_STATE;
            };
            if instance.started {
                return codes::SUCCESS;
            }
            instance.started = true;
            (
                instance.listener.clone(),
                Arc::clone(&instance.key_resolvers),
                instance.node_key.clone(),
                instance.role,
                instance.has_dtls,
            )
        };

        // Callbacks run outside the table lock, on the caller's thread
        // (the processing loop when driven through a Stack).
        if let Some(listener) = listener {
            if has_dtls {
                listener.on_dtls_status(dtls_state::INIT, codes::SUCCESS, &[]);
                // Only the client end initiates. A hub stays in Init
                // until a node shows up, which this engine does not
                // simulate.
                if role.is_node() {
                    let identity = self.offered_psk_identity.as_slice();
                    listener.on_dtls_status(dtls_state::HANDSHAKE, codes::SUCCESS, identity);
                    match resolvers.resolve(&node_key, identity) {
                        Some(_key) => {
                            listener.on_dtls_status(dtls_state::SESSION, codes::SUCCESS, identity);
                            listener.on_stack_event(event_ids::GATTLINK_SESSION_READY, 0);
                        }
                        None => {
                            listener.on_dtls_status(
                                dtls_state::ERROR,
                                codes::ERROR_TLS_UNKNOWN_IDENTITY,
                                identity,
                            );
                        }
                    }
                }
            } else {
                listener.on_stack_event(event_ids::GATTLINK_SESSION_READY, 0);
            }
        }
        codes::SUCCESS
    }

    fn update_stack_mtu(&self, handle: RawStackHandle, mtu: u32) -> bool {
        let mut tables = self.shared.tables.lock();
        match Self::instance_slot(&mut tables, handle) {
            Some(instance) => {
                instance.mtu = mtu;
                true
            }
            None => false,
        }
    }

    fn top_sink(&self, handle: RawStackHandle) -> Option<SinkRef> {
        let mut tables = self.shared.tables.lock();
        Self::instance_slot(&mut tables, handle).map(|i| i.top.sink)
    }

    fn top_source(&self, handle: RawStackHandle) -> Option<SourceRef> {
        let mut tables = self.shared.tables.lock();
        Self::instance_slot(&mut tables, handle).map(|i| i.top.source)
    }

    fn destroy_stack(&self, handle: RawStackHandle) {
        let mut tables = self.shared.tables.lock();
        let Some(slot) = tables.stacks.get_mut(handle.0 as usize) else {
            debug!(%handle, "destroy on unknown handle ignored");
            return;
        };
        let Some(instance) = slot.take() else {
            debug!(%handle, "destroy on released handle ignored");
            return;
        };
        tables.sinks.remove(&instance.top.sink.0);
        tables.sources.remove(&instance.top.source.0);
        // Detach the inbound relay; the transport ports outlive the stack.
        if let Some(entry) = tables.sources.get_mut(&instance.transport_source.0) {
            *entry = None;
        }
        debug!(%handle, node = %instance.node_key, "loopback stack destroyed");
    }

    fn write(&self, sink: SinkRef, data: &[u8]) -> i32 {
        // Follow forwarding wires to the delivering source, bounded so a
        // miswired table cannot loop forever.
        let mut current = sink.0;
        for _ in 0..4 {
            let next = {
                let tables = self.shared.tables.lock();
                match tables.sinks.get(&current) {
                    Some(SinkWiring::ForwardTo(sink)) => *sink,
                    Some(SinkWiring::DeliverTo(source)) => {
                        let source = *source;
                        drop(tables);
                        self.shared.deliver(source, data);
                        return codes::SUCCESS;
                    }
                    None => return codes::ERROR_INVALID_PARAMETERS,
                }
            };
            current = next;
        }
        codes::ERROR_INTERNAL
    }

    fn set_listener(&self, source: SourceRef, listener: Option<SharedPortDataListener>) -> i32 {
        let mut tables = self.shared.tables.lock();
        match tables.sources.get_mut(&source.0) {
            Some(entry) => {
                *entry = listener;
                codes::SUCCESS
            }
            None => codes::ERROR_INVALID_PARAMETERS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use parking_lot::Mutex as PlMutex;

    fn request(
        driver: &LoopbackDriver,
        config: StackConfig,
        resolvers: Arc<KeyResolverRegistry>,
    ) -> (CreateStackRequest, PortPair) {
        let (near, far) = driver.create_port_pair();
        (
            CreateStackRequest {
                node_key: NodeKey::new("AA:BB:CC:DD:EE:FF"),
                config,
                role: StackRole::Node,
                transport_sink: near.sink,
                transport_source: near.source,
                key_resolvers: resolvers,
            },
            far,
        )
    }

    struct RecordingListener {
        statuses: PlMutex<Vec<(u32, i32, Vec<u8>)>>,
        events: PlMutex<Vec<(u32, u32)>>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                statuses: PlMutex::new(Vec::new()),
                events: PlMutex::new(Vec::new()),
            })
        }
    }

    impl StackEventListener for RecordingListener {
        fn on_dtls_status(&self, state: u32, last_error: i32, psk_identity: &[u8]) {
            self.statuses
                .lock()
                .push((state, last_error, psk_identity.to_vec()));
        }

        fn on_stack_event(&self, event_id: u32, data: u32) {
            self.events.lock().push((event_id, data));
        }
    }

    #[test]
    fn test_port_pair_delivers_both_ways() {
        let driver = LoopbackDriver::new();
        let (a, b) = driver.create_port_pair();

        let got_at_b = Arc::new(PlMutex::new(Vec::new()));
        let captured = Arc::clone(&got_at_b);
        driver.set_listener(
            b.source,
            Some(Arc::new(move |data: &[u8]| captured.lock().push(data.to_vec()))),
        );

        assert_eq!(driver.write(a.sink, b"ping"), codes::SUCCESS);
        assert_eq!(got_at_b.lock().as_slice(), &[b"ping".to_vec()]);
    }

    #[test]
    fn test_create_rejects_unknown_transport() {
        let driver = LoopbackDriver::new();
        let request = CreateStackRequest {
            node_key: NodeKey::new("peer"),
            config: StackConfig::gattlink(),
            role: StackRole::Node,
            transport_sink: SinkRef(999),
            transport_source: SourceRef(998),
            key_resolvers: Arc::new(KeyResolverRegistry::with_defaults()),
        };
        let (code, handle) = driver.create_stack(&request);
        assert_eq!(code, codes::ERROR_INVALID_PARAMETERS);
        assert!(handle.is_none());
    }

    #[test]
    fn test_dtls_session_on_resolver_hit() {
        let driver = LoopbackDriver::new();
        let resolvers = Arc::new(KeyResolverRegistry::with_defaults());
        let (request, _far) = request(&driver, StackConfig::dtls_socket_netif_gattlink(), resolvers);

        let (code, handle) = driver.create_stack(&request);
        assert_eq!(code, codes::SUCCESS);
        let handle = handle.expect("handle on success");

        let listener = RecordingListener::new();
        assert_eq!(driver.attach_event_listener(handle, listener.clone()), codes::SUCCESS);
        assert_eq!(driver.start_stack(handle), codes::SUCCESS);

        let statuses = listener.statuses.lock();
        let states: Vec<u32> = statuses.iter().map(|(s, _, _)| *s).collect();
        assert_eq!(
            states,
            vec![dtls_state::INIT, dtls_state::HANDSHAKE, dtls_state::SESSION]
        );
        let events = listener.events.lock();
        assert_eq!(events.as_slice(), &[(event_ids::GATTLINK_SESSION_READY, 0)]);
    }

    #[test]
    fn test_hub_stack_waits_in_init() {
        let driver = LoopbackDriver::new();
        let (near, _far) = driver.create_port_pair();
        let request = CreateStackRequest {
            node_key: NodeKey::new("AA:BB:CC:DD:EE:FF"),
            config: StackConfig::dtls_socket_netif_gattlink(),
            role: StackRole::Hub,
            transport_sink: near.sink,
            transport_source: near.source,
            key_resolvers: Arc::new(KeyResolverRegistry::with_defaults()),
        };
        let (code, handle) = driver.create_stack(&request);
        assert_eq!(code, codes::SUCCESS);
        let handle = handle.expect("handle on success");

        let listener = RecordingListener::new();
        driver.attach_event_listener(handle, listener.clone());
        assert_eq!(driver.start_stack(handle), codes::SUCCESS);

        // The server side does not initiate: Init only, no handshake,
        // no ready event.
        let states: Vec<u32> = listener.statuses.lock().iter().map(|(s, _, _)| *s).collect();
        assert_eq!(states, vec![dtls_state::INIT]);
        assert!(listener.events.lock().is_empty());
    }

    #[test]
    fn test_dtls_error_on_resolver_miss() {
        let driver = LoopbackDriver::with_psk_identity(b"stranger".to_vec());
        let resolvers = Arc::new(KeyResolverRegistry::with_defaults());
        let (request, _far) = request(&driver, StackConfig::dtls_socket_netif_gattlink(), resolvers);

        let (_, handle) = driver.create_stack(&request);
        let handle = handle.expect("handle on success");
        let listener = RecordingListener::new();
        driver.attach_event_listener(handle, listener.clone());
        driver.start_stack(handle);

        let statuses = listener.statuses.lock();
        let (state, last_error, identity) = statuses.last().expect("statuses emitted").clone();
        assert_eq!(state, dtls_state::ERROR);
        assert_eq!(last_error, codes::ERROR_TLS_UNKNOWN_IDENTITY);
        assert_eq!(identity, b"stranger".to_vec());
        // No session, no ready event.
        assert!(listener.events.lock().is_empty());
    }

    #[test]
    fn test_top_port_relays_to_transport() {
        let driver = LoopbackDriver::new();
        let resolvers = Arc::new(KeyResolverRegistry::with_defaults());
        let (request, far) = request(&driver, StackConfig::gattlink(), resolvers);
        let transport_sink = request.transport_sink;

        let (_, handle) = driver.create_stack(&request);
        let handle = handle.expect("handle on success");
        driver.start_stack(handle);

        // Outbound: service writes to the top sink, far end receives.
        let far_received = Arc::new(PlMutex::new(Vec::new()));
        let captured = Arc::clone(&far_received);
        driver.set_listener(
            far.source,
            Some(Arc::new(move |data: &[u8]| captured.lock().push(data.to_vec()))),
        );
        let top_sink = driver.top_sink(handle).expect("live handle");
        assert_eq!(driver.write(top_sink, b"up-and-out"), codes::SUCCESS);
        assert_eq!(far_received.lock().as_slice(), &[b"up-and-out".to_vec()]);

        // Inbound: far end writes, top source listener receives.
        let top_received = Arc::new(PlMutex::new(Vec::new()));
        let captured = Arc::clone(&top_received);
        let top_source = driver.top_source(handle).expect("live handle");
        driver.set_listener(
            top_source,
            Some(Arc::new(move |data: &[u8]| captured.lock().push(data.to_vec()))),
        );
        assert_eq!(driver.write(far.sink, b"down-and-in"), codes::SUCCESS);
        assert_eq!(top_received.lock().as_slice(), &[b"down-and-in".to_vec()]);

        let _ = transport_sink;
    }

    #[test]
    fn test_destroy_is_checked_and_idempotent() {
        let driver = LoopbackDriver::new();
        let resolvers = Arc::new(KeyResolverRegistry::with_defaults());
        let (request, _far) = request(&driver, StackConfig::gattlink(), resolvers);

        let (_, handle) = driver.create_stack(&request);
        let handle = handle.expect("handle on success");
        assert_eq!(driver.active_stacks(), 1);

        driver.destroy_stack(handle);
        assert_eq!(driver.active_stacks(), 0);
        // Released handle: lookups fail cleanly, destroy is a no-op.
        driver.destroy_stack(handle);
        assert!(driver.top_sink(handle).is_none());
        assert!(!driver.update_stack_mtu(handle, 185));
        assert_eq!(driver.start_stack(handle), codes::ERROR_INVALID_STATE);
    }

    #[test]
    fn test_emit_stack_event_hook() {
        let driver = LoopbackDriver::new();
        let resolvers = Arc::new(KeyResolverRegistry::with_defaults());
        let (request, _far) = request(&driver, StackConfig::gattlink(), resolvers);
        let (_, handle) = driver.create_stack(&request);
        let handle = handle.expect("handle on success");

        // No listener attached yet.
        assert!(!driver.emit_stack_event(handle, event_ids::GATTLINK_SESSION_STALL, 1500));

        let listener = RecordingListener::new();
        driver.attach_event_listener(handle, listener.clone());
        assert!(driver.emit_stack_event(handle, event_ids::GATTLINK_SESSION_STALL, 1500));
        assert_eq!(
            listener.events.lock().as_slice(),
            &[(event_ids::GATTLINK_SESSION_STALL, 1500)]
        );
    }
}
