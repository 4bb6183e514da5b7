//! Stack lifecycle state machine.
//!
//! A [`Stack`] owns exactly one engine-side stack instance from creation
//! to close. The lifecycle is a single atomic phase cell
//! (Created -> Started -> Closed) so misuse from concurrent caller
//! threads degrades to logged no-ops: start twice is a no-op, close
//! twice releases the instance exactly once, and every port accessor
//! fails fast once the instance is gone.

pub mod event;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, trace, warn};

use crate::config::{StackConfig, StackRole};
use crate::error::{codes, StackError};
use crate::keys::{KeyResolverRegistry, NodeKey};
use crate::port::{DataSinkDataSource, PortPair, SinkRef, SourceRef};
use crate::runtime::{CreateStackRequest, RawStackHandle, RunLoop, StackDriver, StackEventListener};
use crate::stack::event::{DtlsProtocolStatus, StackEvent};

/// Gattlink frame header overhead subtracted from a transport MTU before
/// it is applied to the layer graph.
pub const GATT_HEADER_OVERHEAD: u32 = 3;

/// Capacity of the live stack-event channel. Events are best-effort;
/// sluggish subscribers lose the oldest events first.
const STACK_EVENT_CHANNEL_CAPACITY: usize = 32;

/// Lifecycle phase of a stack. `Closed` is terminal and reachable from
/// either earlier phase; all transitions go through one atomic cell so
/// illegal ones are a single guarded match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created = 0,
    Started = 1,
    Closed = 2,
}

impl Phase {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Phase::Created,
            1 => Phase::Started,
            _ => Phase::Closed,
        }
    }
}

/// Bridges engine callbacks (arriving on the processing-loop thread) into
/// the thread-safe event channels subscribers consume from.
struct EventBridge {
    node_key: NodeKey,
    dtls_status: Arc<watch::Sender<DtlsProtocolStatus>>,
    events: broadcast::Sender<StackEvent>,
}

impl StackEventListener for EventBridge {
    fn on_dtls_status(&self, state: u32, last_error: i32, psk_identity: &[u8]) {
        let status = DtlsProtocolStatus::from_callback(state, last_error, psk_identity);
        debug!(node = %self.node_key, state = ?status.state, last_error, "dtls status changed");
        self.dtls_status.send_replace(status);
    }

    fn on_stack_event(&self, event_id: u32, data: u32) {
        let event = StackEvent::parse(event_id, data);
        trace!(node = %self.node_key, %event, "stack event");
        // No subscribers is fine; live events are not replayed.
        let _ = self.events.send(event);
    }
}

/// A composed set of protocol layers owned as a single engine instance.
///
/// Non-cloneable: the handle has exactly one owner, and dropping the
/// stack closes it.
pub struct Stack {
    node_key: NodeKey,
    config: StackConfig,
    role: StackRole,
    driver: Arc<dyn StackDriver>,
    run_loop: Arc<RunLoop>,
    handle: RawStackHandle,
    phase: AtomicU8,
    dtls_status: Arc<watch::Sender<DtlsProtocolStatus>>,
    events: broadcast::Sender<StackEvent>,
}

impl Stack {
    /// Build a layer graph over `transport` and take ownership of it.
    ///
    /// A negative engine result code fails the whole attempt with
    /// [`StackError::CreationFailed`]; nothing is retained. A listener
    /// registration failure is non-fatal: the stack works but emits no
    /// DTLS/stack events (logged as a warning).
    pub fn create(
        driver: Arc<dyn StackDriver>,
        run_loop: Arc<RunLoop>,
        node_key: NodeKey,
        config: StackConfig,
        role: StackRole,
        transport: &dyn DataSinkDataSource,
        key_resolvers: Arc<KeyResolverRegistry>,
    ) -> Result<Self, StackError> {
        let request = CreateStackRequest {
            node_key: node_key.clone(),
            config: config.clone(),
            role,
            transport_sink: transport.sink_ref(),
            transport_source: transport.source_ref(),
            key_resolvers,
        };

        let create_driver = Arc::clone(&driver);
        let (code, handle) = run_loop
            .call(move || create_driver.create_stack(&request))
            .ok_or_else(|| StackError::creation_failed(codes::ERROR_INVALID_STATE))?;

        let handle = match (code, handle) {
            (code, Some(handle)) if code >= 0 => handle,
            (code, _) => {
                let code = if code < 0 { code } else { codes::FAILURE };
                warn!(node = %node_key, code, "stack creation failed");
                return Err(StackError::creation_failed(code));
            }
        };

        info!(
            node = %node_key,
            descriptor = %config.descriptor,
            %handle,
            "stack created"
        );

        let (dtls_tx, _) = watch::channel(DtlsProtocolStatus::initial());
        let dtls_tx = Arc::new(dtls_tx);
        let (events_tx, _) = broadcast::channel(STACK_EVENT_CHANNEL_CAPACITY);

        let stack = Self {
            node_key,
            config,
            role,
            driver,
            run_loop,
            handle,
            phase: AtomicU8::new(Phase::Created as u8),
            dtls_status: dtls_tx,
            events: events_tx,
        };
        stack.attach_event_listener();
        Ok(stack)
    }

    /// Register the event bridge with the engine. Failure leaves the
    /// stack usable, just silent.
    fn attach_event_listener(&self) {
        let bridge: Arc<dyn StackEventListener> = Arc::new(EventBridge {
            node_key: self.node_key.clone(),
            dtls_status: Arc::clone(&self.dtls_status),
            events: self.events.clone(),
        });
        let driver = Arc::clone(&self.driver);
        let handle = self.handle;
        let code = self
            .run_loop
            .call(move || driver.attach_event_listener(handle, bridge));
        match code {
            Some(code) if code >= 0 => {}
            Some(code) => warn!(
                node = %self.node_key,
                code,
                "event listener rejected; stack will not emit events"
            ),
            None => warn!(node = %self.node_key, "run loop stopped; stack will not emit events"),
        }
    }

    /// Start the layer graph. At most one engine start per stack; second
    /// and later calls are logged no-ops, as is starting after close.
    pub fn start(&self) {
        let transition = self.phase.compare_exchange(
            Phase::Created as u8,
            Phase::Started as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        match transition {
            Ok(_) => {}
            Err(raw) if Phase::from_raw(raw) == Phase::Started => {
                debug!(node = %self.node_key, "start ignored: already started");
                return;
            }
            Err(_) => {
                warn!(node = %self.node_key, "start ignored: stack closed");
                return;
            }
        }

        let driver = Arc::clone(&self.driver);
        let handle = self.handle;
        match self.run_loop.call(move || driver.start_stack(handle)) {
            Some(code) if code >= 0 => info!(node = %self.node_key, %handle, "stack started"),
            Some(code) => warn!(node = %self.node_key, code, "engine refused to start stack"),
            None => warn!(node = %self.node_key, "run loop stopped; start dropped"),
        }
    }

    /// Apply a new transport MTU, minus the Gattlink header overhead.
    /// Returns `false` without touching the engine once closed.
    pub fn update_mtu(&self, mtu: u32) -> bool {
        if self.is_closed() {
            debug!(node = %self.node_key, mtu, "mtu update ignored: stack closed");
            return false;
        }
        let effective = mtu.saturating_sub(GATT_HEADER_OVERHEAD);
        let driver = Arc::clone(&self.driver);
        let handle = self.handle;
        let applied = self
            .run_loop
            .call(move || driver.update_stack_mtu(handle, effective))
            .unwrap_or(false);
        if applied {
            debug!(node = %self.node_key, mtu, effective, "stack mtu updated");
        } else {
            warn!(node = %self.node_key, mtu, "stack mtu update failed");
        }
        applied
    }

    /// Application-facing sink of the top port. Fails fast after close
    /// instead of handing out a reference into freed engine state.
    pub fn top_sink(&self) -> Result<SinkRef, StackError> {
        self.ensure_open()?;
        let driver = Arc::clone(&self.driver);
        let handle = self.handle;
        self.run_loop
            .call(move || driver.top_sink(handle))
            .flatten()
            .ok_or(StackError::PortUnavailable {
                code: codes::ERROR_INVALID_STATE,
            })
    }

    /// Application-facing source of the top port. Fails fast after close.
    pub fn top_source(&self) -> Result<SourceRef, StackError> {
        self.ensure_open()?;
        let driver = Arc::clone(&self.driver);
        let handle = self.handle;
        self.run_loop
            .call(move || driver.top_source(handle))
            .flatten()
            .ok_or(StackError::PortUnavailable {
                code: codes::ERROR_INVALID_STATE,
            })
    }

    /// Both ends of the top port, for attaching a service.
    pub fn top_port(&self) -> Result<PortPair, StackError> {
        Ok(PortPair::new(self.top_sink()?, self.top_source()?))
    }

    /// Release the engine instance. Idempotent: only the first call
    /// destroys; later calls (and `Drop`) are logged no-ops.
    pub fn close(&self) {
        let prior = Phase::from_raw(self.phase.swap(Phase::Closed as u8, Ordering::SeqCst));
        if prior == Phase::Closed {
            debug!(node = %self.node_key, "close ignored: already closed");
            return;
        }
        let driver = Arc::clone(&self.driver);
        let handle = self.handle;
        match self.run_loop.call(move || driver.destroy_stack(handle)) {
            Some(()) => info!(node = %self.node_key, %handle, "stack closed"),
            None => warn!(node = %self.node_key, "run loop stopped; engine teardown skipped"),
        }
    }

    /// Latest-value DTLS status stream. A new receiver observes the
    /// current status immediately, then every later transition in order.
    pub fn dtls_status(&self) -> watch::Receiver<DtlsProtocolStatus> {
        self.dtls_status.subscribe()
    }

    /// Live stack-event stream. No replay: events emitted before
    /// subscribing are missed permanently.
    pub fn events(&self) -> broadcast::Receiver<StackEvent> {
        self.events.subscribe()
    }

    pub fn node_key(&self) -> &NodeKey {
        &self.node_key
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn role(&self) -> StackRole {
        self.role
    }

    pub fn is_started(&self) -> bool {
        self.phase() == Phase::Started
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == Phase::Closed
    }

    fn phase(&self) -> Phase {
        Phase::from_raw(self.phase.load(Ordering::SeqCst))
    }

    fn ensure_open(&self) -> Result<(), StackError> {
        if self.is_closed() {
            Err(StackError::AlreadyClosed)
        } else {
            Ok(())
        }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.close();
    }
}

/// Everything needed to build stacks for one peer, minus the transport.
///
/// The connection layer resolves a link and feeds it in here.
#[derive(Clone)]
pub struct StackBuilder {
    driver: Arc<dyn StackDriver>,
    run_loop: Arc<RunLoop>,
    node_key: NodeKey,
    config: StackConfig,
    role: StackRole,
    key_resolvers: Arc<KeyResolverRegistry>,
}

impl StackBuilder {
    pub fn new(
        driver: Arc<dyn StackDriver>,
        run_loop: Arc<RunLoop>,
        node_key: NodeKey,
        config: StackConfig,
        key_resolvers: Arc<KeyResolverRegistry>,
    ) -> Self {
        Self {
            driver,
            run_loop,
            node_key,
            config,
            role: StackRole::Node,
            key_resolvers,
        }
    }

    /// Take the hub side instead of the default node side.
    pub fn with_role(mut self, role: StackRole) -> Self {
        self.role = role;
        self
    }

    pub fn node_key(&self) -> &NodeKey {
        &self.node_key
    }

    /// Build a stack over a freshly resolved transport.
    pub fn build(&self, transport: &dyn DataSinkDataSource) -> Result<Stack, StackError> {
        Stack::create(
            Arc::clone(&self.driver),
            Arc::clone(&self.run_loop),
            self.node_key.clone(),
            self.config.clone(),
            self.role,
            transport,
            Arc::clone(&self.key_resolvers),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::runtime::MockStackDriver;
    use crate::stack::event::{dtls_state, event_ids, DtlsProtocolState};
    use mockall::predicate::eq;
    use parking_lot::Mutex;

    fn transport() -> PortPair {
        PortPair::new(SinkRef(100), SourceRef(101))
    }

    fn resolvers() -> Arc<KeyResolverRegistry> {
        Arc::new(KeyResolverRegistry::with_defaults())
    }

    /// Mock that accepts creation and listener registration.
    fn accepting_mock() -> MockStackDriver {
        let mut mock = MockStackDriver::new();
        mock.expect_create_stack()
            .times(1)
            .returning(|_| (codes::SUCCESS, Some(RawStackHandle(0))));
        mock.expect_attach_event_listener()
            .times(1)
            .returning(|_, _| codes::SUCCESS);
        mock
    }

    fn create_stack(mock: MockStackDriver) -> Stack {
        Stack::create(
            Arc::new(mock),
            Arc::new(RunLoop::new("test-stack-loop")),
            NodeKey::new("AA:BB:CC:DD:EE:FF"),
            StackConfig::dtls_socket_netif_gattlink(),
            StackRole::Node,
            &transport(),
            resolvers(),
        )
        .expect("stack creation")
    }

    #[test]
    fn test_creation_failure_maps_code_to_category() {
        let mut mock = MockStackDriver::new();
        mock.expect_create_stack()
            .times(1)
            .returning(|_| (-10_601, None));

        let result = Stack::create(
            Arc::new(mock),
            Arc::new(RunLoop::new("test-stack-loop")),
            NodeKey::new("peer"),
            StackConfig::dtls_socket_netif_gattlink(),
            StackRole::Node,
            &transport(),
            resolvers(),
        );

        assert_eq!(
            result.err(),
            Some(StackError::CreationFailed {
                code: -10_601,
                category: ErrorCategory::Tls,
            })
        );
    }

    #[test]
    fn test_listener_rejection_is_non_fatal() {
        let mut mock = MockStackDriver::new();
        mock.expect_create_stack()
            .times(1)
            .returning(|_| (codes::SUCCESS, Some(RawStackHandle(0))));
        mock.expect_attach_event_listener()
            .times(1)
            .returning(|_, _| codes::FAILURE);
        mock.expect_destroy_stack().times(1).return_const(());

        let stack = create_stack(mock);
        assert!(!stack.is_closed());
    }

    #[test]
    fn test_start_is_idempotent() {
        let mut mock = accepting_mock();
        // Exactly one engine start no matter how often start() is called.
        mock.expect_start_stack()
            .times(1)
            .returning(|_| codes::SUCCESS);
        mock.expect_destroy_stack().times(1).return_const(());

        let stack = create_stack(mock);
        stack.start();
        stack.start();
        stack.start();
        assert!(stack.is_started());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut mock = accepting_mock();
        // Exactly one engine destroy no matter how often close() is called.
        mock.expect_destroy_stack().times(1).return_const(());

        let stack = create_stack(mock);
        stack.close();
        stack.close();
        stack.close();
        assert!(stack.is_closed());
        // Drop must not destroy a second time (covered by times(1)).
    }

    #[test]
    fn test_drop_closes() {
        let mut mock = accepting_mock();
        mock.expect_destroy_stack().times(1).return_const(());
        let stack = create_stack(mock);
        drop(stack);
    }

    #[test]
    fn test_start_after_close_is_a_noop() {
        let mut mock = accepting_mock();
        mock.expect_destroy_stack().times(1).return_const(());
        // No expect_start_stack: an engine start would panic the mock.

        let stack = create_stack(mock);
        stack.close();
        stack.start();
        assert!(!stack.is_started());
    }

    #[test]
    fn test_port_accessors_fail_fast_after_close() {
        for start_first in [false, true] {
            let mut mock = accepting_mock();
            if start_first {
                mock.expect_start_stack().times(1).returning(|_| codes::SUCCESS);
            }
            mock.expect_destroy_stack().times(1).return_const(());

            let stack = create_stack(mock);
            if start_first {
                stack.start();
            }
            stack.close();
            assert_eq!(stack.top_sink(), Err(StackError::AlreadyClosed));
            assert_eq!(stack.top_source(), Err(StackError::AlreadyClosed));
            assert_eq!(stack.top_port().err(), Some(StackError::AlreadyClosed));
        }
    }

    #[test]
    fn test_update_mtu_subtracts_header_overhead() {
        let mut mock = accepting_mock();
        mock.expect_update_stack_mtu()
            .with(eq(RawStackHandle(0)), eq(182u32))
            .times(1)
            .returning(|_, _| true);
        mock.expect_destroy_stack().times(1).return_const(());

        let stack = create_stack(mock);
        assert!(stack.update_mtu(185));
    }

    #[test]
    fn test_update_mtu_rejected_after_close_without_engine_call() {
        let mut mock = accepting_mock();
        mock.expect_destroy_stack().times(1).return_const(());
        // No expect_update_stack_mtu: an engine call would panic the mock.

        let stack = create_stack(mock);
        stack.close();
        assert!(!stack.update_mtu(185));
        assert!(!stack.update_mtu(23));
    }

    #[test]
    fn test_top_port_exposes_engine_refs() {
        let mut mock = accepting_mock();
        mock.expect_top_sink()
            .times(1)
            .returning(|_| Some(SinkRef(7)));
        mock.expect_top_source()
            .times(1)
            .returning(|_| Some(SourceRef(8)));
        mock.expect_destroy_stack().times(1).return_const(());

        let stack = create_stack(mock);
        let port = stack.top_port().expect("port while open");
        assert_eq!(port.sink, SinkRef(7));
        assert_eq!(port.source, SourceRef(8));
    }

    /// Capture the listener the stack registers so tests can drive engine
    /// callbacks directly.
    fn mock_capturing_listener(
        slot: Arc<Mutex<Option<Arc<dyn StackEventListener>>>>,
    ) -> MockStackDriver {
        let mut mock = MockStackDriver::new();
        mock.expect_create_stack()
            .times(1)
            .returning(|_| (codes::SUCCESS, Some(RawStackHandle(0))));
        mock.expect_attach_event_listener()
            .times(1)
            .returning(move |_, listener| {
                *slot.lock() = Some(listener);
                codes::SUCCESS
            });
        mock.expect_destroy_stack().return_const(());
        mock
    }

    #[test]
    fn test_dtls_status_replays_latest_to_late_subscriber() {
        let slot = Arc::new(Mutex::new(None));
        let stack = create_stack(mock_capturing_listener(Arc::clone(&slot)));
        let listener = slot.lock().clone().expect("listener registered");

        listener.on_dtls_status(dtls_state::INIT, 0, &[]);
        listener.on_dtls_status(dtls_state::HANDSHAKE, 0, b"hello");
        listener.on_dtls_status(dtls_state::SESSION, 0, b"hello");

        // A subscriber joining after the transitions sees Session at once.
        let receiver = stack.dtls_status();
        let status = receiver.borrow().clone();
        assert_eq!(status.state, DtlsProtocolState::Session);
        assert_eq!(status.psk_identity, "hello");
    }

    #[test]
    fn test_stack_events_are_live_only() {
        let slot = Arc::new(Mutex::new(None));
        let stack = create_stack(mock_capturing_listener(Arc::clone(&slot)));
        let listener = slot.lock().clone().expect("listener registered");

        // Emitted with no subscriber: lost permanently.
        listener.on_stack_event(event_ids::GATTLINK_BUFFER_OVER_THRESHOLD, 0);

        let mut receiver = stack.events();
        assert!(receiver.try_recv().is_err());

        listener.on_stack_event(event_ids::GATTLINK_SESSION_STALL, 900);
        assert_eq!(
            receiver.try_recv(),
            Ok(StackEvent::GattlinkSessionStall {
                stalled_time_ms: 900
            })
        );
    }

    #[test]
    fn test_builder_feeds_transport_into_create() {
        let mut mock = MockStackDriver::new();
        mock.expect_create_stack()
            .times(1)
            .withf(|request| {
                request.transport_sink == SinkRef(100)
                    && request.transport_source == SourceRef(101)
            })
            .returning(|_| (codes::SUCCESS, Some(RawStackHandle(0))));
        mock.expect_attach_event_listener()
            .times(1)
            .returning(|_, _| codes::SUCCESS);
        mock.expect_destroy_stack().times(1).return_const(());

        let builder = StackBuilder::new(
            Arc::new(mock),
            Arc::new(RunLoop::new("test-stack-loop")),
            NodeKey::new("peer"),
            StackConfig::gattlink(),
            resolvers(),
        )
        .with_role(StackRole::Hub);

        let stack = builder.build(&transport()).expect("build");
        assert_eq!(stack.role(), StackRole::Hub);
    }
}
