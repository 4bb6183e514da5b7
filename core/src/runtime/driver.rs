//! Driver seam between the stack core and the layer-graph engine.
//!
//! The engine owns every native resource: stack instances, ports, the
//! processing loop. The core talks to it exclusively through
//! [`StackDriver`], so tests can substitute a mock and the in-process
//! [`LoopbackDriver`](crate::runtime::LoopbackDriver) can stand in for
//! the real layer graph.

use std::fmt;
use std::sync::Arc;

use crate::config::{StackConfig, StackRole};
use crate::keys::{KeyResolverRegistry, NodeKey};
use crate::port::{SharedPortDataListener, SinkRef, SourceRef};

/// Owning handle to an engine-side stack instance.
///
/// An index into the engine's instance arena, never a raw pointer:
/// operations on a destroyed handle are checked lookups that fail
/// cleanly instead of touching freed memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawStackHandle(pub(crate) u32);

impl RawStackHandle {
    /// Wrap an engine-issued instance index.
    pub fn new(raw: u32) -> Self {
        RawStackHandle(raw)
    }

    /// Raw instance index, for logging only.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for RawStackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stack#{}", self.0)
    }
}

/// Everything the engine needs to build a layer graph.
pub struct CreateStackRequest {
    /// Identity of the remote peer this stack talks to.
    pub node_key: NodeKey,
    /// Layer composition and addressing.
    pub config: StackConfig,
    /// Which DTLS side this stack takes.
    pub role: StackRole,
    /// Bottom-of-stack transport sink (not owned by the stack).
    pub transport_sink: SinkRef,
    /// Bottom-of-stack transport source (not owned by the stack).
    pub transport_source: SourceRef,
    /// PSK resolution chain for the DTLS handshake.
    pub key_resolvers: Arc<KeyResolverRegistry>,
}

/// Receives decoded-later event callbacks from the engine's processing
/// loop. Both callbacks arrive on the loop thread; implementations must
/// hand off to their own threads before heavy processing.
pub trait StackEventListener: Send + Sync {
    /// DTLS protocol state changed. `state` is the raw engine state value,
    /// `psk_identity` the identity bytes offered during the handshake
    /// (may be empty).
    fn on_dtls_status(&self, state: u32, last_error: i32, psk_identity: &[u8]);

    /// A link-layer event fired. `data` is event-specific auxiliary data.
    fn on_stack_event(&self, event_id: u32, data: u32);
}

/// Narrow interface to the layer-graph engine.
///
/// All methods return promptly; blocking I/O happens on the engine's own
/// processing loop. Result codes follow the table in [`crate::error`].
#[cfg_attr(test, mockall::automock)]
pub trait StackDriver: Send + Sync {
    /// Build a layer graph. Returns the result code and, when the code is
    /// non-negative, the owning handle.
    fn create_stack(&self, request: &CreateStackRequest) -> (i32, Option<RawStackHandle>);

    /// Register the event listener for a stack. A negative code means the
    /// stack works but will not emit DTLS/stack events.
    fn attach_event_listener(
        &self,
        handle: RawStackHandle,
        listener: Arc<dyn StackEventListener>,
    ) -> i32;

    /// Start the layer graph.
    fn start_stack(&self, handle: RawStackHandle) -> i32;

    /// Apply a new transport MTU. Returns the engine's success flag.
    fn update_stack_mtu(&self, handle: RawStackHandle, mtu: u32) -> bool;

    /// Application-facing sink of the stack's top port.
    fn top_sink(&self, handle: RawStackHandle) -> Option<SinkRef>;

    /// Application-facing source of the stack's top port.
    fn top_source(&self, handle: RawStackHandle) -> Option<SourceRef>;

    /// Tear the layer graph down and release the handle. Safe to call on
    /// an already-released handle (checked lookup, logged no-op).
    fn destroy_stack(&self, handle: RawStackHandle);

    /// Write bytes into a sink.
    fn write(&self, sink: SinkRef, data: &[u8]) -> i32;

    /// Register (or clear) the listener receiving bytes from a source.
    fn set_listener(&self, source: SourceRef, listener: Option<SharedPortDataListener>) -> i32;
}
