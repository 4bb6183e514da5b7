//! GattStack core: a BLE-oriented network stack with a safe lifecycle.
//!
//! The crate wraps a native stack engine (anything implementing
//! [`runtime::StackDriver`]) behind a move-only [`stack::Stack`] handle
//! with at-most-once start/close semantics, decodes the engine's DTLS
//! and Gattlink notifications into typed event streams, and layers a
//! reconnection model on top: [`peer::ConnectionController`] serializes
//! link establishment per peer, [`peer::PeerManager`] keys peers by
//! [`keys::NodeKey`], and [`peer::Node`] drives descriptor to link to
//! running stack.
//!
//! An in-process engine, [`runtime::LoopbackDriver`], backs tests and
//! demos without hardware.

pub mod config;
pub mod error;
pub mod keys;
pub mod peer;
pub mod port;
pub mod runtime;
pub mod service;
pub mod stack;

pub use config::{StackConfig, StackDescriptor, StackRole};
pub use error::{ErrorCategory, StackError};
pub use keys::{KeyResolver, KeyResolverRegistry, NodeKey, StaticKeyResolver};
pub use peer::{
    ConnectionController, ConnectionError, ConnectionState, LinkResolver, NetworkLink, Node,
    NodeConnection, NodeError, PeerDescriptor, PeerManager, PhysicalConnection,
};
pub use port::{DataSinkDataSource, PortPair, SinkRef, SourceRef};
pub use runtime::{LoopbackDriver, RunLoop, StackDriver};
pub use service::{Blaster, SingleMessageSender, StackService};
pub use stack::event::{DtlsProtocolState, DtlsProtocolStatus, StackEvent};
pub use stack::{Stack, StackBuilder, GATT_HEADER_OVERHEAD};
