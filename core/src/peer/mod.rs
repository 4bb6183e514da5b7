//! Peer lifecycle: descriptors, connection state and link resolution.
//!
//! A peer has two identities: a [`NodeKey`](crate::keys::NodeKey) saying
//! *who* it is, and a [`PeerDescriptor`] saying *how to reach it*. The
//! connection layer resolves a descriptor into a [`NetworkLink`] (mtu +
//! sink + source) that a [`StackBuilder`](crate::stack::StackBuilder)
//! turns into a running stack.

mod connection;
mod manager;
mod node;

pub use connection::ConnectionController;
pub use manager::PeerManager;
pub use node::{Node, NodeConnection, NodeError};

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::port::{DataSinkDataSource, SinkRef, SourceRef};

/// Opaque address of a physical peer (e.g. a BLE peripheral identifier).
///
/// Invalidating a descriptor (forgetting stale pairing data) is a
/// distinct operation from a transient network drop; see
/// [`ConnectionController::clear_descriptor`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerDescriptor(String);

impl PeerDescriptor {
    pub fn new(value: impl Into<String>) -> Self {
        PeerDescriptor(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerDescriptor {
    fn from(value: &str) -> Self {
        PeerDescriptor::new(value)
    }
}

/// Connection lifecycle state, published as a latest-value stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No connection and none in progress.
    Disconnected,
    /// Physical connection attempt in flight.
    Connecting,
    /// Physically connected, negotiating link parameters.
    Negotiating,
    /// Link established and usable.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Negotiating => "Negotiating",
            ConnectionState::Connected => "Connected",
        };
        write!(f, "{name}")
    }
}

/// Errors from connection establishment. Each attempt fails terminally;
/// retry policy belongs to the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// No descriptor to connect to (never set, or cleared).
    #[error("no peer descriptor")]
    NoDescriptor,

    /// The physical connection could not be established.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The link parameters could not be negotiated.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The attempt was discarded by a forced disconnect.
    #[error("attempt cancelled")]
    Cancelled,
}

/// A live physical connection, prior to link negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalConnection {
    pub descriptor: PeerDescriptor,
    /// Resolver-scoped identifier for this connection instance.
    pub connection_id: u64,
}

/// A negotiated transport link: the MTU plus the bottom-of-stack port
/// pair a stack is built over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkLink {
    pub mtu: u32,
    pub sink: SinkRef,
    pub source: SourceRef,
}

impl DataSinkDataSource for NetworkLink {
    fn sink_ref(&self) -> SinkRef {
        self.sink
    }

    fn source_ref(&self) -> SourceRef {
        self.source
    }
}

/// Resolves a physical link out of a descriptor. Implemented by the
/// transport integration (BLE central, BSD socket, in-memory fixture).
#[async_trait]
pub trait LinkResolver: Send + Sync {
    /// Establish the physical connection.
    async fn connect(&self, descriptor: &PeerDescriptor)
        -> Result<PhysicalConnection, ConnectionError>;

    /// Negotiate link parameters over an established connection.
    async fn negotiate(
        &self,
        connection: &PhysicalConnection,
    ) -> Result<NetworkLink, ConnectionError>;

    /// Tear a connection down. Must not fail; called for both orderly
    /// disconnects and discarded attempts.
    async fn disconnect(&self, connection: &PhysicalConnection);
}
