//! Node: one remote peer and the stack built over its link.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use super::{ConnectionController, ConnectionError, ConnectionState, NetworkLink};
use crate::error::StackError;
use crate::keys::NodeKey;
use crate::stack::{Stack, StackBuilder};

/// Errors from [`Node::connect`].
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Stack(#[from] StackError),
}

/// A connected node: the negotiated link and the stack running over it.
pub struct NodeConnection {
    pub link: NetworkLink,
    pub stack: Arc<Stack>,
}

/// A remote peer the local device talks to.
///
/// `connect` drives the full path: descriptor to physical connection to
/// negotiated link to a started stack with the link MTU applied. Each
/// connect builds a fresh stack; the previous one is closed first.
pub struct Node {
    node_key: NodeKey,
    controller: Arc<ConnectionController>,
    builder: StackBuilder,
    active: Mutex<Option<Arc<NodeConnection>>>,
    /// Serializes [`connect`](Self::connect): concurrent callers share
    /// one outcome instead of racing to build stacks over one link.
    connect_serial: AsyncMutex<()>,
}

impl Node {
    pub fn new(
        node_key: NodeKey,
        controller: Arc<ConnectionController>,
        builder: StackBuilder,
    ) -> Self {
        Node {
            node_key,
            controller,
            builder,
            active: Mutex::new(None),
            connect_serial: AsyncMutex::new(()),
        }
    }

    pub fn node_key(&self) -> &NodeKey {
        &self.node_key
    }

    pub fn controller(&self) -> &Arc<ConnectionController> {
        &self.controller
    }

    /// The current connection, if one is up.
    pub fn connection(&self) -> Option<Arc<NodeConnection>> {
        self.active.lock().clone()
    }

    /// Connect to the peer and bring a stack up over the link.
    ///
    /// Idempotent while connected: returns the existing connection if
    /// its stack is still open.
    pub async fn connect(&self) -> Result<Arc<NodeConnection>, NodeError> {
        let _serial = self.connect_serial.lock().await;

        if let Some(existing) = self.connection() {
            if !existing.stack.is_closed()
                && self.controller.current_state() == ConnectionState::Connected
            {
                return Ok(existing);
            }
        }

        // Whatever the slot still holds is unusable: either its stack
        // was closed, or the controller lost the link underneath it.
        if let Some(previous) = self.active.lock().take() {
            previous.stack.close();
        }

        let link = self.controller.establish_connection().await?;

        let stack = self.builder.build(&link)?;
        stack.start();
        if link.mtu > 0 {
            stack.update_mtu(link.mtu);
        }
        info!(node = %self.node_key, mtu = link.mtu, "node connected");

        let connection = Arc::new(NodeConnection {
            link,
            stack: Arc::new(stack),
        });
        *self.active.lock() = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Close the stack and tear the link down. The descriptor is kept,
    /// so a later [`connect`](Self::connect) re-establishes everything.
    pub async fn disconnect(&self) {
        if let Some(connection) = self.active.lock().take() {
            connection.stack.close();
        }
        self.controller.force_disconnect().await;
        info!(node = %self.node_key, "node disconnected");
    }
}
