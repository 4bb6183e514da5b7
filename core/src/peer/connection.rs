//! Connection controller: single in-flight attempt per peer.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{
    ConnectionError, ConnectionState, LinkResolver, NetworkLink, PeerDescriptor,
    PhysicalConnection,
};

type AttemptFuture = Shared<BoxFuture<'static, Result<NetworkLink, ConnectionError>>>;

struct Established {
    connection: PhysicalConnection,
    link: NetworkLink,
}

struct Inner {
    descriptor: Option<PeerDescriptor>,
    /// Bumped on every new attempt and every forced disconnect. An
    /// attempt whose generation no longer matches must not publish its
    /// result; its connection is torn down instead.
    generation: u64,
    attempt: Option<AttemptFuture>,
    established: Option<Established>,
}

/// Serializes connection establishment for one peer.
///
/// Concurrent [`establish_connection`](Self::establish_connection)
/// callers share a single attempt and all observe its outcome. A failed
/// attempt is terminal; the next call starts a fresh one. Changing the
/// descriptor with [`update`](Self::update) never tears down an
/// existing connection, only [`force_disconnect`](Self::force_disconnect)
/// and [`clear_descriptor`](Self::clear_descriptor) do.
pub struct ConnectionController {
    resolver: Arc<dyn LinkResolver>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    inner: Arc<Mutex<Inner>>,
}

impl ConnectionController {
    pub fn new(resolver: Arc<dyn LinkResolver>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        ConnectionController {
            resolver,
            state_tx: Arc::new(state_tx),
            inner: Arc::new(Mutex::new(Inner {
                descriptor: None,
                generation: 0,
                attempt: None,
                established: None,
            })),
        }
    }

    /// Replace the peer's descriptor. Does not disconnect: an existing
    /// connection stays up and the new descriptor is used on the next
    /// attempt.
    pub fn update(&self, descriptor: PeerDescriptor) {
        self.inner.lock().descriptor = Some(descriptor);
    }

    pub fn descriptor(&self) -> Option<PeerDescriptor> {
        self.inner.lock().descriptor.clone()
    }

    /// Latest-value stream of the connection state. New subscribers see
    /// the current state immediately.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// The negotiated link, if currently connected.
    pub fn current_link(&self) -> Option<NetworkLink> {
        self.inner.lock().established.as_ref().map(|e| e.link)
    }

    /// Establish (or join the in-flight attempt for, or return the
    /// already established) connection to the peer.
    pub async fn establish_connection(&self) -> Result<NetworkLink, ConnectionError> {
        let attempt = {
            let mut inner = self.inner.lock();
            if let Some(established) = &inner.established {
                return Ok(established.link);
            }
            if let Some(attempt) = &inner.attempt {
                attempt.clone()
            } else {
                let descriptor = inner
                    .descriptor
                    .clone()
                    .ok_or(ConnectionError::NoDescriptor)?;
                inner.generation += 1;
                let attempt = Self::run_attempt(
                    Arc::clone(&self.resolver),
                    Arc::clone(&self.inner),
                    Arc::clone(&self.state_tx),
                    descriptor,
                    inner.generation,
                )
                .boxed()
                .shared();
                inner.attempt = Some(attempt.clone());
                attempt
            }
        };
        attempt.await
    }

    /// Tear down the current connection and discard any in-flight
    /// attempt. The descriptor is kept, so a later
    /// [`establish_connection`](Self::establish_connection) reconnects.
    pub async fn force_disconnect(&self) {
        let established = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.attempt = None;
            inner.established.take()
        };
        if let Some(established) = established {
            self.resolver.disconnect(&established.connection).await;
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Forget the descriptor entirely and disconnect. Subsequent
    /// attempts fail with [`ConnectionError::NoDescriptor`] until a new
    /// descriptor is supplied via [`update`](Self::update).
    pub async fn clear_descriptor(&self) {
        self.inner.lock().descriptor = None;
        self.force_disconnect().await;
    }

    async fn run_attempt(
        resolver: Arc<dyn LinkResolver>,
        inner: Arc<Mutex<Inner>>,
        state_tx: Arc<watch::Sender<ConnectionState>>,
        descriptor: PeerDescriptor,
        generation: u64,
    ) -> Result<NetworkLink, ConnectionError> {
        state_tx.send_replace(ConnectionState::Connecting);
        debug!(peer = %descriptor, "connecting");

        let connection = match resolver.connect(&descriptor).await {
            Ok(connection) => connection,
            Err(err) => {
                warn!(peer = %descriptor, error = %err, "connect failed");
                Self::finish_failed(&inner, &state_tx, generation);
                return Err(err);
            }
        };

        if Self::is_stale(&inner, generation) {
            resolver.disconnect(&connection).await;
            return Err(ConnectionError::Cancelled);
        }
        state_tx.send_replace(ConnectionState::Negotiating);

        let link = match resolver.negotiate(&connection).await {
            Ok(link) => link,
            Err(err) => {
                warn!(peer = %descriptor, error = %err, "negotiation failed");
                resolver.disconnect(&connection).await;
                Self::finish_failed(&inner, &state_tx, generation);
                return Err(err);
            }
        };

        let stale = {
            let mut guard = inner.lock();
            if guard.generation == generation {
                guard.attempt = None;
                guard.established = Some(Established {
                    connection: connection.clone(),
                    link,
                });
                false
            } else {
                true
            }
        };
        if stale {
            resolver.disconnect(&connection).await;
            return Err(ConnectionError::Cancelled);
        }
        state_tx.send_replace(ConnectionState::Connected);
        debug!(peer = %descriptor, mtu = link.mtu, "connected");
        Ok(link)
    }

    fn is_stale(inner: &Mutex<Inner>, generation: u64) -> bool {
        inner.lock().generation != generation
    }

    fn finish_failed(
        inner: &Mutex<Inner>,
        state_tx: &watch::Sender<ConnectionState>,
        generation: u64,
    ) {
        let mut guard = inner.lock();
        if guard.generation == generation {
            guard.attempt = None;
            drop(guard);
            state_tx.send_replace(ConnectionState::Disconnected);
        }
    }
}
