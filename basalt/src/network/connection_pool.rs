use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

use futures::future;
use tokio::sync::mpsc;
use tracing::debug;

use crate::errors::ConnectionError;
use crate::network::connection::{ConnectionConfig, ErrorReceiver, PooledConnection};
use crate::network::connector::{Connector, SharedKeyspace};
use crate::observability::metrics::Metrics;

/// Close progression of a pool. Transitions are monotonic:
/// Open → Closing → Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseState {
    Open,
    Closing,
    Closed,
}

/// The set of open connections to one endpoint, together with its liveness
/// bookkeeping. The manager's worker is the only mutator.
pub(crate) struct ConnectionPool {
    address: SocketAddr,
    connections: Vec<Arc<PooledConnection>>,
    reconnects_in_progress: usize,
    close_state: CloseState,
    /// Guarantees UP is reported exactly once per up-phase: set on UP,
    /// cleared when the pool goes down.
    notified_up: bool,
}

impl ConnectionPool {
    pub(crate) fn new(address: SocketAddr, connections: Vec<Arc<PooledConnection>>) -> Self {
        Self {
            address,
            connections,
            reconnects_in_progress: 0,
            close_state: CloseState::Open,
            notified_up: false,
        }
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    pub(crate) fn connections(&self) -> &[Arc<PooledConnection>] {
        &self.connections
    }

    pub(crate) fn has_connections(&self) -> bool {
        !self.connections.is_empty()
    }

    /// Drains every connection that has buffered frames.
    pub(crate) fn flush(&self) {
        for connection in &self.connections {
            if connection.has_pending_writes() {
                connection.flush();
            }
        }
    }

    pub(crate) fn add_connection(&mut self, connection: Arc<PooledConnection>) {
        self.connections.push(connection);
    }

    /// Removes the given connection, preserving the insertion order of the
    /// rest. Returns false if it was not in the pool.
    pub(crate) fn remove_connection(&mut self, connection: &Arc<PooledConnection>) -> bool {
        let maybe_idx = self
            .connections
            .iter()
            .position(|other| Arc::ptr_eq(connection, other));
        match maybe_idx {
            Some(idx) => {
                self.connections.remove(idx);
                true
            }
            None => false,
        }
    }

    pub(crate) fn reconnects_in_progress(&self) -> usize {
        self.reconnects_in_progress
    }

    pub(crate) fn reconnect_started(&mut self) {
        self.reconnects_in_progress += 1;
    }

    pub(crate) fn reconnect_finished(&mut self) {
        self.reconnects_in_progress = self.reconnects_in_progress.saturating_sub(1);
    }

    /// Forgets all outstanding reconnect slots. Used when the pool closes;
    /// late timer fires and attempt completions are discarded by the worker.
    pub(crate) fn cancel_reconnects(&mut self) {
        self.reconnects_in_progress = 0;
    }

    pub(crate) fn close_state(&self) -> CloseState {
        self.close_state
    }

    pub(crate) fn is_open(&self) -> bool {
        self.close_state == CloseState::Open
    }

    /// Marks the pool as closing and stops intake on every connection.
    /// The pool is removed once the last connection reports closed.
    pub(crate) fn start_closing(&mut self) {
        if self.close_state == CloseState::Open {
            self.close_state = CloseState::Closing;
            self.cancel_reconnects();
            for connection in &self.connections {
                connection.initiate_close();
            }
            debug!("[{}] Closing connection pool", self.address);
        }
    }

    pub(crate) fn set_closed(&mut self) {
        self.close_state = CloseState::Closed;
    }

    pub(crate) fn notified_up(&self) -> bool {
        self.notified_up
    }

    pub(crate) fn set_notified_up(&mut self, notified_up: bool) {
        self.notified_up = notified_up;
    }
}

/// The least-busy scan over a pool's connections: minimum in-flight count,
/// first (oldest) connection on ties. Runs against the manager's lock-free
/// snapshot of the pool, so callers get an owned share that survives
/// concurrent pool changes.
pub(crate) fn find_least_busy_in(
    connections: &[Arc<PooledConnection>],
) -> Option<Arc<PooledConnection>> {
    let mut best: Option<&Arc<PooledConnection>> = None;
    let mut best_score = usize::MAX;
    for connection in connections {
        let score = connection.find_least_busy_score();
        if score < best_score {
            best_score = score;
            best = Some(connection);
        }
    }
    best.cloned()
}

/// Seed of a new pool: the connections that came up, plus the count of
/// slots whose connectors failed transiently and need immediate reconnect
/// scheduling.
pub(crate) struct PoolSeed {
    pub(crate) connections: Vec<(PooledConnection, ErrorReceiver)>,
    pub(crate) failed_slots: usize,
}

/// Result of establishing a whole pool.
pub(crate) struct PoolConnectorOutcome {
    pub(crate) address: SocketAddr,
    pub(crate) result: Result<PoolSeed, ConnectionError>,
}

/// Establishes a whole pool: launches `num_connections_per_host` connectors
/// in parallel and classifies the combined outcome.
///
/// - ok when at least one child succeeded; failed slots reconnect from
///   within the pool,
/// - the first critical error when no child succeeded and one failed
///   critically,
/// - the first transient error otherwise. The manager does not retry a
///   transient pool failure; the topology layer re-adds the host later.
///
/// Cancellation is dropping the future; the children's half-open sockets
/// are closed on drop and any late completion is lost silently.
pub(crate) struct PoolConnector {
    address: SocketAddr,
    num_connections: NonZeroUsize,
    connection_config: ConnectionConfig,
    queue_size_io: usize,
    keyspace: SharedKeyspace,
    flush_request_sender: mpsc::UnboundedSender<SocketAddr>,
    metrics: Arc<Metrics>,
}

impl PoolConnector {
    pub(crate) fn new(
        address: SocketAddr,
        num_connections: NonZeroUsize,
        connection_config: ConnectionConfig,
        queue_size_io: usize,
        keyspace: SharedKeyspace,
        flush_request_sender: mpsc::UnboundedSender<SocketAddr>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            address,
            num_connections,
            connection_config,
            queue_size_io,
            keyspace,
            flush_request_sender,
            metrics,
        }
    }

    pub(crate) async fn connect(self) -> PoolConnectorOutcome {
        let attempts = (0..self.num_connections.get()).map(|_| {
            Connector::new(
                self.address,
                self.connection_config.clone(),
                self.queue_size_io,
                self.keyspace.clone(),
                self.flush_request_sender.clone(),
                self.metrics.clone(),
            )
            .connect()
        });

        let results = future::join_all(attempts).await;

        let mut connections = Vec::new();
        let mut first_critical: Option<ConnectionError> = None;
        let mut first_transient: Option<ConnectionError> = None;
        for result in results {
            match result {
                Ok(pair) => connections.push(pair),
                Err(error) if error.is_critical() => {
                    first_critical.get_or_insert(error);
                }
                Err(error) => {
                    first_transient.get_or_insert(error);
                }
            }
        }

        let result = if !connections.is_empty() {
            let failed_slots = self.num_connections.get() - connections.len();
            Ok(PoolSeed {
                connections,
                failed_slots,
            })
        } else if let Some(critical) = first_critical {
            Err(critical)
        } else if let Some(transient) = first_transient {
            Err(transient)
        } else {
            unreachable!("pool connector launched zero connectors")
        };

        PoolConnectorOutcome {
            address: self.address,
            result,
        }
    }
}

/// What the pool learns about a connection that stopped working: the error
/// that broke it, or `None` after a clean, requested close.
pub(crate) struct BrokenConnectionEvent {
    pub(crate) address: SocketAddr,
    pub(crate) connection: Weak<PooledConnection>,
    pub(crate) error: Option<ConnectionError>,
}

pub(crate) async fn wait_for_error(
    address: SocketAddr,
    connection: Weak<PooledConnection>,
    error_receiver: ErrorReceiver,
) -> BrokenConnectionEvent {
    match error_receiver.await {
        Ok(error) => BrokenConnectionEvent {
            address,
            connection,
            error: Some(error),
        },
        // The router dropped the sender without sending: clean close.
        Err(_) => BrokenConnectionEvent {
            address,
            connection,
            error: None,
        },
    }
}
