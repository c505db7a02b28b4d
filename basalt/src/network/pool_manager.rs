use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::errors::{BadPoolSettings, ConnectionError};
use crate::network::connection::{ConnectionConfig, ErrorReceiver, PooledConnection};
use crate::network::connection_pool::{
    find_least_busy_in, wait_for_error, BrokenConnectionEvent, CloseState, ConnectionPool,
    PoolConnector, PoolConnectorOutcome,
};
use crate::network::connector::{Connector, SharedKeyspace};
use crate::observability::metrics::Metrics;

/// Immutable settings snapshot of a [`ConnectionPoolManager`], derived from
/// the driver configuration at construction.
#[derive(Clone)]
pub struct PoolManagerSettings {
    /// How many connections to keep open to every endpoint.
    pub num_connections_per_host: NonZeroUsize,
    /// How long a pool waits before it retries a dead connection slot.
    pub reconnect_wait_time: Duration,
    /// Upper bound, in bytes, of each connection's outbound buffer.
    pub queue_size_io: usize,
    /// Options applied to every new connection (timeouts, compression,
    /// authentication).
    pub connection: ConnectionConfig,
}

impl Default for PoolManagerSettings {
    fn default() -> Self {
        Self {
            num_connections_per_host: NonZeroUsize::new(1).unwrap(),
            reconnect_wait_time: Duration::from_millis(2000),
            queue_size_io: 1024 * 1024,
            connection: ConnectionConfig::default(),
        }
    }
}

impl PoolManagerSettings {
    /// Checks the bounds the pool contract assumes; run by
    /// [`ConnectionPoolManager::new`]. `num_connections_per_host` and the
    /// reconnect wait time are already constrained by their types.
    pub fn validate(&self) -> Result<(), BadPoolSettings> {
        if self.queue_size_io == 0 {
            return Err(BadPoolSettings::ZeroQueueSize);
        }
        if self.connection.connect_timeout.is_zero() {
            return Err(BadPoolSettings::ZeroConnectTimeout);
        }
        Ok(())
    }
}

/// External observer of pool liveness. All methods default to no-ops, so
/// implementors override only what they care about.
///
/// Calls for a single manager are totally ordered: UP and DOWN for an
/// address strictly alternate, critical errors may appear at any point, and
/// `on_close` is the final call ever made.
pub trait ConnectionPoolListener: Send + Sync {
    /// The pool got its first live connection (initially, or again after
    /// having gone down).
    fn on_pool_up(&self, _address: SocketAddr) {}

    /// The pool lost its last live connection while still open.
    fn on_pool_down(&self, _address: SocketAddr) {}

    /// A connection attempt failed in a way the pool will not retry.
    fn on_pool_critical_error(&self, _address: SocketAddr, _error: &ConnectionError) {}

    /// The manager finished closing; no further calls will be made.
    fn on_close(&self) {}
}

struct NopConnectionPoolListener;

impl ConnectionPoolListener for NopConnectionPoolListener {}

enum Command {
    Add(SocketAddr),
    Remove(SocketAddr),
    Flush,
    Close,
    SetListener(Option<Arc<dyn ConnectionPoolListener>>),
}

/// Read-optimized view of the live pools, refreshed by the worker on every
/// membership change. Selection queries are answered from here without
/// touching the worker.
type PoolsSnapshot = HashMap<SocketAddr, Arc<Vec<Arc<PooledConnection>>>>;

struct ManagerShared {
    protocol_version: u8,
    settings: PoolManagerSettings,
    keyspace: SharedKeyspace,
    snapshot: ArcSwap<PoolsSnapshot>,
    metrics: Arc<Metrics>,
    flush_request_sender: mpsc::UnboundedSender<SocketAddr>,
}

/// Maintains a bounded pool of multiplexed connections per endpoint and
/// mediates connection selection for outgoing requests.
///
/// All mutating operations (`add`, `remove`, `flush`, `close`,
/// `set_listener`) post onto a single worker task that owns the pool state,
/// so they may be called from any thread and return immediately. Selection
/// queries (`available`, `find_least_busy`) read a lock-free snapshot.
///
/// Dropping the last handle closes the manager the same way [`close`]
/// does.
///
/// [`close`]: ConnectionPoolManager::close
#[derive(Clone)]
pub struct ConnectionPoolManager {
    shared: Arc<ManagerShared>,
    command_sender: mpsc::UnboundedSender<Command>,
}

impl ConnectionPoolManager {
    /// Validates `settings` and spawns the manager worker onto the current
    /// tokio runtime.
    ///
    /// `keyspace` is the keyspace every new connection is put into; pass an
    /// empty string for none. `protocol_version` is fixed for the manager's
    /// lifetime.
    pub fn new(
        protocol_version: u8,
        keyspace: impl Into<String>,
        metrics: Arc<Metrics>,
        settings: PoolManagerSettings,
    ) -> Result<Self, BadPoolSettings> {
        settings.validate()?;

        let (command_sender, command_receiver) = mpsc::unbounded_channel();
        let (flush_request_sender, flush_request_receiver) = mpsc::unbounded_channel();

        let shared = Arc::new(ManagerShared {
            protocol_version,
            settings,
            keyspace: Arc::new(StdMutex::new(keyspace.into())),
            snapshot: ArcSwap::from_pointee(PoolsSnapshot::new()),
            metrics,
            flush_request_sender,
        });

        let worker = ManagerWorker::new(shared.clone(), command_receiver, flush_request_receiver);
        tokio::task::spawn(worker.run());

        Ok(Self {
            shared,
            command_sender,
        })
    }

    /// Starts establishing a pool for `address`. A no-op if the address
    /// already has a live pool or one being established. The pool appears
    /// in [`available`](Self::available) once at least one connection is
    /// up; `add` followed immediately by a selection query may legitimately
    /// find nothing yet.
    pub fn add(&self, address: SocketAddr) {
        let _ = self.command_sender.send(Command::Add(address));
    }

    /// Closes and removes the pool for `address`, if any.
    pub fn remove(&self, address: SocketAddr) {
        let _ = self.command_sender.send(Command::Remove(address));
    }

    /// Drains the outbound buffers of every pool that accepted writes since
    /// the previous flush.
    pub fn flush(&self) {
        let _ = self.command_sender.send(Command::Flush);
    }

    /// Closes every pool, cancels pending connectors and eventually
    /// delivers `on_close`. Idempotent; subsequent operations are ignored.
    pub fn close(&self) {
        let _ = self.command_sender.send(Command::Close);
    }

    /// Replaces the listener. `None` restores the no-op listener.
    pub fn set_listener(&self, listener: Option<Arc<dyn ConnectionPoolListener>>) {
        let _ = self.command_sender.send(Command::SetListener(listener));
    }

    /// Snapshot of the addresses that currently have a live pool. Order is
    /// unspecified.
    pub fn available(&self) -> Vec<SocketAddr> {
        self.shared.snapshot.load().keys().copied().collect()
    }

    /// The connection to `address` with the fewest requests in flight, or
    /// `None` when no live pool exists for it. The returned handle is an
    /// owned share: it stays valid even if the pool drops the connection
    /// concurrently (writes then fail fast).
    pub fn find_least_busy(&self, address: SocketAddr) -> Option<Arc<PooledConnection>> {
        let snapshot = self.shared.snapshot.load();
        let connections = snapshot.get(&address)?;
        find_least_busy_in(connections)
    }

    /// The keyspace new connections are put into.
    pub fn keyspace(&self) -> String {
        self.shared.keyspace.lock().unwrap().clone()
    }

    /// Sets the keyspace for connections opened from now on. Existing
    /// connections are not migrated; a session-wide switch is the request
    /// layer's job (it may issue per-connection `USE` requests).
    pub fn set_keyspace(&self, keyspace: impl Into<String>) {
        *self.shared.keyspace.lock().unwrap() = keyspace.into();
    }

    /// The protocol version this manager was built for.
    pub fn protocol_version(&self) -> u8 {
        self.shared.protocol_version
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.shared.metrics
    }
}

struct ManagerWorker {
    shared: Arc<ManagerShared>,
    listener: Arc<dyn ConnectionPoolListener>,

    pools: HashMap<SocketAddr, ConnectionPool>,
    pending_pool_addresses: Vec<SocketAddr>,
    pending_pools: FuturesUnordered<BoxFuture<'static, PoolConnectorOutcome>>,

    reconnect_timers: FuturesUnordered<BoxFuture<'static, SocketAddr>>,
    reconnect_attempts: FuturesUnordered<
        BoxFuture<'static, (SocketAddr, Result<(PooledConnection, ErrorReceiver), ConnectionError>)>,
    >,
    connection_errors: FuturesUnordered<BoxFuture<'static, BrokenConnectionEvent>>,

    to_flush: HashSet<SocketAddr>,
    close_state: CloseState,

    command_receiver: mpsc::UnboundedReceiver<Command>,
    commands_closed: bool,
    flush_request_receiver: mpsc::UnboundedReceiver<SocketAddr>,
}

impl ManagerWorker {
    fn new(
        shared: Arc<ManagerShared>,
        command_receiver: mpsc::UnboundedReceiver<Command>,
        flush_request_receiver: mpsc::UnboundedReceiver<SocketAddr>,
    ) -> Self {
        Self {
            shared,
            listener: Arc::new(NopConnectionPoolListener),
            pools: HashMap::new(),
            pending_pool_addresses: Vec::new(),
            pending_pools: FuturesUnordered::new(),
            reconnect_timers: FuturesUnordered::new(),
            reconnect_attempts: FuturesUnordered::new(),
            connection_errors: FuturesUnordered::new(),
            to_flush: HashSet::new(),
            close_state: CloseState::Open,
            command_receiver,
            commands_closed: false,
            flush_request_receiver,
        }
    }

    async fn run(mut self) {
        debug!("Started connection pool manager worker");

        loop {
            tokio::select! {
                command = self.command_receiver.recv(), if !self.commands_closed => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            // Every manager handle is gone; close as if
                            // `close()` had been called.
                            self.commands_closed = true;
                            self.start_closing();
                        }
                    }
                }

                outcome = self.pending_pools.select_next_some(), if !self.pending_pools.is_empty() => {
                    self.handle_connect(outcome);
                }

                address = self.reconnect_timers.select_next_some(), if !self.reconnect_timers.is_empty() => {
                    self.handle_reconnect_timer(address);
                }

                result = self.reconnect_attempts.select_next_some(), if !self.reconnect_attempts.is_empty() => {
                    self.handle_reconnect_attempt(result);
                }

                event = self.connection_errors.select_next_some(), if !self.connection_errors.is_empty() => {
                    self.handle_connection_event(event);
                }

                Some(address) = self.flush_request_receiver.recv() => {
                    self.handle_flush_request(address);
                }
            }

            // Must run last: reaching the closed state ends the worker and
            // with it every piece of manager state.
            if self.maybe_closed() {
                return;
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Add(address) => self.handle_add(address),
            Command::Remove(address) => self.handle_remove(address),
            Command::Flush => self.handle_flush(),
            Command::Close => self.start_closing(),
            Command::SetListener(listener) => {
                self.listener = listener.unwrap_or_else(|| Arc::new(NopConnectionPoolListener));
            }
        }
    }

    fn handle_add(&mut self, address: SocketAddr) {
        if self.close_state != CloseState::Open {
            return;
        }
        if self.pools.contains_key(&address) {
            return;
        }
        if self.pending_pool_addresses.contains(&address) {
            return;
        }

        debug!("[{}] Connecting pool", address);
        let connector = PoolConnector::new(
            address,
            self.shared.settings.num_connections_per_host,
            self.shared.settings.connection.clone(),
            self.shared.settings.queue_size_io,
            self.shared.keyspace.clone(),
            self.shared.flush_request_sender.clone(),
            self.shared.metrics.clone(),
        );
        self.pending_pool_addresses.push(address);
        self.pending_pools.push(connector.connect().boxed());
    }

    fn handle_remove(&mut self, address: SocketAddr) {
        // A pending connector for the same address is never cancelled here;
        // pools and pending connectors are disjoint on addresses.
        let Some(pool) = self.pools.get_mut(&address) else {
            return;
        };
        pool.start_closing();
        let now_empty = !pool.has_connections();

        self.publish_snapshot();
        if now_empty {
            self.finalize_pool_removal(address);
        }
        // Otherwise the pool removes itself when its last connection
        // reports closed.
    }

    fn handle_flush(&mut self) {
        for address in self.to_flush.drain() {
            if let Some(pool) = self.pools.get(&address) {
                pool.flush();
            }
        }
    }

    fn handle_flush_request(&mut self, address: SocketAddr) {
        if self.pools.get(&address).is_some_and(ConnectionPool::is_open) {
            self.to_flush.insert(address);
        }
    }

    fn start_closing(&mut self) {
        if self.close_state != CloseState::Open {
            return;
        }
        self.close_state = CloseState::Closing;
        debug!("Closing connection pool manager");

        // Cancel pending pool connectors. Dropping the futures closes their
        // half-open sockets; late completions are lost silently.
        self.pending_pools = FuturesUnordered::new();
        self.pending_pool_addresses.clear();
        self.reconnect_timers = FuturesUnordered::new();
        self.reconnect_attempts = FuturesUnordered::new();

        let addresses: Vec<SocketAddr> = self.pools.keys().copied().collect();
        for address in addresses {
            let now_empty = match self.pools.get_mut(&address) {
                Some(pool) => {
                    pool.start_closing();
                    !pool.has_connections()
                }
                None => continue,
            };
            if now_empty {
                self.finalize_pool_removal(address);
            }
        }
        self.publish_snapshot();
    }

    fn handle_connect(&mut self, outcome: PoolConnectorOutcome) {
        let PoolConnectorOutcome { address, result } = outcome;
        self.pending_pool_addresses.retain(|a| *a != address);

        if self.close_state != CloseState::Open {
            // The manager started closing while the connector was running;
            // drop the outcome, closing any established sockets.
            if let Ok(seed) = &result {
                for _ in &seed.connections {
                    self.shared.metrics.dec_total_connections();
                }
            }
            return;
        }

        match result {
            Ok(seed) => {
                let failed_slots = seed.failed_slots;
                let mut connections = Vec::with_capacity(seed.connections.len());
                for (connection, error_receiver) in seed.connections {
                    let connection = Arc::new(connection);
                    self.connection_errors.push(
                        wait_for_error(address, Arc::downgrade(&connection), error_receiver)
                            .boxed(),
                    );
                    connections.push(connection);
                }

                debug!(
                    "[{}] Adding pool for host ({} connections, {} slots reconnecting)",
                    address,
                    connections.len(),
                    failed_slots,
                );
                let mut pool = ConnectionPool::new(address, connections);
                pool.set_notified_up(true);
                self.pools.insert(address, pool);
                self.shared.metrics.inc_pools_opened();
                self.publish_snapshot();
                self.listener.on_pool_up(address);

                // Slots whose connectors failed transiently start
                // reconnecting right away.
                for _ in 0..failed_slots {
                    self.schedule_reconnect(address);
                }
            }
            Err(error) if error.is_critical() => {
                warn!("[{}] Pool failed to connect: {}", address, error);
                self.listener.on_pool_critical_error(address, &error);
            }
            Err(error) => {
                // Transient total failure: the manager does not retry; the
                // topology layer re-adds the host while it considers it
                // present.
                debug!("[{}] Pool failed to connect: {}", address, error);
            }
        }
    }

    fn schedule_reconnect(&mut self, address: SocketAddr) {
        if self.close_state != CloseState::Open {
            return;
        }
        let Some(pool) = self.pools.get_mut(&address) else {
            return;
        };
        if !pool.is_open() {
            return;
        }

        pool.reconnect_started();
        let wait = self.shared.settings.reconnect_wait_time;
        trace!("[{}] Scheduling reconnect in {} ms", address, wait.as_millis());
        self.reconnect_timers.push(
            async move {
                tokio::time::sleep(wait).await;
                address
            }
            .boxed(),
        );
    }

    fn handle_reconnect_timer(&mut self, address: SocketAddr) {
        if self.close_state != CloseState::Open {
            return;
        }
        // The pool may be gone or closing by now; late timers are
        // discarded.
        let Some(pool) = self.pools.get(&address) else {
            return;
        };
        if !pool.is_open() {
            return;
        }

        self.shared.metrics.inc_reconnect_attempts();
        let connector = Connector::new(
            address,
            self.shared.settings.connection.clone(),
            self.shared.settings.queue_size_io,
            self.shared.keyspace.clone(),
            self.shared.flush_request_sender.clone(),
            self.shared.metrics.clone(),
        );
        self.reconnect_attempts
            .push(async move { (address, connector.connect().await) }.boxed());
    }

    fn handle_reconnect_attempt(
        &mut self,
        (address, result): (SocketAddr, Result<(PooledConnection, ErrorReceiver), ConnectionError>),
    ) {
        let discarded = if self.close_state != CloseState::Open {
            true
        } else {
            match self.pools.get_mut(&address) {
                // Pool gone or closing; dropping a just-established
                // connection closes its socket.
                None => true,
                Some(pool) if !pool.is_open() => true,
                Some(pool) => {
                    pool.reconnect_finished();
                    false
                }
            }
        };
        if discarded {
            if result.is_ok() {
                self.shared.metrics.dec_total_connections();
            }
            return;
        }

        match result {
            Ok((connection, error_receiver)) => {
                let connection = Arc::new(connection);
                self.connection_errors.push(
                    wait_for_error(address, Arc::downgrade(&connection), error_receiver).boxed(),
                );

                let went_up = {
                    let Some(pool) = self.pools.get_mut(&address) else {
                        return;
                    };
                    pool.add_connection(connection);
                    let went_up = !pool.notified_up();
                    pool.set_notified_up(true);
                    went_up
                };
                self.publish_snapshot();
                if went_up {
                    debug!("[{}] Pool is up again", address);
                    self.listener.on_pool_up(address);
                }
            }
            Err(error) if error.is_critical() => {
                warn!(
                    "[{}] Reconnect failed critically: {}; giving up on this slot",
                    address, error
                );
                self.listener.on_pool_critical_error(address, &error);

                // A pool that cannot recover removes itself once nothing is
                // left running for it. DOWN was already reported when the
                // live count reached zero.
                let is_dead = self.pools.get(&address).is_some_and(|pool| {
                    !pool.has_connections() && pool.reconnects_in_progress() == 0
                });
                if is_dead {
                    self.finalize_pool_removal(address);
                }
            }
            Err(error) => {
                debug!("[{}] Reconnect attempt failed: {}", address, error);
                self.schedule_reconnect(address);
            }
        }
    }

    fn handle_connection_event(&mut self, event: BrokenConnectionEvent) {
        let BrokenConnectionEvent {
            address,
            connection,
            error,
        } = event;
        let Some(connection) = connection.upgrade() else {
            // The connection was already dropped together with its pool.
            return;
        };

        let (closing, now_empty, went_down) = {
            let Some(pool) = self.pools.get_mut(&address) else {
                return;
            };
            if !pool.remove_connection(&connection) {
                return;
            }
            let closing = pool.close_state() == CloseState::Closing;
            let now_empty = !pool.has_connections();
            let went_down = !closing && now_empty && pool.notified_up();
            if went_down {
                pool.set_notified_up(false);
            }
            (closing, now_empty, went_down)
        };
        self.shared.metrics.dec_total_connections();

        match &error {
            Some(err) => debug!("[{}] Connection lost: {}", address, err),
            None => debug!("[{}] Connection closed", address),
        }

        self.publish_snapshot();

        if closing {
            if now_empty {
                self.finalize_pool_removal(address);
            }
            return;
        }

        if went_down {
            self.listener.on_pool_down(address);
        }

        if connection.is_closing() {
            // The close was requested, not suffered; the requester does its
            // own slot accounting.
            return;
        }

        // The connection died on its own: refill the slot.
        self.schedule_reconnect(address);
    }

    /// Removes a pool whose last connection is gone. Emits the DOWN half of
    /// the liveness pair if the listener still considers the pool up.
    fn finalize_pool_removal(&mut self, address: SocketAddr) {
        let Some(mut pool) = self.pools.remove(&address) else {
            return;
        };
        pool.set_closed();
        self.to_flush.remove(&address);
        self.shared.metrics.inc_pools_closed();
        self.publish_snapshot();
        debug!("[{}] Connection pool removed", pool.address());
        if pool.notified_up() {
            self.listener.on_pool_down(address);
        }
    }

    /// Rebuilds the lock-free selection snapshot from the open pools.
    fn publish_snapshot(&self) {
        let snapshot: PoolsSnapshot = self
            .pools
            .iter()
            .filter(|(_, pool)| pool.is_open())
            .map(|(address, pool)| (*address, Arc::new(pool.connections().to_vec())))
            .collect();
        self.shared.snapshot.store(Arc::new(snapshot));
    }

    // This must be the last call in the worker loop because closing
    // releases the manager's internal state.
    fn maybe_closed(&mut self) -> bool {
        if self.close_state == CloseState::Closing
            && self.pools.is_empty()
            && self.pending_pool_addresses.is_empty()
        {
            self.close_state = CloseState::Closed;
            self.publish_snapshot();
            debug!("Connection pool manager closed");
            self.listener.on_close();
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_validate() {
        PoolManagerSettings::default().validate().unwrap();
    }

    #[test]
    fn zero_sized_write_queue_is_rejected() {
        let settings = PoolManagerSettings {
            queue_size_io: 0,
            ..Default::default()
        };
        assert_eq!(settings.validate(), Err(BadPoolSettings::ZeroQueueSize));
    }

    #[test]
    fn zero_connect_timeout_is_rejected() {
        let mut settings = PoolManagerSettings::default();
        settings.connection.connect_timeout = Duration::ZERO;
        assert_eq!(settings.validate(), Err(BadPoolSettings::ZeroConnectTimeout));
    }
}
