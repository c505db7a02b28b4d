use std::borrow::Cow;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use basalt::errors::{ConnectionError, CriticalErrorKind};
use basalt::frame::request::{Query, RequestOpcode};
use basalt::frame::SerializedRequest;
use basalt::network::{ConnectionPoolListener, ConnectionPoolManager, PoolManagerSettings};
use basalt::Metrics;
use basalt_test_node::{Request, RequestFrame};

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PoolEvent {
    Up(SocketAddr),
    Down(SocketAddr),
    CriticalError(SocketAddr, CriticalErrorKind),
    Close,
}

/// Listener that records every callback, in order, for later assertions.
#[derive(Default)]
pub(crate) struct RecordingListener {
    events: Mutex<Vec<PoolEvent>>,
}

impl RecordingListener {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ConnectionPoolListener for RecordingListener {
    fn on_pool_up(&self, address: SocketAddr) {
        self.events.lock().unwrap().push(PoolEvent::Up(address));
    }

    fn on_pool_down(&self, address: SocketAddr) {
        self.events.lock().unwrap().push(PoolEvent::Down(address));
    }

    fn on_pool_critical_error(&self, address: SocketAddr, error: &ConnectionError) {
        let kind = error
            .critical_kind()
            .expect("on_pool_critical_error got a non-critical error");
        self.events
            .lock()
            .unwrap()
            .push(PoolEvent::CriticalError(address, kind));
    }

    fn on_close(&self) {
        self.events.lock().unwrap().push(PoolEvent::Close);
    }
}

/// Asserts that, for `address`, UP and DOWN strictly alternate starting
/// with UP. Critical errors and other addresses are ignored.
pub(crate) fn assert_alternating_liveness(events: &[PoolEvent], address: SocketAddr) {
    let mut expect_up = true;
    for event in events {
        match event {
            PoolEvent::Up(a) if *a == address => {
                assert!(expect_up, "unexpected UP in {:?}", events);
                expect_up = false;
            }
            PoolEvent::Down(a) if *a == address => {
                assert!(!expect_up, "unexpected DOWN in {:?}", events);
                expect_up = true;
            }
            _ => {}
        }
    }
}

pub(crate) fn test_settings(
    num_connections_per_host: usize,
    reconnect_wait_time: Duration,
) -> PoolManagerSettings {
    PoolManagerSettings {
        num_connections_per_host: NonZeroUsize::new(num_connections_per_host).unwrap(),
        reconnect_wait_time,
        queue_size_io: 1024 * 1024,
        connection: Default::default(),
    }
}

pub(crate) fn new_manager(
    settings: PoolManagerSettings,
) -> (ConnectionPoolManager, Arc<RecordingListener>) {
    new_manager_with_keyspace(settings, "")
}

pub(crate) fn new_manager_with_keyspace(
    settings: PoolManagerSettings,
    keyspace: &str,
) -> (ConnectionPoolManager, Arc<RecordingListener>) {
    let manager = ConnectionPoolManager::new(4, keyspace, Arc::new(Metrics::new()), settings)
        .expect("test settings are valid");
    let listener = RecordingListener::new();
    manager.set_listener(Some(listener.clone()));
    (manager, listener)
}

/// Polls `condition` until it holds or `timeout` elapses.
pub(crate) async fn wait_until(
    what: &str,
    timeout: Duration,
    mut condition: impl FnMut() -> bool,
) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(
            Instant::now() < deadline,
            "timed out after {:?} waiting for: {}",
            timeout,
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub(crate) const WAIT: Duration = Duration::from_secs(5);

pub(crate) fn query_frame(contents: &str) -> SerializedRequest {
    SerializedRequest::make(
        &Query {
            contents: Cow::Owned(contents.to_owned()),
            consistency: Default::default(),
        },
        None,
    )
    .unwrap()
}

/// Pulls everything currently buffered in the node's feedback channel and
/// returns the contents of the QUERY frames, in arrival order.
pub(crate) fn drain_queries(receiver: &mut mpsc::UnboundedReceiver<RequestFrame>) -> Vec<String> {
    let mut queries = Vec::new();
    while let Ok(frame) = receiver.try_recv() {
        if frame.opcode != RequestOpcode::Query {
            continue;
        }
        if let Ok(Request::Query(query)) = frame.deserialize() {
            queries.push(query.contents.into_owned());
        }
    }
    queries
}

/// Triggers a flush tick once the preceding writes' dirty notifications
/// have certainly reached the manager. In a real driver the I/O loop calls
/// `flush` periodically, so this lag is invisible.
pub(crate) async fn flush_soon(manager: &ConnectionPoolManager) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.flush();
}
