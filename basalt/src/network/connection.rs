use crate::authentication::Authenticator;
use crate::errors::{
    BrokenConnectionError, BrokenConnectionErrorKind, ConnectionError, InternalRequestError,
    WriteError,
};

use basalt_wire::frame::response::{Response, ResponseOpcode};
use basalt_wire::frame::{self, Compression, FrameParams, SerializedRequest};

use bytes::Bytes;
use futures::future::RemoteHandle;
use futures::FutureExt;
use socket2::{SockRef, TcpKeepalive};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace, warn};

/// How long a closing connection keeps reading in order to let in-flight
/// requests complete before the socket is torn down.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration applied to every connection the manager opens.
///
/// TLS is deliberately absent: the pool layer treats transport security as
/// an outer concern and this struct keeps the extension point.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub compression: Option<Compression>,
    pub tcp_nodelay: bool,
    pub tcp_keepalive_interval: Option<Duration>,
    pub connect_timeout: Duration,
    pub authenticator: Option<Arc<dyn Authenticator>>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            connect_timeout: Duration::from_secs(5),
            authenticator: None,
        }
    }
}

/// A raw response frame routed back to the request that submitted it.
/// The body is opaque at this level; the submitter parses it.
#[derive(Debug)]
pub struct ResponseFrame {
    pub params: FrameParams,
    pub opcode: ResponseOpcode,
    pub body: Bytes,
}

/// Channel on which the submitter of a frame receives its response (or the
/// error that broke the connection).
pub type ResponseSender = oneshot::Sender<Result<ResponseFrame, BrokenConnectionError>>;

/// Used by the pool to wait for a fatal error on the connection. Yields
/// nothing if the connection shut down cleanly.
pub(crate) type ErrorReceiver = oneshot::Receiver<ConnectionError>;

struct ResponseHandler {
    response_sender: ResponseSender,
}

/// One multiplexed framed socket.
///
/// All submitted frames are buffered in a byte-bounded FIFO and hit the
/// socket on the next flush tick; responses are routed back by stream id by
/// a background router task. The connection accepts `write` calls from any
/// thread.
pub struct PooledConnection {
    connect_address: SocketAddr,
    queue_size_io: usize,
    compression: Option<Compression>,
    keyspace_name: Option<String>,
    shared: Arc<ConnectionShared>,
    flush_request_sender: mpsc::UnboundedSender<SocketAddr>,
    _worker_handle: RemoteHandle<()>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connect_address", &self.connect_address)
            .field(
                "inflight",
                &self.shared.inflight_request_count.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

struct ConnectionShared {
    submit: StdMutex<SubmitState>,
    inflight_request_count: AtomicUsize,
    closing: AtomicBool,
    flush_notify: Notify,
    close_notify: Notify,
}

impl ConnectionShared {
    fn new() -> Self {
        Self {
            submit: StdMutex::new(SubmitState {
                handler_map: ResponseHandlerMap::new(),
                queue: VecDeque::new(),
                queued_bytes: 0,
            }),
            inflight_request_count: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            flush_notify: Notify::new(),
            close_notify: Notify::new(),
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn take_queued_frames(&self) -> VecDeque<SerializedRequest> {
        let mut state = self.submit.lock().unwrap();
        state.queued_bytes = 0;
        std::mem::take(&mut state.queue)
    }
}

struct SubmitState {
    handler_map: ResponseHandlerMap,
    queue: VecDeque<SerializedRequest>,
    queued_bytes: usize,
}

impl PooledConnection {
    /// Opens a socket to `connect_address` and spawns the router task.
    /// The connection is ready for frames on the transport level; the
    /// protocol-level handshake has not been performed yet.
    pub(crate) async fn new(
        connect_address: SocketAddr,
        config: &ConnectionConfig,
        queue_size_io: usize,
        flush_request_sender: mpsc::UnboundedSender<SocketAddr>,
    ) -> Result<(Self, ErrorReceiver), ConnectionError> {
        let stream = match tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect(connect_address),
        )
        .await
        {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(ConnectionError::ConnectTimeout);
            }
        };
        stream.set_nodelay(config.tcp_nodelay)?;

        if let Some(tcp_keepalive_interval) = config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, tcp_keepalive_interval)?;
        }

        let shared = Arc::new(ConnectionShared::new());
        let (error_sender, error_receiver) = oneshot::channel();

        let (task, _worker_handle) =
            Self::router(stream, shared.clone(), error_sender).remote_handle();
        tokio::task::spawn(task);

        let connection = PooledConnection {
            connect_address,
            queue_size_io,
            compression: None,
            keyspace_name: None,
            shared,
            flush_request_sender,
            _worker_handle,
        };

        Ok((connection, error_receiver))
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // `with_time` is the idle time until keepalives start being sent;
        // the probe interval itself is fixed at one second.
        let mut tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

        // These cfg values are taken from the socket2 library, which uses
        // the same constraints.
        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "windows",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));
        }

        let sf = SockRef::from(stream);
        sf.set_tcp_keepalive(&tcp_keepalive)
    }

    /// The address this connection's socket is connected to.
    pub fn address(&self) -> SocketAddr {
        self.connect_address
    }

    /// The keyspace this connection was put in while it was set up, if any.
    pub fn keyspace(&self) -> Option<&str> {
        self.keyspace_name.as_deref()
    }

    /// The compression negotiated for this connection, if any.
    pub fn compression(&self) -> Option<Compression> {
        self.compression
    }

    pub(crate) fn set_compression(&mut self, compression: Option<Compression>) {
        self.compression = compression;
    }

    pub(crate) fn set_keyspace_name(&mut self, keyspace_name: Option<String>) {
        self.keyspace_name = keyspace_name;
    }

    /// The number of requests currently awaiting a response. Load balancing
    /// compares these scores across sibling connections of a pool.
    pub fn find_least_busy_score(&self) -> usize {
        self.shared.inflight_request_count.load(Ordering::Relaxed)
    }

    /// Appends a frame to the outbound buffer, assigning it a free stream
    /// id. The frame hits the socket on the next flush tick; the response
    /// (or the connection-breaking error) arrives on `response_sender`.
    ///
    /// Fails fast without queueing anything when the connection is closing,
    /// its outbound buffer is at capacity, or no stream id is free.
    pub fn write(
        &self,
        mut frame: SerializedRequest,
        response_sender: ResponseSender,
    ) -> Result<(), WriteError> {
        let became_dirty = {
            let mut state = self.shared.submit.lock().unwrap();
            if self.shared.is_closing() {
                return Err(WriteError::ConnectionClosing);
            }

            let frame_len = frame.get_data().len();
            if state.queued_bytes + frame_len > self.queue_size_io {
                return Err(WriteError::WriteQueueFull);
            }

            let stream_id = match state
                .handler_map
                .allocate(ResponseHandler { response_sender })
            {
                Ok(stream_id) => stream_id,
                Err(_handler) => return Err(WriteError::StreamIdsExhausted),
            };

            frame.set_stream(stream_id);
            state.queue.push_back(frame);
            state.queued_bytes += frame_len;
            self.shared
                .inflight_request_count
                .fetch_add(1, Ordering::AcqRel);

            state.queue.len() == 1
        };

        if became_dirty {
            // First frame queued since the last flush: ask the manager to
            // include this connection's pool in the next flush tick. During
            // connection setup nobody owns the pool yet and the
            // notification is simply ignored.
            let _ = self.flush_request_sender.send(self.connect_address);
        }

        Ok(())
    }

    /// Wakes the writer task to drain the outbound buffer to the socket.
    pub(crate) fn flush(&self) {
        self.shared.flush_notify.notify_one();
    }

    pub(crate) fn has_pending_writes(&self) -> bool {
        !self.shared.submit.lock().unwrap().queue.is_empty()
    }

    /// Stops accepting new writes, drains buffered frames and lets
    /// in-flight responses complete (bounded) before the router exits.
    pub(crate) fn initiate_close(&self) {
        let already_closing = {
            let _state = self.shared.submit.lock().unwrap();
            self.shared.closing.swap(true, Ordering::AcqRel)
        };
        if !already_closing {
            self.shared.flush_notify.notify_one();
            self.shared.close_notify.notify_one();
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.shared.is_closing()
    }

    /// Performs one request of the connection-setup sub-protocol: serialize,
    /// queue, flush immediately (no manager is driving flushes yet) and
    /// parse the response.
    pub(crate) async fn send_setup_request(
        &self,
        req: &impl basalt_wire::frame::request::SerializableRequest,
        compression: Option<Compression>,
    ) -> Result<Response, InternalRequestError> {
        let serialized = SerializedRequest::make(req, compression)?;
        let (response_sender, receiver) = oneshot::channel();
        self.write(serialized, response_sender)?;
        self.flush();

        let response_frame = receiver.await.map_err(|_| -> BrokenConnectionError {
            BrokenConnectionErrorKind::ChannelError.into()
        })??;

        let body_with_ext = frame::parse_response_body_extensions(
            response_frame.params.flags,
            compression,
            response_frame.body,
        )?;

        for warn_description in &body_with_ext.warnings {
            warn!(
                warning = warn_description.as_str(),
                "Response to a connection setup request contains a warning",
            );
        }

        let response =
            Response::deserialize(response_frame.opcode, &mut &*body_with_ext.body)?;

        Ok(response)
    }

    async fn router(
        stream: TcpStream,
        shared: Arc<ConnectionShared>,
        error_sender: oneshot::Sender<ConnectionError>,
    ) {
        let (read_half, write_half) = split(stream);

        let r = Self::reader(BufReader::with_capacity(8192, read_half), &shared);
        let w = Self::writer(BufWriter::with_capacity(8192, write_half), &shared);

        let result = futures::try_join!(r, w);

        let broken_error: Option<BrokenConnectionError> = match result {
            Ok(_) => None,
            Err(err) => Some(err),
        };

        // Respond to all requests still pending on this connection. After a
        // clean close the handler map is expected to be empty; anything left
        // raced with the shutdown and gets a channel error.
        let handlers = {
            let mut state = shared.submit.lock().unwrap();
            state.queue.clear();
            state.queued_bytes = 0;
            state.handler_map.drain_handlers()
        };
        shared.inflight_request_count.store(0, Ordering::Release);

        let handler_error = broken_error
            .clone()
            .unwrap_or_else(|| BrokenConnectionErrorKind::ChannelError.into());
        for (_, handler) in handlers {
            // Ignore sending error, the request was dropped.
            let _ = handler.response_sender.send(Err(handler_error.clone()));
        }

        // If someone is listening for connection errors, notify them.
        // Dropping the sender without sending marks a clean close.
        if let Some(err) = broken_error {
            let _ = error_sender.send(err.into());
        }
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        shared: &ConnectionShared,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            if shared.is_closing()
                && shared.inflight_request_count.load(Ordering::Acquire) == 0
            {
                return Ok(());
            }

            let read_fut = frame::read_response_frame(&mut read_half);
            tokio::pin!(read_fut);

            let read_result = if shared.is_closing() {
                match tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, &mut read_fut).await {
                    Ok(res) => res,
                    Err(_) => return Err(BrokenConnectionErrorKind::DrainTimeout.into()),
                }
            } else {
                tokio::select! {
                    res = &mut read_fut => res,
                    _ = shared.close_notify.notified() => {
                        if shared.inflight_request_count.load(Ordering::Acquire) == 0 {
                            // Nothing outstanding; abandon the read.
                            return Ok(());
                        }
                        match tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, &mut read_fut).await {
                            Ok(res) => res,
                            Err(_) => {
                                return Err(BrokenConnectionErrorKind::DrainTimeout.into())
                            }
                        }
                    }
                }
            };

            let (params, opcode, body) =
                read_result.map_err(BrokenConnectionErrorKind::FrameHeaderParseError)?;

            match params.stream.cmp(&-1) {
                CmpOrdering::Less => {
                    // The protocol reserves negative-numbered streams for
                    // server-generated frames; -1 is the only one in use.
                    continue;
                }
                CmpOrdering::Equal => {
                    // Server events (topology, schema) belong to the
                    // metadata layer, which keeps its own connection.
                    trace!("Ignoring server event frame on pooled connection");
                    continue;
                }
                _ => {}
            }

            let handler = {
                let mut state = shared.submit.lock().unwrap();
                state.handler_map.lookup(params.stream)
            };

            match handler {
                Some(handler) => {
                    shared.inflight_request_count.fetch_sub(1, Ordering::AcqRel);
                    // Don't care if sending of the response fails. This must
                    // mean that the receiver side was impatient and is not
                    // waiting for the result anymore.
                    let _ = handler.response_sender.send(Ok(ResponseFrame {
                        params,
                        opcode,
                        body,
                    }));
                }
                None => {
                    // Unsolicited frame. This should not happen and
                    // indicates a bug either in the driver, or in the
                    // database.
                    debug!(
                        "Received response with unexpected stream id {}",
                        params.stream
                    );
                    return Err(
                        BrokenConnectionErrorKind::UnexpectedStreamId(params.stream).into()
                    );
                }
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        shared: &ConnectionShared,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            shared.flush_notify.notified().await;

            Self::drain_queue(&mut write_half, shared).await?;

            if shared.is_closing() {
                // A write may have slipped in between our drain and the
                // closing flag flip; both happen under the submit lock, so
                // one more drain catches everything that was accepted.
                Self::drain_queue(&mut write_half, shared).await?;
                return Ok(());
            }
        }
    }

    async fn drain_queue(
        write_half: &mut (impl AsyncWrite + Unpin),
        shared: &ConnectionShared,
    ) -> Result<(), BrokenConnectionError> {
        let frames = shared.take_queued_frames();
        if frames.is_empty() {
            return Ok(());
        }

        let mut num_requests = 0;
        let mut total_sent = 0;
        for frame in &frames {
            let data = frame.get_data();
            num_requests += 1;
            total_sent += data.len();
            write_half
                .write_all(data)
                .await
                .map_err(BrokenConnectionErrorKind::WriteFailed)?;
        }
        write_half
            .flush()
            .await
            .map_err(BrokenConnectionErrorKind::WriteFailed)?;
        trace!("Flushed {} requests; {} bytes", num_requests, total_sent);

        Ok(())
    }
}

struct ResponseHandlerMap {
    stream_set: StreamIdSet,
    handlers: HashMap<i16, ResponseHandler>,
}

impl ResponseHandlerMap {
    fn new() -> Self {
        Self {
            stream_set: StreamIdSet::new(),
            handlers: HashMap::new(),
        }
    }

    fn allocate(&mut self, response_handler: ResponseHandler) -> Result<i16, ResponseHandler> {
        if let Some(stream_id) = self.stream_set.allocate() {
            let prev_handler = self.handlers.insert(stream_id, response_handler);
            debug_assert!(prev_handler.is_none());

            Ok(stream_id)
        } else {
            Err(response_handler)
        }
    }

    fn lookup(&mut self, stream_id: i16) -> Option<ResponseHandler> {
        self.stream_set.free(stream_id);
        self.handlers.remove(&stream_id)
    }

    // Retrieves the map of handlers, used after the connection breaks and we
    // have to respond to all of them with an error.
    fn drain_handlers(&mut self) -> HashMap<i16, ResponseHandler> {
        std::mem::take(&mut self.handlers)
    }
}

/// Bounded free set over the 15-bit stream id space, allocation in O(1).
struct StreamIdSet {
    used_bitmap: Box<[u64]>,
}

impl StreamIdSet {
    fn new() -> Self {
        const BITMAP_SIZE: usize = (i16::MAX as usize + 1) / 64;
        Self {
            used_bitmap: vec![0; BITMAP_SIZE].into_boxed_slice(),
        }
    }

    fn allocate(&mut self) -> Option<i16> {
        for (block_id, block) in self.used_bitmap.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones();
                *block |= 1u64 << off;
                let stream_id = off as i16 + block_id as i16 * 64;
                return Some(stream_id);
            }
        }
        None
    }

    fn free(&mut self, stream_id: i16) {
        let block_id = stream_id as usize / 64;
        let off = stream_id as usize % 64;
        self.used_bitmap[block_id] &= !(1 << off);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[test]
    fn stream_id_set_allocates_whole_space() {
        let mut set = StreamIdSet::new();
        let first = set.allocate().unwrap();
        assert_eq!(first, 0);

        // Exhaust the space, then check that a freed id becomes available
        // again.
        let mut count = 1;
        while set.allocate().is_some() {
            count += 1;
        }
        assert_eq!(count, i16::MAX as usize + 1);

        set.free(1234);
        assert_eq!(set.allocate(), Some(1234));
        assert_eq!(set.allocate(), None);
    }

    #[test]
    fn handler_map_reuses_freed_ids() {
        let mut map = ResponseHandlerMap::new();

        let (sender, _receiver) = oneshot::channel();
        let id = map
            .allocate(ResponseHandler {
                response_sender: sender,
            })
            .ok()
            .unwrap();

        assert!(map.lookup(id).is_some());
        // Looking the id up again yields nothing; the handler is gone.
        assert!(map.lookup(id).is_none());

        let (sender, _receiver) = oneshot::channel();
        let id_again = map
            .allocate(ResponseHandler {
                response_sender: sender,
            })
            .ok()
            .unwrap();
        assert_eq!(id, id_again);
    }
}
