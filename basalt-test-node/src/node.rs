use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use basalt_wire::frame::frame_errors::FrameHeaderParseError;
use basalt_wire::frame::response::error::DbError;

use crate::errors::MockNodeError;
use crate::frame::{read_request_frame, Request, RequestFrame, ResponseFrame};

/// The default authenticator name the mock demands, matching what real
/// password-protected clusters announce.
pub const DEFAULT_AUTHENTICATOR: &str = "org.apache.cassandra.auth.PasswordAuthenticator";

/// How the node answers the STARTUP phase.
#[derive(Clone)]
pub enum HandshakeBehavior {
    /// Answer STARTUP with READY.
    Ready,
    /// Demand SASL authentication.
    RequireAuthentication {
        /// The exact initial response expected from the client; `None`
        /// accepts any credentials.
        expected_response: Option<Vec<u8>>,
        /// When set, the first AUTH_RESPONSE is answered with this
        /// challenge token and only the second one concludes the exchange.
        challenge: Option<Vec<u8>>,
    },
    /// Refuse STARTUP with a forged error.
    RejectStartup { error: DbError, message: String },
}

/// How the node answers QUERY frames.
#[derive(Clone)]
pub enum QueryBehavior {
    /// `USE <ks>` succeeds with a Set_keyspace result, everything else
    /// with a Void result.
    Normal,
    /// Every query is answered with a forged error.
    ForgeError { error: DbError, message: String },
}

struct NodeConfig {
    handshake: RwLock<HandshakeBehavior>,
    query: RwLock<QueryBehavior>,
    supported_options: HashMap<String, Vec<String>>,
    request_feedback: Option<mpsc::UnboundedSender<RequestFrame>>,
    /// Connections accepted beyond this count are dropped on the spot,
    /// which a driver perceives as the node resetting them mid-handshake.
    connection_limit: AtomicUsize,
}

/// A mock node under construction.
pub struct MockNode {
    handshake: HandshakeBehavior,
    query: QueryBehavior,
    supported_options: HashMap<String, Vec<String>>,
    request_feedback: Option<mpsc::UnboundedSender<RequestFrame>>,
    connection_limit: usize,
}

impl Default for MockNode {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNode {
    pub fn new() -> Self {
        let mut supported_options = HashMap::new();
        supported_options.insert("CQL_VERSION".to_owned(), vec!["3.0.0".to_owned()]);
        supported_options.insert("COMPRESSION".to_owned(), Vec::new());

        Self {
            handshake: HandshakeBehavior::Ready,
            query: QueryBehavior::Normal,
            supported_options,
            request_feedback: None,
            connection_limit: usize::MAX,
        }
    }

    pub fn with_handshake(mut self, handshake: HandshakeBehavior) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_query_behavior(mut self, query: QueryBehavior) -> Self {
        self.query = query;
        self
    }

    pub fn with_supported_options(mut self, options: HashMap<String, Vec<String>>) -> Self {
        self.supported_options = options;
        self
    }

    /// Caps the number of simultaneously served connections; see
    /// [`RunningMockNode::set_connection_limit`].
    pub fn with_connection_limit(mut self, limit: usize) -> Self {
        self.connection_limit = limit;
        self
    }

    /// Every request frame the node receives is cloned into `sender`.
    pub fn with_request_feedback(mut self, sender: mpsc::UnboundedSender<RequestFrame>) -> Self {
        self.request_feedback = Some(sender);
        self
    }

    /// Binds an ephemeral local port and starts accepting driver
    /// connections.
    pub async fn start(self) -> Result<RunningMockNode, MockNodeError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let address = listener.local_addr()?;

        let (kill_sender, _) = broadcast::channel(1);
        let connection_count = Arc::new(AtomicUsize::new(0));

        let config = Arc::new(NodeConfig {
            handshake: RwLock::new(self.handshake),
            query: RwLock::new(self.query),
            supported_options: self.supported_options,
            request_feedback: self.request_feedback,
            connection_limit: AtomicUsize::new(self.connection_limit),
        });

        let accept_handle = tokio::task::spawn(accept_loop(
            listener,
            config.clone(),
            kill_sender.clone(),
            connection_count.clone(),
        ));

        debug!("Mock node listening on {}", address);
        Ok(RunningMockNode {
            address,
            config,
            kill_sender,
            accept_handle,
            connection_count,
        })
    }
}

/// Handle to a running mock node.
pub struct RunningMockNode {
    address: SocketAddr,
    config: Arc<NodeConfig>,
    kill_sender: broadcast::Sender<()>,
    accept_handle: JoinHandle<()>,
    connection_count: Arc<AtomicUsize>,
}

impl RunningMockNode {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Number of currently served driver connections.
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Acquire)
    }

    /// Changes how subsequent STARTUPs are answered. Live connections are
    /// unaffected.
    pub fn set_handshake(&self, handshake: HandshakeBehavior) {
        *self.config.handshake.write().unwrap() = handshake;
    }

    /// Changes how subsequent QUERY frames are answered.
    pub fn set_query_behavior(&self, query: QueryBehavior) {
        *self.config.query.write().unwrap() = query;
    }

    /// Caps (or uncaps, with `None`) the number of simultaneously served
    /// connections. Excess connections are dropped right after accept.
    pub fn set_connection_limit(&self, limit: Option<usize>) {
        self.config
            .connection_limit
            .store(limit.unwrap_or(usize::MAX), Ordering::Release);
    }

    /// Severs every live connection. The node keeps accepting new ones, so
    /// drivers can reconnect.
    pub fn drop_all_connections(&self) {
        let _ = self.kill_sender.send(());
    }

    /// Stops accepting and severs all connections.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for RunningMockNode {
    fn drop(&mut self) {
        self.accept_handle.abort();
        let _ = self.kill_sender.send(());
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<NodeConfig>,
    kill_sender: broadcast::Sender<()>,
    connection_count: Arc<AtomicUsize>,
) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("Mock node failed to accept a connection: {}", err);
                continue;
            }
        };

        let limit = config.connection_limit.load(Ordering::Acquire);
        if connection_count.load(Ordering::Acquire) >= limit {
            debug!(
                "Mock node dropping connection from {}: at the limit of {}",
                peer, limit
            );
            continue;
        }
        debug!("Mock node accepted connection from {}", peer);

        let config = config.clone();
        let kill_receiver = kill_sender.subscribe();
        let connection_count = connection_count.clone();
        connection_count.fetch_add(1, Ordering::AcqRel);
        tokio::task::spawn(async move {
            let result = connection_worker(socket, config, kill_receiver).await;
            connection_count.fetch_sub(1, Ordering::AcqRel);
            match result {
                Ok(()) => debug!("Mock node connection from {} closed", peer),
                Err(MockNodeError::FrameRead(FrameHeaderParseError::Io(err)))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    debug!("Mock node connection from {} disconnected", peer);
                }
                Err(err) => warn!("Mock node connection from {} errored: {}", peer, err),
            }
        });
    }
}

struct ConnectionState {
    challenge_sent: bool,
}

async fn connection_worker(
    socket: TcpStream,
    config: Arc<NodeConfig>,
    mut kill_receiver: broadcast::Receiver<()>,
) -> Result<(), MockNodeError> {
    let (read_half, mut write_half) = socket.into_split();
    let mut read_half = BufReader::new(read_half);
    let mut state = ConnectionState {
        challenge_sent: false,
    };

    loop {
        let frame = tokio::select! {
            res = read_request_frame(&mut read_half) => res?,
            _ = kill_receiver.recv() => {
                // Dropping the socket severs the connection abruptly, as if
                // the node had gone down.
                return Ok(());
            }
        };

        if let Some(feedback) = &config.request_feedback {
            let _ = feedback.send(frame.clone());
        }

        handle_request(&frame, &config, &mut state, &mut write_half).await?;
    }
}

async fn handle_request(
    frame: &RequestFrame,
    config: &NodeConfig,
    state: &mut ConnectionState,
    write_half: &mut OwnedWriteHalf,
) -> Result<(), MockNodeError> {
    let response = match frame.deserialize()? {
        Request::Options => {
            ResponseFrame::forged_supported(frame.params, &config.supported_options)
        }
        Request::Startup(_) => {
            let handshake = config.handshake.read().unwrap().clone();
            match handshake {
                HandshakeBehavior::Ready => ResponseFrame::forged_ready(frame.params),
                HandshakeBehavior::RequireAuthentication { .. } => {
                    ResponseFrame::forged_authenticate(frame.params, DEFAULT_AUTHENTICATOR)
                }
                HandshakeBehavior::RejectStartup { error, message } => {
                    ResponseFrame::forged_error(frame.params, error, &message)
                }
            }
        }
        Request::AuthResponse(auth_response) => {
            let handshake = config.handshake.read().unwrap().clone();
            match handshake {
                HandshakeBehavior::RequireAuthentication {
                    expected_response,
                    challenge,
                } => {
                    if let (Some(token), false) = (&challenge, state.challenge_sent) {
                        state.challenge_sent = true;
                        ResponseFrame::forged_auth_challenge(frame.params, Some(token))
                    } else {
                        let accepted = match &expected_response {
                            None => true,
                            Some(expected) => {
                                auth_response.response.as_deref() == Some(&expected[..])
                            }
                        };
                        if accepted {
                            ResponseFrame::forged_auth_success(frame.params, None)
                        } else {
                            ResponseFrame::forged_error(
                                frame.params,
                                DbError::AuthenticationError,
                                "Provided credentials are incorrect",
                            )
                        }
                    }
                }
                _ => ResponseFrame::forged_error(
                    frame.params,
                    DbError::ProtocolError,
                    "Unexpected AUTH_RESPONSE",
                ),
            }
        }
        Request::Query(query) => {
            let query_behavior = config.query.read().unwrap().clone();
            match query_behavior {
                QueryBehavior::ForgeError { error, message } => {
                    ResponseFrame::forged_error(frame.params, error, &message)
                }
                QueryBehavior::Normal => match query.contents.strip_prefix("USE ") {
                    Some(keyspace) => ResponseFrame::forged_set_keyspace_result(
                        frame.params,
                        keyspace.trim().trim_matches('"'),
                    ),
                    None => ResponseFrame::forged_void_result(frame.params),
                },
            }
        }
        Request::Other(opcode) => ResponseFrame::forged_error(
            frame.params,
            DbError::ProtocolError,
            &format!("Request {:?} is not supported by the mock node", opcode),
        ),
    };

    response.write(write_half).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_wire::frame::request::{Options, SerializableRequest, Startup};
    use basalt_wire::frame::{read_response_frame, response::ResponseOpcode, SerializedRequest};
    use tokio::io::AsyncWriteExt;

    async fn send_request(socket: &mut TcpStream, req: &impl SerializableRequest, stream: i16) {
        let mut serialized = SerializedRequest::make(req, None).unwrap();
        serialized.set_stream(stream);
        socket.write_all(serialized.get_data()).await.unwrap();
        socket.flush().await.unwrap();
    }

    #[tokio::test]
    async fn answers_handshake_and_echoes_stream_ids() {
        let node = MockNode::new().start().await.unwrap();
        let mut socket = TcpStream::connect(node.address()).await.unwrap();

        send_request(&mut socket, &Options, 7).await;
        let (params, opcode, _body) = read_response_frame(&mut socket).await.unwrap();
        assert_eq!(opcode, ResponseOpcode::Supported);
        assert_eq!(params.stream, 7);

        send_request(
            &mut socket,
            &Startup {
                options: Default::default(),
            },
            8,
        )
        .await;
        let (params, opcode, _body) = read_response_frame(&mut socket).await.unwrap();
        assert_eq!(opcode, ResponseOpcode::Ready);
        assert_eq!(params.stream, 8);
    }

    #[tokio::test]
    async fn severed_connections_hit_eof() {
        let node = MockNode::new().start().await.unwrap();
        let mut socket = TcpStream::connect(node.address()).await.unwrap();

        send_request(&mut socket, &Options, 0).await;
        read_response_frame(&mut socket).await.unwrap();

        node.drop_all_connections();
        assert!(read_response_frame(&mut socket).await.is_err());
    }
}
