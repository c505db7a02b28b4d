//! Error types surfaced by the connection pool layer.

use std::error::Error;
use std::sync::Arc;

use thiserror::Error;

use basalt_wire::frame::frame_errors::FrameHeaderParseError;
use basalt_wire::frame::request::CqlRequestKind;
use basalt_wire::frame::response::error::DbError;
use basalt_wire::frame::response::{CqlResponseKind, ResponseDeserializationError};
use basalt_wire::frame::{FrameBodyExtensionsParseError, RequestSerializationError};

/// An error message coming from the client-side authenticator.
pub type AuthError = String;

/// Failure class from which a pool does not self-recover (spec: critical
/// errors). Everything else is treated as transient and owned by the pool's
/// reconnect loop.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CriticalErrorKind {
    /// The server refused the handshake or authentication exchange.
    Auth,
    /// Protocol-level mismatch: unsupported version, malformed or unexpected
    /// frames during setup.
    Protocol,
    /// The `USE` issued while setting up a connection failed.
    Keyspace,
}

impl std::fmt::Display for CriticalErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CriticalErrorKind::Auth => "authentication error",
            CriticalErrorKind::Protocol => "protocol error",
            CriticalErrorKind::Keyspace => "keyspace error",
        };
        f.write_str(s)
    }
}

/// An error that appeared on the connection level. It indicates that the
/// connection can no longer be used (or could not be established) and should
/// be dropped.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Connect timeout elapsed")]
    ConnectTimeout,
    #[error("IO Error: {0}")]
    IoError(Arc<std::io::Error>),
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),
    #[error(transparent)]
    SetupRequestError(#[from] ConnectionSetupRequestError),
}

impl From<std::io::Error> for ConnectionError {
    fn from(value: std::io::Error) -> Self {
        ConnectionError::IoError(Arc::new(value))
    }
}

impl ConnectionError {
    /// Classifies the error per the pool's retry policy. `None` means
    /// transient: the pool keeps reconnecting. `Some(kind)` means critical:
    /// the failure is reported to the listener and the affected slot stops
    /// retrying.
    pub fn critical_kind(&self) -> Option<CriticalErrorKind> {
        match self {
            ConnectionError::ConnectTimeout => None,
            ConnectionError::IoError(_) => None,
            ConnectionError::BrokenConnection(_) => None,
            ConnectionError::SetupRequestError(err) => err.critical_kind(),
        }
    }

    pub fn is_critical(&self) -> bool {
        self.critical_kind().is_some()
    }
}

/// An error that occurred during one of the requests performed while setting
/// up a new connection: STARTUP, AUTH_RESPONSE, OPTIONS or the keyspace
/// `USE` query.
#[derive(Error, Debug, Clone)]
#[error("Failed to perform a connection setup request. Request: {request_kind}, reason: {error}")]
pub struct ConnectionSetupRequestError {
    request_kind: CqlRequestKind,
    error: ConnectionSetupRequestErrorKind,
}

impl ConnectionSetupRequestError {
    pub(crate) fn new(request_kind: CqlRequestKind, error: ConnectionSetupRequestErrorKind) -> Self {
        ConnectionSetupRequestError {
            request_kind,
            error,
        }
    }

    pub fn get_error(&self) -> &ConnectionSetupRequestErrorKind {
        &self.error
    }

    pub(crate) fn critical_kind(&self) -> Option<CriticalErrorKind> {
        use ConnectionSetupRequestErrorKind as Kind;

        // Failures of the USE query are keyspace errors no matter what the
        // server answered with, except for the connection breaking under it.
        if self.request_kind == CqlRequestKind::Query {
            return match &self.error {
                Kind::BrokenConnection(_) | Kind::RequestSerialization(_) => None,
                _ => Some(CriticalErrorKind::Keyspace),
            };
        }

        match &self.error {
            Kind::DbError(DbError::AuthenticationError | DbError::Unauthorized, _) => {
                Some(CriticalErrorKind::Auth)
            }
            Kind::DbError(_, _) => Some(CriticalErrorKind::Protocol),
            Kind::MissingAuthentication
            | Kind::AuthStartError(_)
            | Kind::AuthTokenError(_)
            | Kind::AuthFinishError(_) => Some(CriticalErrorKind::Auth),
            Kind::UnexpectedResponse(_)
            | Kind::ResponseDeserialization(_)
            | Kind::BodyExtensionsParseError(_)
            | Kind::UnableToAllocStreamId
            | Kind::RequestSerialization(_) => Some(CriticalErrorKind::Protocol),
            Kind::KeyspaceNameMismatch { .. } => Some(CriticalErrorKind::Keyspace),
            Kind::BrokenConnection(_) => None,
        }
    }
}

/// A reason why performing a connection setup request failed.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionSetupRequestErrorKind {
    #[error(transparent)]
    RequestSerialization(#[from] RequestSerializationError),

    /// Database sent an ERROR response.
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// Received a valid response, but not one this request can be answered
    /// with.
    #[error("Received unexpected response from the server: {0}")]
    UnexpectedResponse(CqlResponseKind),

    /// Received a response that could not be deserialized.
    #[error("Failed to deserialize response: {0}")]
    ResponseDeserialization(#[from] ResponseDeserializationError),

    /// Failed to parse the extension sections (compression, warnings) of a
    /// response body.
    #[error("Failed to parse response body extensions: {0}")]
    BodyExtensionsParseError(#[from] FrameBodyExtensionsParseError),

    /// The connection broke in the middle of the exchange.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// Driver was unable to allocate a stream id for the setup request.
    #[error("Unable to allocate stream id")]
    UnableToAllocStreamId,

    /// The server requires authentication but no authenticator was
    /// configured.
    #[error("Authentication is required. You can use PasswordAuthenticator to authenticate with username and password")]
    MissingAuthentication,

    /// The client-side authenticator refused to start an exchange.
    #[error("Failed to start the authentication exchange: {0}")]
    AuthStartError(AuthError),

    /// The client-side authenticator failed to produce a token.
    #[error("Client authenticator failed to produce a token: {0}")]
    AuthTokenError(AuthError),

    /// The client-side authenticator rejected the server's success proof.
    #[error("Client authenticator rejected the authentication outcome: {0}")]
    AuthFinishError(AuthError),

    /// The server confirmed a different keyspace than the one requested.
    #[error("Keyspace name mismatch; expected: {expected_keyspace_name_lowercase}, received: {result_keyspace_name_lowercase}")]
    KeyspaceNameMismatch {
        expected_keyspace_name_lowercase: String,
        result_keyspace_name_lowercase: String,
    },
}

/// An error that made an established connection unusable. Wrapped in an
/// `Arc` so that it can be cloned to every request that was pending on the
/// connection when it broke.
#[derive(Error, Debug, Clone)]
#[error("Connection broken, reason: {0}")]
pub struct BrokenConnectionError(Arc<dyn Error + Sync + Send>);

impl BrokenConnectionError {
    pub fn get_inner(&self) -> &Arc<dyn Error + Sync + Send> {
        &self.0
    }
}

impl From<BrokenConnectionErrorKind> for BrokenConnectionError {
    fn from(value: BrokenConnectionErrorKind) -> Self {
        BrokenConnectionError(Arc::new(value))
    }
}

/// A reason why a connection broke.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrokenConnectionErrorKind {
    #[error("Failed to deserialize frame: {0}")]
    FrameHeaderParseError(FrameHeaderParseError),

    #[error("Received a server frame with unexpected stream id: {0}")]
    UnexpectedStreamId(i16),

    #[error("Failed to write data: {0}")]
    WriteFailed(std::io::Error),

    #[error("Timed out while waiting for in-flight responses during connection close")]
    DrainTimeout,

    #[error(
        "Failed to send/receive data needed to perform a request via tokio channel.
        It implies that other half of the channel has been dropped.
        The connection was already broken for some other reason."
    )]
    ChannelError,
}

/// A [`PoolManagerSettings`](crate::network::PoolManagerSettings) value the
/// manager refuses to run with.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum BadPoolSettings {
    /// `queue_size_io` must admit at least one byte.
    #[error("queue_size_io must be at least 1 byte")]
    ZeroQueueSize,

    /// A zero connect timeout would time every connection attempt out
    /// before it starts.
    #[error("connect_timeout must be positive")]
    ZeroConnectTimeout,
}

/// An error returned by [`write`](crate::network::PooledConnection::write):
/// the frame was rejected up front and nothing was queued.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum WriteError {
    /// All stream ids of the connection are taken by in-flight requests.
    /// The caller should pick another connection.
    #[error("No free stream id on this connection")]
    StreamIdsExhausted,

    /// The connection's outbound buffer would exceed `queue_size_io`.
    #[error("Outbound write queue of the connection is full")]
    WriteQueueFull,

    /// The connection is shutting down and accepts no new requests.
    #[error("Connection is closing")]
    ConnectionClosing,
}

/// An error that occurred while performing a request on a connection
/// internally, during connection setup.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub(crate) enum InternalRequestError {
    #[error(transparent)]
    RequestSerialization(#[from] RequestSerializationError),
    #[error(transparent)]
    BodyExtensionsParseError(#[from] FrameBodyExtensionsParseError),
    #[error(transparent)]
    ResponseDeserialization(#[from] ResponseDeserializationError),
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),
    #[error(transparent)]
    Write(#[from] WriteError),
}

impl InternalRequestError {
    /// Ties the error to the setup request kind it occurred in.
    pub(crate) fn into_setup_error(self, request_kind: CqlRequestKind) -> ConnectionSetupRequestError {
        let kind = match self {
            InternalRequestError::RequestSerialization(e) => e.into(),
            InternalRequestError::BodyExtensionsParseError(e) => e.into(),
            InternalRequestError::ResponseDeserialization(e) => e.into(),
            InternalRequestError::BrokenConnection(e) => e.into(),
            InternalRequestError::Write(WriteError::StreamIdsExhausted) => {
                ConnectionSetupRequestErrorKind::UnableToAllocStreamId
            }
            InternalRequestError::Write(_) => {
                ConnectionSetupRequestErrorKind::BrokenConnection(
                    BrokenConnectionErrorKind::ChannelError.into(),
                )
            }
        };
        ConnectionSetupRequestError::new(request_kind, kind)
    }
}
