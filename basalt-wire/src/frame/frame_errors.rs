//! Error types returned by the frame (de)serialization layer.

use std::str::Utf8Error;
use std::sync::Arc;

use thiserror::Error;

use super::response::CqlResponseKind;
use super::TryFromPrimitiveError;

/// An error returned when a frame header cannot be read off a socket.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FrameHeaderParseError {
    #[error("Connection was closed before body was read: missing {0} out of {1} bytes")]
    ConnectionClosed(usize, usize),
    #[error("Received a frame marked as coming from a client")]
    FrameFromClient,
    #[error("Received a frame marked as coming from a server")]
    FrameFromServer,
    #[error("Frame protocol version {0} is not supported")]
    VersionNotSupported(u8),
    #[error("Unknown frame opcode: {0}")]
    UnknownOpcode(#[from] TryFromPrimitiveError<u8>),
    #[error("Failed to read frame from socket: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for FrameHeaderParseError {
    fn from(err: std::io::Error) -> Self {
        FrameHeaderParseError::Io(Arc::new(err))
    }
}

/// An error returned when serialization of a request body fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlRequestSerializationError {
    /// Failed to serialize STARTUP request.
    #[error("Failed to serialize STARTUP request: {0}")]
    StartupSerialization(#[from] super::request::startup::StartupSerializationError),

    /// Failed to serialize AUTH_RESPONSE request.
    #[error("Failed to serialize AUTH_RESPONSE request: {0}")]
    AuthResponseSerialization(#[from] super::request::auth_response::AuthResponseSerializationError),

    /// Failed to serialize QUERY request.
    #[error("Failed to serialize QUERY request: {0}")]
    QuerySerialization(#[from] super::request::query::QuerySerializationError),
}

/// A low level deserialization error - failure to read a primitive value
/// from a byte buffer.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum LowLevelDeserializationError {
    #[error("Too few bytes received: expected {expected}, received {received}")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Value is not valid utf-8: {0}")]
    UtfError(#[from] Utf8Error),
    #[error("Length is negative or does not fit in usize: {0}")]
    InvalidLength(i64),
    #[error("Unknown consistency: {0}")]
    UnknownConsistency(u16),
    #[error(transparent)]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for LowLevelDeserializationError {
    fn from(err: std::io::Error) -> Self {
        LowLevelDeserializationError::Io(Arc::new(err))
    }
}

/// An error returned when a response body cannot be deserialized.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlResponseParseError {
    #[error("Failed to deserialize ERROR response: {0}")]
    CqlErrorParseError(#[from] CqlErrorParseError),
    #[error("Failed to deserialize AUTHENTICATE response: {0}")]
    CqlAuthenticateParseError(#[from] CqlAuthenticateParseError),
    #[error("Failed to deserialize AUTH_SUCCESS response: {0}")]
    CqlAuthSuccessParseError(#[from] CqlAuthSuccessParseError),
    #[error("Failed to deserialize AUTH_CHALLENGE response: {0}")]
    CqlAuthChallengeParseError(#[from] CqlAuthChallengeParseError),
    #[error("Failed to deserialize SUPPORTED response: {0}")]
    CqlSupportedParseError(#[from] CqlSupportedParseError),
    #[error("Failed to deserialize RESULT response: {0}")]
    CqlResultParseError(#[from] CqlResultParseError),
}

impl CqlResponseParseError {
    /// The kind of response whose parsing failed.
    pub fn to_response_kind(&self) -> CqlResponseKind {
        match self {
            CqlResponseParseError::CqlErrorParseError(_) => CqlResponseKind::Error,
            CqlResponseParseError::CqlAuthenticateParseError(_) => CqlResponseKind::Authenticate,
            CqlResponseParseError::CqlAuthSuccessParseError(_) => CqlResponseKind::AuthSuccess,
            CqlResponseParseError::CqlAuthChallengeParseError(_) => CqlResponseKind::AuthChallenge,
            CqlResponseParseError::CqlSupportedParseError(_) => CqlResponseKind::Supported,
            CqlResponseParseError::CqlResultParseError(_) => CqlResponseKind::Result,
        }
    }
}

/// An error returned when an ERROR response cannot be deserialized.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlErrorParseError {
    #[error("Malformed error code: {0}")]
    ErrorCodeParseError(LowLevelDeserializationError),
    #[error("Malformed error reason: {0}")]
    ReasonParseError(LowLevelDeserializationError),
}

/// An error returned when an AUTHENTICATE response cannot be deserialized.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlAuthenticateParseError {
    #[error("Malformed authenticator name: {0}")]
    AuthNameParseError(LowLevelDeserializationError),
}

/// An error returned when an AUTH_SUCCESS response cannot be deserialized.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlAuthSuccessParseError {
    #[error("Malformed success message: {0}")]
    SuccessMessageParseError(LowLevelDeserializationError),
}

/// An error returned when an AUTH_CHALLENGE response cannot be deserialized.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlAuthChallengeParseError {
    #[error("Malformed challenge message: {0}")]
    AuthMessageParseError(LowLevelDeserializationError),
}

/// An error returned when a SUPPORTED response cannot be deserialized.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlSupportedParseError {
    #[error("Malformed options map: {0}")]
    OptionsMapDeserialization(LowLevelDeserializationError),
}

/// An error returned when a RESULT response cannot be deserialized.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlResultParseError {
    #[error("Malformed RESULT response id: {0}")]
    ResultIdParseError(LowLevelDeserializationError),
    #[error("Unknown RESULT response id: {0}")]
    UnknownResultId(i32),
    #[error("RESULT:Set_keyspace response deserialization failed: {0}")]
    SetKeyspaceParseError(#[from] SetKeyspaceParseError),
    /// RESULT kinds that carry row, schema or prepared-statement payloads
    /// belong to the request layer and are not interpreted here.
    #[error("RESULT response id {0} is not handled by the connection layer")]
    UnhandledResultId(i32),
}

/// An error returned when a RESULT::Set_keyspace response cannot be
/// deserialized.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum SetKeyspaceParseError {
    #[error("Malformed keyspace name: {0}")]
    MalformedKeyspaceName(#[from] LowLevelDeserializationError),
}
