//! Requests sent by the client.
//!
//! Only the frames the connection-management layer itself issues are
//! represented here; PREPARE/EXECUTE/BATCH serialization lives with the
//! request layer.

pub mod auth_response;
pub mod options;
pub mod query;
pub mod startup;

use thiserror::Error;

pub use auth_response::AuthResponse;
pub use options::Options;
pub use query::Query;
pub use startup::Startup;

use super::frame_errors::{CqlRequestSerializationError, LowLevelDeserializationError};
use super::TryFromPrimitiveError;

/// The requests this layer can send, by name. Used mainly to describe which
/// request an error pertains to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CqlRequestKind {
    Startup,
    AuthResponse,
    Options,
    Query,
}

impl std::fmt::Display for CqlRequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind_str = match self {
            CqlRequestKind::Startup => "STARTUP",
            CqlRequestKind::AuthResponse => "AUTH_RESPONSE",
            CqlRequestKind::Options => "OPTIONS",
            CqlRequestKind::Query => "QUERY",
        };

        f.write_str(kind_str)
    }
}

/// Opcode of a request, used to identify the request type in a frame header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RequestOpcode {
    /// Initializes the connection. The server responds with either READY or
    /// AUTHENTICATE. Must be the first frame of a connection, except for
    /// OPTIONS which may precede it.
    Startup = 0x01,
    /// Asks the server which STARTUP options it supports. Answered with
    /// SUPPORTED.
    Options = 0x05,
    /// Executes an unprepared statement. Answered with RESULT.
    Query = 0x07,
    /// Prepares a statement for later execution.
    Prepare = 0x09,
    /// Executes a prepared statement.
    Execute = 0x0A,
    /// Registers the connection for server-pushed events.
    Register = 0x0B,
    /// Executes a list of statements as a batch.
    Batch = 0x0D,
    /// Answers a server authentication challenge.
    AuthResponse = 0x0F,
}

impl TryFrom<u8> for RequestOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, TryFromPrimitiveError<u8>> {
        match value {
            0x01 => Ok(Self::Startup),
            0x05 => Ok(Self::Options),
            0x07 => Ok(Self::Query),
            0x09 => Ok(Self::Prepare),
            0x0A => Ok(Self::Execute),
            0x0B => Ok(Self::Register),
            0x0D => Ok(Self::Batch),
            0x0F => Ok(Self::AuthResponse),
            _ => Err(TryFromPrimitiveError {
                enum_name: "RequestOpcode",
                primitive: value,
            }),
        }
    }
}

/// A request which can be serialized into a frame body.
pub trait SerializableRequest {
    const OPCODE: RequestOpcode;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError>;
}

/// A request which can be deserialized back from a frame body. Used by test
/// tooling which plays the server side of the protocol.
pub trait DeserializableRequest: SerializableRequest + Sized {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError>;
}

/// An error returned when a request body cannot be deserialized.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestDeserializationError {
    #[error(transparent)]
    LowLevel(#[from] LowLevelDeserializationError),
    #[error("Unsupported query flags: {0:#04x}")]
    UnsupportedQueryFlags(u8),
}
