//! Protocol-level representation of an `ERROR` response.

use thiserror::Error;

use crate::frame::frame_errors::CqlErrorParseError;
use crate::frame::types;

/// An `ERROR` response: a database-side error code plus a human-readable
/// reason.
#[derive(Debug, Clone)]
pub struct Error {
    pub error: DbError,
    pub reason: String,
}

impl Error {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlErrorParseError> {
        let code = types::read_int(buf)
            .map_err(|err| CqlErrorParseError::ErrorCodeParseError(err.into()))?;
        let reason = types::read_string(buf)
            .map_err(CqlErrorParseError::ReasonParseError)?
            .to_owned();

        Ok(Error {
            error: DbError::from_code(code),
            reason,
        })
    }
}

/// An error sent from the database in response to a request.
///
/// Only the parameterless error kinds are represented: the kinds with
/// structured payloads (UNAVAILABLE, timeouts, failures) are responses to
/// data requests, which the request layer deserializes with its own, richer
/// machinery. Unknown and parameterized codes surface as [`DbError::Other`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DbError {
    /// Internal server error. This indicates a server-side bug.
    #[error("Internal server error")]
    ServerError,

    /// The protocol has been violated - e.g. a QUERY before STARTUP.
    #[error("The protocol has been violated")]
    ProtocolError,

    /// Authentication was required and failed.
    #[error("Authentication failed")]
    AuthenticationError,

    /// The request cannot be processed because the coordinator is
    /// overloaded.
    #[error("The node is overloaded")]
    Overloaded,

    /// The coordinator was bootstrapping when it received the request.
    #[error("The node is bootstrapping")]
    IsBootstrapping,

    /// Error during truncate.
    #[error("Truncate error")]
    TruncateError,

    /// The submitted statement has a syntax error.
    #[error("The statement has a syntax error")]
    SyntaxError,

    /// The logged user doesn't have the right to perform the statement.
    #[error("Not authorized to perform this statement")]
    Unauthorized,

    /// The statement is syntactically correct but invalid - e.g. a `USE` of
    /// a keyspace that does not exist.
    #[error("The statement is invalid")]
    Invalid,

    /// The statement is invalid because of a configuration issue.
    #[error("The statement is invalid because of a configuration issue")]
    ConfigError,

    /// Any other error code.
    #[error("Other error (code {0})")]
    Other(i32),
}

impl DbError {
    pub fn from_code(code: i32) -> DbError {
        match code {
            0x0000 => DbError::ServerError,
            0x000A => DbError::ProtocolError,
            0x0100 => DbError::AuthenticationError,
            0x1001 => DbError::Overloaded,
            0x1002 => DbError::IsBootstrapping,
            0x1003 => DbError::TruncateError,
            0x2000 => DbError::SyntaxError,
            0x2100 => DbError::Unauthorized,
            0x2200 => DbError::Invalid,
            0x2300 => DbError::ConfigError,
            _ => DbError::Other(code),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            DbError::ServerError => 0x0000,
            DbError::ProtocolError => 0x000A,
            DbError::AuthenticationError => 0x0100,
            DbError::Overloaded => 0x1001,
            DbError::IsBootstrapping => 0x1002,
            DbError::TruncateError => 0x1003,
            DbError::SyntaxError => 0x2000,
            DbError::Unauthorized => 0x2100,
            DbError::Invalid => 0x2200,
            DbError::ConfigError => 0x2300,
            DbError::Other(code) => *code,
        }
    }
}
