//! Responses received from the server.

pub mod authenticate;
pub mod error;
pub mod result;
pub mod supported;

pub use error::Error;
pub use supported::Supported;

use super::frame_errors::CqlResponseParseError;
use super::TryFromPrimitiveError;

/// Opcode of a response, used to identify the response type in a frame
/// header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ResponseOpcode {
    Error = 0x00,
    Ready = 0x02,
    Authenticate = 0x03,
    Supported = 0x06,
    Result = 0x08,
    Event = 0x0C,
    AuthChallenge = 0x0E,
    AuthSuccess = 0x10,
}

impl TryFrom<u8> for ResponseOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, TryFromPrimitiveError<u8>> {
        match value {
            0x00 => Ok(Self::Error),
            0x02 => Ok(Self::Ready),
            0x03 => Ok(Self::Authenticate),
            0x06 => Ok(Self::Supported),
            0x08 => Ok(Self::Result),
            0x0C => Ok(Self::Event),
            0x0E => Ok(Self::AuthChallenge),
            0x10 => Ok(Self::AuthSuccess),
            _ => Err(TryFromPrimitiveError {
                enum_name: "ResponseOpcode",
                primitive: value,
            }),
        }
    }
}

/// Possible responses from the server, by name. Used mainly to describe
/// which response an error pertains to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CqlResponseKind {
    Error,
    Ready,
    Authenticate,
    Supported,
    Result,
    Event,
    AuthChallenge,
    AuthSuccess,
}

impl std::fmt::Display for CqlResponseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind_str = match self {
            CqlResponseKind::Error => "ERROR",
            CqlResponseKind::Ready => "READY",
            CqlResponseKind::Authenticate => "AUTHENTICATE",
            CqlResponseKind::Supported => "SUPPORTED",
            CqlResponseKind::Result => "RESULT",
            CqlResponseKind::Event => "EVENT",
            CqlResponseKind::AuthChallenge => "AUTH_CHALLENGE",
            CqlResponseKind::AuthSuccess => "AUTH_SUCCESS",
        };

        f.write_str(kind_str)
    }
}

impl From<ResponseOpcode> for CqlResponseKind {
    fn from(opcode: ResponseOpcode) -> Self {
        match opcode {
            ResponseOpcode::Error => CqlResponseKind::Error,
            ResponseOpcode::Ready => CqlResponseKind::Ready,
            ResponseOpcode::Authenticate => CqlResponseKind::Authenticate,
            ResponseOpcode::Supported => CqlResponseKind::Supported,
            ResponseOpcode::Result => CqlResponseKind::Result,
            ResponseOpcode::Event => CqlResponseKind::Event,
            ResponseOpcode::AuthChallenge => CqlResponseKind::AuthChallenge,
            ResponseOpcode::AuthSuccess => CqlResponseKind::AuthSuccess,
        }
    }
}

/// A deserialized response body, limited to the kinds that take part in the
/// connection-setup sub-protocol. EVENT frames and request-layer RESULT
/// payloads are not deserialized by this crate.
#[derive(Debug)]
pub enum Response {
    Error(Error),
    Ready,
    Result(result::CqlResult),
    Authenticate(authenticate::Authenticate),
    AuthSuccess(authenticate::AuthSuccess),
    AuthChallenge(authenticate::AuthChallenge),
    Supported(Supported),
}

impl Response {
    pub fn to_response_kind(&self) -> CqlResponseKind {
        match self {
            Response::Error(_) => CqlResponseKind::Error,
            Response::Ready => CqlResponseKind::Ready,
            Response::Result(_) => CqlResponseKind::Result,
            Response::Authenticate(_) => CqlResponseKind::Authenticate,
            Response::AuthSuccess(_) => CqlResponseKind::AuthSuccess,
            Response::AuthChallenge(_) => CqlResponseKind::AuthChallenge,
            Response::Supported(_) => CqlResponseKind::Supported,
        }
    }

    pub fn deserialize(
        opcode: ResponseOpcode,
        buf: &mut &[u8],
    ) -> Result<Response, ResponseDeserializationError> {
        let response = match opcode {
            ResponseOpcode::Error => Response::Error(Error::deserialize(buf)?),
            ResponseOpcode::Ready => Response::Ready,
            ResponseOpcode::Authenticate => {
                Response::Authenticate(authenticate::Authenticate::deserialize(buf)?)
            }
            ResponseOpcode::Supported => Response::Supported(Supported::deserialize(buf)?),
            ResponseOpcode::Result => Response::Result(result::deserialize(buf)?),
            ResponseOpcode::AuthChallenge => {
                Response::AuthChallenge(authenticate::AuthChallenge::deserialize(buf)?)
            }
            ResponseOpcode::AuthSuccess => {
                Response::AuthSuccess(authenticate::AuthSuccess::deserialize(buf)?)
            }
            ResponseOpcode::Event => {
                return Err(ResponseDeserializationError::EventNotSupported)
            }
        };

        Ok(response)
    }
}

/// An error returned when a response body cannot be deserialized.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum ResponseDeserializationError {
    #[error(transparent)]
    Parse(#[from] CqlResponseParseError),
    #[error("EVENT frames are not deserialized by the connection layer")]
    EventNotSupported,
}

impl From<super::frame_errors::CqlErrorParseError> for ResponseDeserializationError {
    fn from(err: super::frame_errors::CqlErrorParseError) -> Self {
        ResponseDeserializationError::Parse(err.into())
    }
}

impl From<super::frame_errors::CqlAuthenticateParseError> for ResponseDeserializationError {
    fn from(err: super::frame_errors::CqlAuthenticateParseError) -> Self {
        ResponseDeserializationError::Parse(err.into())
    }
}

impl From<super::frame_errors::CqlAuthSuccessParseError> for ResponseDeserializationError {
    fn from(err: super::frame_errors::CqlAuthSuccessParseError) -> Self {
        ResponseDeserializationError::Parse(err.into())
    }
}

impl From<super::frame_errors::CqlAuthChallengeParseError> for ResponseDeserializationError {
    fn from(err: super::frame_errors::CqlAuthChallengeParseError) -> Self {
        ResponseDeserializationError::Parse(err.into())
    }
}

impl From<super::frame_errors::CqlSupportedParseError> for ResponseDeserializationError {
    fn from(err: super::frame_errors::CqlSupportedParseError) -> Self {
        ResponseDeserializationError::Parse(err.into())
    }
}

impl From<super::frame_errors::CqlResultParseError> for ResponseDeserializationError {
    fn from(err: super::frame_errors::CqlResultParseError) -> Self {
        ResponseDeserializationError::Parse(err.into())
    }
}
