//! Protocol-level representation of an `AUTH_RESPONSE` request.

use std::num::TryFromIntError;

use thiserror::Error;

use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::request::{
    DeserializableRequest, RequestDeserializationError, RequestOpcode, SerializableRequest,
};
use crate::frame::types;

/// One client message of the SASL exchange. The exchange starts with the
/// client answering AUTHENTICATE and continues until the server sends
/// AUTH_SUCCESS or an ERROR.
pub struct AuthResponse {
    pub response: Option<Vec<u8>>,
}

impl SerializableRequest for AuthResponse {
    const OPCODE: RequestOpcode = RequestOpcode::AuthResponse;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        Ok(types::write_bytes_opt(self.response.as_ref(), buf)
            .map_err(AuthResponseSerializationError::ResponseSerialization)
            .map_err(CqlRequestSerializationError::AuthResponseSerialization)?)
    }
}

impl DeserializableRequest for AuthResponse {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let response = types::read_bytes_opt(buf)?.map(ToOwned::to_owned);
        Ok(Self { response })
    }
}

/// An error type returned when serialization of AUTH_RESPONSE request fails.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum AuthResponseSerializationError {
    /// Maximum response's body length exceeded.
    #[error("AUTH_RESPONSE body bytes length too big: {0}")]
    ResponseSerialization(TryFromIntError),
}
