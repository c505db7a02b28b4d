//! Protocol-level representation of a `STARTUP` request.

use std::borrow::Cow;
use std::collections::HashMap;
use std::num::TryFromIntError;

use thiserror::Error;

use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::request::{
    DeserializableRequest, RequestDeserializationError, RequestOpcode, SerializableRequest,
};
use crate::frame::types;

/// Option key under which the client declares the protocol dialect version.
pub const CQL_VERSION: &str = "CQL_VERSION";
/// The dialect version this driver requests.
pub const DEFAULT_CQL_PROTOCOL_VERSION: &str = "3.0.0";
/// Option key under which compression is requested.
pub const COMPRESSION: &str = "COMPRESSION";
/// Option key under which the driver identifies itself.
pub const DRIVER_NAME: &str = "DRIVER_NAME";
/// The name this driver identifies itself with.
pub const DEFAULT_DRIVER_NAME: &str = "Basalt Rust Driver";

/// `STARTUP` finalises the connection negotiation phase: the client commits
/// to the options it picked from the server's SUPPORTED set.
pub struct Startup<'a> {
    pub options: HashMap<Cow<'a, str>, Cow<'a, str>>,
}

impl SerializableRequest for Startup<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Startup;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        types::write_string_map(&self.options, buf)
            .map_err(StartupSerializationError::OptionsSerialization)?;
        Ok(())
    }
}

/// An error type returned when serialization of STARTUP request fails.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum StartupSerializationError {
    /// Failed to serialize startup options.
    #[error("Malformed startup options: {0}")]
    OptionsSerialization(TryFromIntError),
}

impl DeserializableRequest for Startup<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let options = types::read_string_map(buf)?
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Ok(Self { options })
    }
}
