//! Protocol-level representation of an `OPTIONS` request.

use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::request::{RequestOpcode, SerializableRequest};

/// `OPTIONS` asks the server which STARTUP options it supports. It carries
/// no body and may be sent before STARTUP.
pub struct Options;

impl SerializableRequest for Options {
    const OPCODE: RequestOpcode = RequestOpcode::Options;

    fn serialize(&self, _buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        Ok(())
    }
}
