//! Protocol-level representation of a `SUPPORTED` response.

use std::collections::HashMap;

use crate::frame::frame_errors::CqlSupportedParseError;
use crate::frame::types;

/// The server's answer to OPTIONS: a map of option names to their supported
/// values.
#[derive(Debug)]
pub struct Supported {
    pub options: HashMap<String, Vec<String>>,
}

impl Supported {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlSupportedParseError> {
        let options = types::read_string_multimap(buf)
            .map_err(CqlSupportedParseError::OptionsMapDeserialization)?;

        Ok(Supported { options })
    }
}
