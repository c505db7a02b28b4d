//! Protocol-level representation of a `RESULT` response, limited to the
//! kinds the connection-setup sub-protocol produces.

use crate::frame::frame_errors::{CqlResultParseError, SetKeyspaceParseError};
use crate::frame::types;

const RESULT_KIND_VOID: i32 = 0x0001;
const RESULT_KIND_ROWS: i32 = 0x0002;
const RESULT_KIND_SET_KEYSPACE: i32 = 0x0003;
const RESULT_KIND_PREPARED: i32 = 0x0004;
const RESULT_KIND_SCHEMA_CHANGE: i32 = 0x0005;

/// Confirmation of a successful `USE` statement.
#[derive(Debug)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

impl SetKeyspace {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, SetKeyspaceParseError> {
        let keyspace_name = types::read_string(buf)?.to_owned();

        Ok(SetKeyspace { keyspace_name })
    }
}

/// The RESULT kinds the connection layer can receive: Void (generic success)
/// and Set_keyspace. Rows/Prepared/Schema_change payloads are request-layer
/// territory and are rejected here.
#[derive(Debug)]
pub enum CqlResult {
    Void,
    SetKeyspace(SetKeyspace),
}

pub fn deserialize(buf: &mut &[u8]) -> Result<CqlResult, CqlResultParseError> {
    let kind =
        types::read_int(buf).map_err(|err| CqlResultParseError::ResultIdParseError(err.into()))?;
    match kind {
        RESULT_KIND_VOID => Ok(CqlResult::Void),
        RESULT_KIND_SET_KEYSPACE => Ok(CqlResult::SetKeyspace(SetKeyspace::deserialize(buf)?)),
        RESULT_KIND_ROWS | RESULT_KIND_PREPARED | RESULT_KIND_SCHEMA_CHANGE => {
            Err(CqlResultParseError::UnhandledResultId(kind))
        }
        _ => Err(CqlResultParseError::UnknownResultId(kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn set_keyspace_roundtrip() {
        let mut body = Vec::new();
        types::write_int(RESULT_KIND_SET_KEYSPACE, &mut body);
        types::write_string("my_keyspace", &mut body).unwrap();

        let result = deserialize(&mut &body[..]).unwrap();
        assert_matches!(
            result,
            CqlResult::SetKeyspace(SetKeyspace { keyspace_name }) if keyspace_name == "my_keyspace"
        );
    }

    #[test]
    fn rows_results_are_not_handled() {
        let mut body = Vec::new();
        types::write_int(RESULT_KIND_ROWS, &mut body);

        assert_matches!(
            deserialize(&mut &body[..]),
            Err(CqlResultParseError::UnhandledResultId(RESULT_KIND_ROWS))
        );
    }
}
