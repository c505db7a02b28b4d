//! Protocol-level representation of a `QUERY` request.

use std::borrow::Cow;
use std::num::TryFromIntError;

use thiserror::Error;

use crate::frame::frame_errors::{CqlRequestSerializationError, LowLevelDeserializationError};
use crate::frame::request::{
    DeserializableRequest, RequestDeserializationError, RequestOpcode, SerializableRequest,
};
use crate::frame::types::{self, Consistency};

/// An unprepared statement with its execution parameters.
///
/// The connection layer issues only parameterless statements (`USE` on
/// connect), so no value/paging parameter flags are ever set; the request
/// layer serializes its own, richer QUERY frames.
#[cfg_attr(test, derive(Debug, PartialEq, Eq))]
pub struct Query<'q> {
    pub contents: Cow<'q, str>,
    pub consistency: Consistency,
}

impl SerializableRequest for Query<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        types::write_long_string(&self.contents, buf)
            .map_err(QuerySerializationError::StatementStringSerialization)?;
        types::write_consistency(self.consistency, buf);
        // No values, paging, serial consistency nor timestamp.
        buf.push(0x00);
        Ok(())
    }
}

impl DeserializableRequest for Query<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let contents = Cow::Owned(types::read_long_string(buf)?.to_owned());
        let consistency = types::read_consistency(buf)?;

        let flags = *buf.first().ok_or(RequestDeserializationError::LowLevel(
            LowLevelDeserializationError::TooFewBytesReceived {
                expected: 1,
                received: 0,
            },
        ))?;
        *buf = &buf[1..];
        if flags != 0x00 {
            return Err(RequestDeserializationError::UnsupportedQueryFlags(flags));
        }

        Ok(Self {
            contents,
            consistency,
        })
    }
}

/// An error type returned when serialization of QUERY request fails.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum QuerySerializationError {
    /// Failed to serialize the statement contents.
    #[error("Failed to serialize statement contents: {0}")]
    StatementStringSerialization(TryFromIntError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_roundtrip() {
        let query = Query {
            contents: Cow::Borrowed("USE some_keyspace"),
            consistency: Consistency::One,
        };

        let mut body = Vec::new();
        query.serialize(&mut body).unwrap();

        let deserialized = Query::deserialize(&mut &body[..]).unwrap();
        assert_eq!(deserialized, query);
    }
}
