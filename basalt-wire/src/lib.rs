//! Wire-protocol layer of the Basalt driver.
//!
//! Basalt speaks a Cassandra-family native protocol (version 4): framed
//! requests and responses with a 9-byte header carrying a per-connection
//! stream id used to multiplex in-flight requests. This crate contains the
//! frame (de)serialization code shared by the driver and by test tooling:
//! the request frames a connection-management layer sends (STARTUP, OPTIONS,
//! AUTH_RESPONSE, QUERY), the response frames it receives, and the primitive
//! value codecs they are built from.
//!
//! Response *bodies* other than the connection-setup sub-protocol
//! (authentication, SUPPORTED options, `USE` keyspace results) are carried
//! as opaque [`bytes::Bytes`]; interpreting them is the request layer's job.

pub mod frame;

pub use frame::Compression;
