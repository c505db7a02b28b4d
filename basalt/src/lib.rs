//! Connection pool layer of the async Rust driver for the
//! [Basalt](https://basalt-db.github.io) wide-column database.
//!
//! This crate maintains, per server endpoint, a bounded set of multiplexed
//! long-lived TCP connections over which requests are pipelined, and
//! mediates connection selection against an evolving, partially-failing
//! cluster topology. It is the layer between the topology service (which
//! decides *which* endpoints exist) and the request layer (which decides
//! *where* to route a request and what to put in it).
//!
//! # Overview
//!
//! All activity revolves around the
//! [`ConnectionPoolManager`](network::ConnectionPoolManager):
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use basalt::network::{ConnectionPoolManager, PoolManagerSettings};
//! use basalt::observability::metrics::Metrics;
//!
//! # async fn example() {
//! let manager = ConnectionPoolManager::new(
//!     4,
//!     "",
//!     Arc::new(Metrics::new()),
//!     PoolManagerSettings::default(),
//! )
//! .unwrap();
//!
//! // The topology layer announces endpoints:
//! manager.add("10.0.0.1:9042".parse().unwrap());
//!
//! // The request layer picks connections and writes frames:
//! if let Some(connection) = manager.find_least_busy("10.0.0.1:9042".parse().unwrap()) {
//!     // connection.write(frame, response_sender) ...
//! }
//!
//! // The I/O driver ticks the batched flush:
//! manager.flush();
//! # }
//! ```
//!
//! Writes are buffered per connection and hit the socket on the next
//! [`flush`](network::ConnectionPoolManager::flush) tick, preserving
//! submission order per connection. Pool liveness (UP/DOWN, critical
//! errors, final close) is reported through the
//! [`ConnectionPoolListener`](network::ConnectionPoolListener) capability.

pub mod authentication;
pub mod errors;
pub mod network;
pub mod observability;

pub use basalt_wire::frame;
pub use basalt_wire::Compression;

pub use network::{ConnectionPoolListener, ConnectionPoolManager, PoolManagerSettings};
pub use observability::metrics::Metrics;
