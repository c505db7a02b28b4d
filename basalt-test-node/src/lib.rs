//! An in-process mock Basalt node.
//!
//! Listens on a local TCP socket, plays the server side of the connection
//! handshake and answers queries with forged frames, following a
//! configurable behavior: plain READY, SASL authentication (with optional
//! challenge round), or scripted errors. Every request frame received can
//! be fed to a test channel, and all live connections can be severed on
//! demand to exercise the driver's reconnect paths.

mod errors;
pub mod frame;
mod node;

pub use errors::MockNodeError;
pub use frame::{Request, RequestFrame, ResponseFrame};
pub use node::{HandshakeBehavior, MockNode, QueryBehavior, RunningMockNode};
