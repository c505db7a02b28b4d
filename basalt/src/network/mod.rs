mod connection;
mod connection_pool;
mod connector;
mod pool_manager;

pub use connection::{ConnectionConfig, PooledConnection, ResponseFrame, ResponseSender};
pub use pool_manager::{ConnectionPoolListener, ConnectionPoolManager, PoolManagerSettings};
