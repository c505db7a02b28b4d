mod keyspace;
mod liveness;
mod pool_lifecycle;
mod utils;
mod writes;
