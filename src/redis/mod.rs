//! Shared Redis command connection.
//!
//! The broker transport publishes through this pool and the cluster
//! membership store keeps its room sets here. Pub/sub listening uses its own
//! dedicated connection (see `transport::redis`).

pub mod pool;

pub use pool::{PoolError, RedisPool};
