//! PostgreSQL connection pool used by the database-notify transport and the
//! per-tenant identity store.

mod pool;

pub use pool::{PostgresPool, PostgresPoolError};
