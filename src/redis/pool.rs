use std::future::Future;
use std::sync::Arc;

use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, RedisResult};
use tokio::sync::RwLock;

use crate::config::RedisConfig;
use crate::resilience::{CircuitBreaker, CircuitState};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Circuit breaker is open")]
    CircuitOpen,
}

/// Multiplexed Redis connection guarded by a circuit breaker.
///
/// The connection is established lazily and dropped after an I/O error so the
/// next call reconnects.
pub struct RedisPool {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    circuit_breaker: Arc<CircuitBreaker>,
    url: String,
}

impl RedisPool {
    pub fn new(config: &RedisConfig) -> Result<Self, PoolError> {
        let client = Client::open(config.url.as_str())?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            circuit_breaker: Arc::new(CircuitBreaker::new("redis", config.circuit_breaker())),
            url: config.url.clone(),
        })
    }

    pub async fn get_connection(&self) -> Result<MultiplexedConnection, PoolError> {
        if !self.circuit_breaker.allow_request() {
            return Err(PoolError::CircuitOpen);
        }

        if let Some(conn) = self.connection.read().await.as_ref() {
            return Ok(conn.clone());
        }

        let mut guard = self.connection.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                *guard = Some(conn.clone());
                tracing::info!("Redis command connection established");
                Ok(conn)
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                tracing::error!(error = %e, "Failed to connect to Redis");
                Err(PoolError::Redis(e))
            }
        }
    }

    /// Run one command with circuit breaker accounting.
    pub async fn execute<F, T, Fut>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.get_connection().await?;

        match f(conn).await {
            Ok(result) => {
                self.circuit_breaker.record_success();
                Ok(result)
            }
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    *self.connection.write().await = None;
                }
                self.circuit_breaker.record_failure();
                Err(PoolError::Redis(e))
            }
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    pub fn is_available(&self) -> bool {
        self.circuit_breaker.state() != CircuitState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_creation_is_lazy() {
        let pool = RedisPool::new(&RedisConfig::default()).unwrap();
        assert_eq!(pool.url(), "redis://localhost:6379");
        assert!(pool.is_available());
    }

    #[test]
    fn test_invalid_url_rejected() {
        let config = RedisConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(RedisPool::new(&config).is_err());
    }

    #[test]
    fn test_open_circuit_marks_unavailable() {
        let pool = RedisPool::new(&RedisConfig::default()).unwrap();
        for _ in 0..5 {
            pool.circuit_breaker().record_failure();
        }
        assert_eq!(pool.circuit_breaker().state(), CircuitState::Open);
        assert!(!pool.is_available());
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits() {
        let pool = RedisPool::new(&RedisConfig::default()).unwrap();
        for _ in 0..5 {
            pool.circuit_breaker().record_failure();
        }
        let result = pool.get_connection().await;
        assert!(matches!(result, Err(PoolError::CircuitOpen)));
    }
}
