use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::config::DatabaseConfig;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig};

#[derive(Debug, Error)]
pub enum PostgresPoolError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Circuit breaker is open")]
    CircuitOpen,
}

/// PostgreSQL pool with circuit breaker integration.
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
    circuit_breaker: Arc<CircuitBreaker>,
    database_url: String,
}

impl PostgresPool {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, PostgresPoolError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await?;

        let pool = Self::from_pool(pool, &config.url);
        tracing::info!(
            pool_size = config.pool_size,
            url = %pool.database_url_masked(),
            "PostgreSQL connection pool created"
        );
        Ok(pool)
    }

    /// Wrap an existing pool (a producer's own, or a lazily connecting one).
    pub fn from_pool(pool: PgPool, database_url: &str) -> Self {
        Self {
            pool,
            circuit_breaker: Arc::new(CircuitBreaker::new(
                "postgres",
                CircuitBreakerConfig::default(),
            )),
            database_url: database_url.to_string(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    pub fn is_available(&self) -> bool {
        self.circuit_breaker.allow_request()
    }

    /// Run an operation against a clone of the pool with circuit breaker accounting.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, PostgresPoolError>
    where
        F: FnOnce(PgPool) -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        if !self.circuit_breaker.allow_request() {
            return Err(PostgresPoolError::CircuitOpen);
        }

        match operation(self.pool.clone()).await {
            Ok(result) => {
                self.circuit_breaker.record_success();
                Ok(result)
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                Err(PostgresPoolError::Sqlx(e))
            }
        }
    }

    pub fn database_url_masked(&self) -> String {
        mask_url(&self.database_url)
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("PostgreSQL connection pool closed");
    }
}

fn mask_url(url: &str) -> String {
    let userinfo_start = url.find("://").map_or(0, |i| i + 3);
    if let Some(at_pos) = url.rfind('@').filter(|&at| at > userinfo_start) {
        if let Some(colon_pos) = url[userinfo_start..at_pos].rfind(':') {
            let colon_pos = userinfo_start + colon_pos;
            return format!("{}***{}", &url[..colon_pos + 1], &url[at_pos..]);
        }
    }
    url.to_string()
}
