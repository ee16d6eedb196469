use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::auth::JwtValidator;
use crate::config::{Settings, TransportBackend};
use crate::gateway::ConnectionGateway;
use crate::postgres::PostgresPool;
use crate::redis::RedisPool;
use crate::router::NotificationRouter;
use crate::session_share::{create_membership_store, create_session_share};
use crate::tenant::{create_identity_store, TenantResolver};
use crate::transport::{create_transport, MemoryBus};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub router: Arc<NotificationRouter>,
    pub gateway: Arc<ConnectionGateway>,
    pub redis_pool: Option<Arc<RedisPool>>,
    pub postgres_pool: Option<PostgresPool>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(settings: Settings, router: Arc<NotificationRouter>, gateway: Arc<ConnectionGateway>) -> Self {
        Self {
            settings: Arc::new(settings),
            router,
            gateway,
            redis_pool: None,
            postgres_pool: None,
            start_time: Instant::now(),
        }
    }

    pub fn with_pools(mut self, redis_pool: Option<Arc<RedisPool>>, postgres_pool: Option<PostgresPool>) -> Self {
        self.redis_pool = redis_pool;
        self.postgres_pool = postgres_pool;
        self
    }

    /// Wire every component from configuration. The router is returned
    /// unstarted with the gateway's handlers registered.
    pub async fn bootstrap(settings: Settings) -> anyhow::Result<Self> {
        let needs_redis =
            settings.transport.backend == TransportBackend::Redis || settings.cluster.enabled;
        let redis_pool = if needs_redis {
            let pool = RedisPool::new(&settings.redis).context("invalid redis configuration")?;
            tracing::info!(backend = settings.transport.backend.as_str(), "Redis pool created");
            Some(Arc::new(pool))
        } else {
            None
        };

        let postgres_pool = match settings.database {
            Some(ref database) => Some(
                PostgresPool::connect(database)
                    .await
                    .context("failed to connect to PostgreSQL")?,
            ),
            None => None,
        };

        let bus = (settings.transport.backend == TransportBackend::Memory)
            .then(|| MemoryBus::new(settings.transport.memory_capacity));
        let transport = create_transport(
            &settings.transport,
            redis_pool.clone(),
            postgres_pool.clone(),
            bus,
        )?;
        let router = Arc::new(NotificationRouter::new(transport));

        let identity = create_identity_store(&settings.tenant, postgres_pool.clone())?;
        let membership = create_membership_store(&settings.cluster, redis_pool.clone());
        let session_share = create_session_share(&settings.cluster, &router, membership);

        let gateway = Arc::new(ConnectionGateway::new(
            Arc::new(JwtValidator::new(&settings.jwt)),
            TenantResolver::new(&settings.tenant),
            identity,
            session_share,
            settings.websocket.outbound_buffer,
        ));
        gateway.register_handlers(&router)?;

        Ok(Self::new(settings, router, gateway).with_pools(redis_pool, postgres_pool))
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}
