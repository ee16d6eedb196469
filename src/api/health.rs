//! Health check and statistics endpoints.

use std::collections::BTreeMap;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::gateway::RegistryStats;
use crate::resilience::{CircuitBreakerStats, ListenerHealthStats};
use crate::router::RouterStats;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub transport: TransportHealthResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisHealthResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresHealthResponse>,
    pub connections: RegistryStats,
    pub session_share: SessionShareHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct TransportHealthResponse {
    pub backend: &'static str,
    pub listener: ListenerHealthStats,
}

#[derive(Debug, Serialize)]
pub struct RedisHealthResponse {
    pub available: bool,
    pub circuit_breaker: CircuitBreakerStats,
}

#[derive(Debug, Serialize)]
pub struct PostgresHealthResponse {
    pub available: bool,
    pub pool_size: u32,
    pub idle_connections: u32,
    pub circuit_breaker: CircuitBreakerStats,
}

#[derive(Debug, Serialize)]
pub struct SessionShareHealthResponse {
    pub shared: bool,
    pub server_id: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub multi_tenant: bool,
    pub connections: RegistryStats,
    pub rooms: BTreeMap<String, usize>,
    /// Member counts across every process, when room emits are shared
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_rooms: Option<BTreeMap<String, usize>>,
    pub router: RouterStats,
    pub listener: ListenerHealthStats,
}

/// 200 while the subscriber connection is up, 503 otherwise.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let listener = state.router.health().stats();
    let healthy = state.router.health().is_healthy();

    let redis = state.redis_pool.as_ref().map(|pool| RedisHealthResponse {
        available: pool.is_available(),
        circuit_breaker: pool.circuit_breaker().stats(),
    });

    let postgres = state.postgres_pool.as_ref().map(|pool| PostgresHealthResponse {
        available: pool.is_available(),
        pool_size: pool.pool().size(),
        idle_connections: pool.pool().num_idle() as u32,
        circuit_breaker: pool.circuit_breaker().stats(),
    });

    let session_share = state.gateway.session_share();
    let response = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.uptime().as_secs(),
        transport: TransportHealthResponse {
            backend: state.router.backend().as_str(),
            listener,
        },
        redis,
        postgres,
        connections: state.gateway.registry().stats(),
        session_share: SessionShareHealthResponse {
            shared: session_share.is_shared(),
            server_id: session_share.server_id().to_string(),
        },
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

/// Operator view of the local registry. Lists room names, so it sits behind
/// the API key.
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let registry = state.gateway.registry();
    let room_counts = registry.room_counts();

    let session_share = state.gateway.session_share();
    let cluster_rooms = if session_share.is_shared() {
        let mut sizes = BTreeMap::new();
        for (room, _) in &room_counts {
            match session_share.room_size(room).await {
                Ok(size) => {
                    sizes.insert(room.to_string(), size);
                }
                Err(e) => tracing::warn!(room = %room, error = %e, "Failed to read cluster room size"),
            }
        }
        Some(sizes)
    } else {
        None
    };

    let rooms = room_counts
        .into_iter()
        .map(|(room, count)| (room.to_string(), count))
        .collect();

    Json(StatsResponse {
        multi_tenant: state.gateway.is_multi_tenant(),
        connections: registry.stats(),
        rooms,
        cluster_rooms,
        router: state.router.stats(),
        listener: state.router.health().stats(),
    })
}
