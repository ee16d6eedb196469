//! Room emits across processes.
//!
//! - `LocalSessionShare`: emits stay on this process; clients must be pinned
//!   to one process by the load balancer
//! - `TransportSessionShare`: emits are published on the routing channel and
//!   every other process delivers them to its own room members

mod membership;
mod types;

pub use membership::{MembershipStore, MemoryMembershipStore, RedisMembershipStore};
pub use types::{ClusterConfig, RoomEmit, SessionShareError};

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::gateway::RoomId;
use crate::metrics::SessionShareMetrics;
use crate::redis::RedisPool;
use crate::router::NotificationRouter;

#[async_trait]
pub trait SessionShare: Send + Sync {
    fn server_id(&self) -> &str;

    /// Whether emits reach other processes
    fn is_shared(&self) -> bool;

    fn routing_channel(&self) -> &str;

    /// Hand a room emit to the other processes without waiting for the
    /// transport. Local members are served by the caller.
    async fn broadcast(&self, room: &RoomId, event: &str, data: &Value) -> Result<(), SessionShareError>;

    async fn track_join(&self, room: &RoomId, connection_id: Uuid) -> Result<(), SessionShareError>;

    async fn track_leave(&self, room: &RoomId, connection_id: Uuid) -> Result<(), SessionShareError>;

    async fn track_disconnect(&self, rooms: &[RoomId], connection_id: Uuid) -> Result<(), SessionShareError>;

    /// Extend the TTL of this process's memberships. Returns the rooms refreshed.
    async fn refresh(&self, rooms: &[(RoomId, Vec<Uuid>)]) -> Result<usize, SessionShareError>;

    /// Members of a room across every process
    async fn room_size(&self, room: &RoomId) -> Result<usize, SessionShareError>;
}

pub struct LocalSessionShare {
    server_id: String,
    routing_channel: String,
}

impl LocalSessionShare {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            server_id: config.server_id.clone(),
            routing_channel: config.routing_channel.clone(),
        }
    }
}

#[async_trait]
impl SessionShare for LocalSessionShare {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn is_shared(&self) -> bool {
        false
    }

    fn routing_channel(&self) -> &str {
        &self.routing_channel
    }

    async fn broadcast(&self, _room: &RoomId, _event: &str, _data: &Value) -> Result<(), SessionShareError> {
        Ok(())
    }

    async fn track_join(&self, _room: &RoomId, _connection_id: Uuid) -> Result<(), SessionShareError> {
        Ok(())
    }

    async fn track_leave(&self, _room: &RoomId, _connection_id: Uuid) -> Result<(), SessionShareError> {
        Ok(())
    }

    async fn track_disconnect(&self, _rooms: &[RoomId], _connection_id: Uuid) -> Result<(), SessionShareError> {
        Ok(())
    }

    async fn refresh(&self, _rooms: &[(RoomId, Vec<Uuid>)]) -> Result<usize, SessionShareError> {
        Ok(0)
    }

    async fn room_size(&self, _room: &RoomId) -> Result<usize, SessionShareError> {
        Err(SessionShareError::Disabled)
    }
}

pub struct TransportSessionShare {
    config: ClusterConfig,
    router: Arc<NotificationRouter>,
    membership: Arc<dyn MembershipStore>,
}

impl TransportSessionShare {
    pub fn new(
        config: ClusterConfig,
        router: Arc<NotificationRouter>,
        membership: Arc<dyn MembershipStore>,
    ) -> Self {
        Self {
            config,
            router,
            membership,
        }
    }

    fn member_key(&self, connection_id: Uuid) -> String {
        format!("{}:{}", self.config.server_id, connection_id)
    }
}

#[async_trait]
impl SessionShare for TransportSessionShare {
    fn server_id(&self) -> &str {
        &self.config.server_id
    }

    fn is_shared(&self) -> bool {
        true
    }

    fn routing_channel(&self) -> &str {
        &self.config.routing_channel
    }

    async fn broadcast(&self, room: &RoomId, event: &str, data: &Value) -> Result<(), SessionShareError> {
        let emit = RoomEmit {
            origin: self.config.server_id.clone(),
            room: room.to_string(),
            event: event.to_string(),
            data: data.clone(),
        };
        let payload = serde_json::to_value(&emit)
            .map_err(|e| SessionShareError::Serialization(e.to_string()))?;

        let publish = self
            .router
            .publish(&self.config.routing_channel, payload, room.tenant_id());
        let room = room.to_string();
        tokio::spawn(async move {
            match publish.outcome().await {
                Ok(()) => SessionShareMetrics::record_routed(),
                Err(e) => {
                    SessionShareMetrics::record_failed();
                    tracing::warn!(room = %room, error = %e, "Room emit not routed");
                }
            }
        });
        Ok(())
    }

    async fn track_join(&self, room: &RoomId, connection_id: Uuid) -> Result<(), SessionShareError> {
        self.membership
            .add(
                room.as_str(),
                &self.member_key(connection_id),
                self.config.membership_ttl_seconds,
            )
            .await
    }

    async fn track_leave(&self, room: &RoomId, connection_id: Uuid) -> Result<(), SessionShareError> {
        self.membership
            .remove(room.as_str(), &self.member_key(connection_id))
            .await
    }

    async fn track_disconnect(&self, rooms: &[RoomId], connection_id: Uuid) -> Result<(), SessionShareError> {
        let member = self.member_key(connection_id);
        for room in rooms {
            self.membership.remove(room.as_str(), &member).await?;
        }
        Ok(())
    }

    async fn refresh(&self, rooms: &[(RoomId, Vec<Uuid>)]) -> Result<usize, SessionShareError> {
        let mut refreshed = 0;
        for (room, connection_ids) in rooms {
            let members: Vec<String> = connection_ids
                .iter()
                .map(|id| self.member_key(*id))
                .collect();
            self.membership
                .refresh(room.as_str(), &members, self.config.membership_ttl_seconds)
                .await?;
            refreshed += 1;
        }

        SessionShareMetrics::record_refreshed(refreshed as u64);
        Ok(refreshed)
    }

    async fn room_size(&self, room: &RoomId) -> Result<usize, SessionShareError> {
        self.membership.count(room.as_str()).await
    }
}

/// Redis sorted sets when a pool is available, otherwise a process-local map.
pub fn create_membership_store(
    config: &ClusterConfig,
    redis_pool: Option<Arc<RedisPool>>,
) -> Arc<dyn MembershipStore> {
    match redis_pool {
        Some(pool) if config.enabled => {
            tracing::info!(prefix = %config.membership_prefix, "Using Redis room membership store");
            Arc::new(RedisMembershipStore::new(pool, config.membership_prefix.clone()))
        }
        _ => Arc::new(MemoryMembershipStore::new()),
    }
}

pub fn create_session_share(
    config: &ClusterConfig,
    router: &Arc<NotificationRouter>,
    membership: Arc<dyn MembershipStore>,
) -> Arc<dyn SessionShare> {
    if !config.enabled {
        tracing::info!("Cluster mode disabled, room emits stay local");
        return Arc::new(LocalSessionShare::new(config));
    }

    if !router.supports_session_share() {
        tracing::warn!(
            backend = router.backend().as_str(),
            "Transport cannot route room emits, falling back to local session share"
        );
        return Arc::new(LocalSessionShare::new(config));
    }

    tracing::info!(
        server_id = %config.server_id,
        routing_channel = %config.routing_channel,
        membership = membership.backend_name(),
        "Sharing room emits through the transport"
    );
    Arc::new(TransportSessionShare::new(
        config.clone(),
        router.clone(),
        membership,
    ))
}
