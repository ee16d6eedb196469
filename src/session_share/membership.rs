//! Cluster-wide room membership, keyed by `{server_id}:{connection_id}`.
//!
//! Every member carries its own expiry, so members written by a process that
//! died stop counting once their TTL lapses, even while live processes keep
//! refreshing the same room.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use redis::AsyncCommands;

use crate::redis::RedisPool;

use super::SessionShareError;

#[async_trait]
pub trait MembershipStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn add(&self, room: &str, member: &str, ttl_seconds: u64) -> Result<(), SessionShareError>;

    async fn remove(&self, room: &str, member: &str) -> Result<(), SessionShareError>;

    /// Push the expiry of the given members `ttl_seconds` into the future
    async fn refresh(
        &self,
        room: &str,
        members: &[String],
        ttl_seconds: u64,
    ) -> Result<(), SessionShareError>;

    /// Members whose expiry has not passed
    async fn count(&self, room: &str) -> Result<usize, SessionShareError>;
}

/// Shared map standing in for the broker; clones see the same rooms.
#[derive(Clone, Default)]
pub struct MemoryMembershipStore {
    rooms: Arc<DashMap<String, HashMap<String, Instant>>>,
}

impl MemoryMembershipStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MembershipStore for MemoryMembershipStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn add(&self, room: &str, member: &str, ttl_seconds: u64) -> Result<(), SessionShareError> {
        self.refresh(room, &[member.to_string()], ttl_seconds).await
    }

    async fn remove(&self, room: &str, member: &str) -> Result<(), SessionShareError> {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(member);
        }
        self.rooms.remove_if(room, |_, members| members.is_empty());
        Ok(())
    }

    async fn refresh(
        &self,
        room: &str,
        members: &[String],
        ttl_seconds: u64,
    ) -> Result<(), SessionShareError> {
        if members.is_empty() {
            return Ok(());
        }

        let now = Instant::now();
        let expires_at = now + Duration::from_secs(ttl_seconds);
        let mut entry = self.rooms.entry(room.to_string()).or_default();
        entry.retain(|_, expiry| *expiry > now);
        for member in members {
            entry.insert(member.clone(), expires_at);
        }
        Ok(())
    }

    async fn count(&self, room: &str) -> Result<usize, SessionShareError> {
        let now = Instant::now();
        Ok(self
            .rooms
            .get(room)
            .map(|members| members.values().filter(|expiry| **expiry > now).count())
            .unwrap_or(0))
    }
}

/// Redis sorted sets scored by each member's expiry (unix seconds).
pub struct RedisMembershipStore {
    pool: Arc<RedisPool>,
    prefix: String,
}

impl RedisMembershipStore {
    pub fn new(pool: Arc<RedisPool>, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    fn room_key(&self, room: &str) -> String {
        format!("{}:{}", self.prefix, room)
    }
}

fn store_error(e: impl std::fmt::Display) -> SessionShareError {
    SessionShareError::Store(e.to_string())
}

/// `ZADD` every member at `now + ttl`, prune lapsed members and let the key
/// itself expire once no process refreshes the room.
fn refresh_pipeline(key: &str, members: &[String], ttl_seconds: u64, now: i64) -> redis::Pipeline {
    let expires_at = now + ttl_seconds as i64;
    let mut pipe = redis::pipe();
    pipe.cmd("ZADD").arg(key);
    for member in members {
        pipe.arg(expires_at).arg(member);
    }
    pipe.ignore()
        .cmd("ZREMRANGEBYSCORE")
        .arg(key)
        .arg("-inf")
        .arg(now)
        .ignore()
        .cmd("EXPIRE")
        .arg(key)
        .arg(ttl_seconds)
        .ignore();
    pipe
}

#[async_trait]
impl MembershipStore for RedisMembershipStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn add(&self, room: &str, member: &str, ttl_seconds: u64) -> Result<(), SessionShareError> {
        self.refresh(room, &[member.to_string()], ttl_seconds).await
    }

    async fn remove(&self, room: &str, member: &str) -> Result<(), SessionShareError> {
        let key = self.room_key(room);
        let member = member.to_string();
        self.pool
            .execute(move |mut conn| async move { conn.zrem::<_, _, i64>(key, member).await })
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn refresh(
        &self,
        room: &str,
        members: &[String],
        ttl_seconds: u64,
    ) -> Result<(), SessionShareError> {
        if members.is_empty() {
            return Ok(());
        }

        let pipe = refresh_pipeline(&self.room_key(room), members, ttl_seconds, Utc::now().timestamp());
        self.pool
            .execute(move |mut conn| async move {
                let result: redis::RedisResult<()> = pipe.query_async(&mut conn).await;
                result
            })
            .await
            .map_err(store_error)
    }

    async fn count(&self, room: &str) -> Result<usize, SessionShareError> {
        let key = self.room_key(room);
        let after = format!("({}", Utc::now().timestamp());
        self.pool
            .execute(move |mut conn| async move {
                conn.zcount::<_, _, _, usize>(key, after, "+inf").await
            })
            .await
            .map_err(store_error)
    }
}
