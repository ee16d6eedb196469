use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use super::{ConnectionHandle, RoomId};

type UserKey = (Option<String>, String);

/// Local connections and their room memberships
pub struct RoomRegistry {
    /// connection_id -> ConnectionHandle
    connections: DashMap<Uuid, Arc<ConnectionHandle>>,
    /// room -> Set<connection_id>
    rooms: DashMap<RoomId, HashSet<Uuid>>,
    /// connection_id -> Set<room>
    memberships: DashMap<Uuid, HashSet<RoomId>>,
    /// (tenant, user) -> Set<connection_id> (supports multiple devices)
    user_index: DashMap<UserKey, HashSet<Uuid>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            user_index: DashMap::new(),
        }
    }

    pub fn register(&self, handle: Arc<ConnectionHandle>) {
        let conn_id = handle.id;
        self.user_index
            .entry((handle.tenant_id.clone(), handle.user_id.clone()))
            .or_default()
            .insert(conn_id);
        self.connections.insert(conn_id, handle);
    }

    /// Drop a connection and every membership it held. Returns the rooms it left.
    pub fn unregister(&self, connection_id: Uuid) -> Option<(Arc<ConnectionHandle>, Vec<RoomId>)> {
        let (_, handle) = self.connections.remove(&connection_id)?;

        let key = (handle.tenant_id.clone(), handle.user_id.clone());
        if let Some(mut conns) = self.user_index.get_mut(&key) {
            conns.remove(&connection_id);
        }
        self.user_index.remove_if(&key, |_, conns| conns.is_empty());

        let rooms: Vec<RoomId> = self
            .memberships
            .remove(&connection_id)
            .map(|(_, rooms)| rooms.into_iter().collect())
            .unwrap_or_default();

        for room in &rooms {
            self.remove_member(room, connection_id);
        }

        Some((handle, rooms))
    }

    /// Add a connection to a room. Returns false when it was already a member
    /// or is not registered.
    pub fn join(&self, connection_id: Uuid, room: RoomId) -> bool {
        // Holding the entry keeps a concurrent unregister from removing the
        // connection until both indexes are written.
        let Some(_registered) = self.connections.get(&connection_id) else {
            return false;
        };

        let inserted = self
            .memberships
            .entry(connection_id)
            .or_default()
            .insert(room.clone());

        if inserted {
            self.rooms.entry(room).or_default().insert(connection_id);
        }
        inserted
    }

    pub fn leave(&self, connection_id: Uuid, room: &RoomId) -> bool {
        let removed = self
            .memberships
            .get_mut(&connection_id)
            .map(|mut rooms| rooms.remove(room))
            .unwrap_or(false);

        if removed {
            self.remove_member(room, connection_id);
        }
        removed
    }

    fn remove_member(&self, room: &RoomId, connection_id: Uuid) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(&connection_id);
        }
        self.rooms.remove_if(room, |_, members| members.is_empty());
    }

    /// Members of any of the rooms, each connection once
    pub fn members_of(&self, rooms: &[RoomId]) -> Vec<Arc<ConnectionHandle>> {
        let mut seen = HashSet::new();
        let mut members = Vec::new();

        for room in rooms {
            let ids: Vec<Uuid> = match self.rooms.get(room) {
                Some(ids) => ids.iter().copied().collect(),
                None => continue,
            };
            for id in ids {
                if seen.insert(id) {
                    if let Some(handle) = self.get(id) {
                        members.push(handle);
                    }
                }
            }
        }

        members
    }

    pub fn user_connections(&self, tenant_id: Option<&str>, user_id: &str) -> Vec<Arc<ConnectionHandle>> {
        let key = (tenant_id.map(str::to_string), user_id.to_string());
        let ids: Vec<Uuid> = self
            .user_index
            .get(&key)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();

        ids.into_iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn get(&self, connection_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&connection_id).map(|h| h.clone())
    }

    pub fn all_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.iter().map(|r| r.value().clone()).collect()
    }

    pub fn rooms_of(&self, connection_id: Uuid) -> Vec<RoomId> {
        self.memberships
            .get(&connection_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn room_size(&self, room: &RoomId) -> usize {
        self.rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }

    /// Every non-empty room with its local member count
    pub fn room_counts(&self) -> Vec<(RoomId, usize)> {
        self.rooms
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect()
    }

    /// Every non-empty room with its local member ids
    pub fn room_members(&self) -> Vec<(RoomId, Vec<Uuid>)> {
        self.rooms
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().iter().copied().collect()))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            connections: self.connections.len(),
            users: self.user_index.len(),
            rooms: self.rooms.len(),
        }
    }

    /// Connections inactive for longer than the timeout
    pub fn find_stale(&self, timeout_secs: u64) -> Vec<Uuid> {
        let now = Utc::now();
        let timeout = chrono::Duration::seconds(timeout_secs as i64);

        self.connections
            .iter()
            .filter(|entry| now.signed_duration_since(entry.value().last_activity()) > timeout)
            .map(|entry| *entry.key())
            .collect()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub connections: usize,
    pub users: usize,
    pub rooms: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn connection(registry: &RoomRegistry, user: &str, tenant: Option<&str>) -> Arc<ConnectionHandle> {
        let (tx, _rx) = mpsc::channel(4);
        let handle = Arc::new(ConnectionHandle::new(
            user.to_string(),
            tenant.map(str::to_string),
            tx,
        ));
        registry.register(handle.clone());
        handle
    }

    #[test]
    fn test_join_is_idempotent() {
        let registry = RoomRegistry::new();
        let conn = connection(&registry, "u1", Some("t1"));
        let room = RoomId::board(Some("t1"), "b1");

        assert!(registry.join(conn.id, room.clone()));
        assert!(!registry.join(conn.id, room.clone()));
        assert_eq!(registry.room_size(&room), 1);
        assert_eq!(registry.rooms_of(conn.id), vec![room]);
    }

    #[test]
    fn test_join_unknown_connection() {
        let registry = RoomRegistry::new();
        assert!(!registry.join(Uuid::new_v4(), RoomId::tenant(None)));
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_members_of_union_is_deduplicated() {
        let registry = RoomRegistry::new();
        let both = connection(&registry, "u1", Some("t1"));
        let board_only = connection(&registry, "u2", Some("t1"));
        let tenant_room = RoomId::tenant(Some("t1"));
        let board_room = RoomId::board(Some("t1"), "b1");

        registry.join(both.id, tenant_room.clone());
        registry.join(both.id, board_room.clone());
        registry.join(board_only.id, board_room.clone());

        let members = registry.members_of(&[tenant_room, board_room]);
        assert_eq!(members.len(), 2);
    }

    #[test]
    fn test_unregister_clears_memberships() {
        let registry = RoomRegistry::new();
        let conn = connection(&registry, "u1", Some("t1"));
        let room = RoomId::tenant(Some("t1"));
        registry.join(conn.id, room.clone());

        let (_, rooms) = registry.unregister(conn.id).unwrap();
        assert_eq!(rooms, vec![room.clone()]);
        assert_eq!(registry.room_size(&room), 0);
        assert_eq!(registry.room_count(), 0);
        assert!(registry.user_connections(Some("t1"), "u1").is_empty());
        assert!(registry.unregister(conn.id).is_none());
    }

    #[test]
    fn test_join_racing_unregister_leaves_no_orphans() {
        let registry = RoomRegistry::new();
        let room = RoomId::board(Some("t1"), "b1");

        for _ in 0..200 {
            let conn = connection(&registry, "u1", Some("t1"));
            std::thread::scope(|scope| {
                scope.spawn(|| registry.join(conn.id, room.clone()));
                scope.spawn(|| registry.unregister(conn.id));
            });

            assert!(registry.get(conn.id).is_none());
            assert!(registry.rooms_of(conn.id).is_empty());
            assert_eq!(registry.room_size(&room), 0);
        }
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_user_index_is_per_tenant() {
        let registry = RoomRegistry::new();
        connection(&registry, "u1", Some("t1"));
        connection(&registry, "u1", Some("t1"));
        connection(&registry, "u1", Some("t2"));

        assert_eq!(registry.user_connections(Some("t1"), "u1").len(), 2);
        assert_eq!(registry.user_connections(Some("t2"), "u1").len(), 1);
        assert_eq!(registry.stats().users, 2);
    }

    #[test]
    fn test_leave() {
        let registry = RoomRegistry::new();
        let conn = connection(&registry, "u1", None);
        let room = RoomId::tenant(None);
        registry.join(conn.id, room.clone());

        assert!(registry.leave(conn.id, &room));
        assert!(!registry.leave(conn.id, &room));
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_fresh_connections_are_not_stale() {
        let registry = RoomRegistry::new();
        connection(&registry, "u1", None);
        assert!(registry.find_stale(60).is_empty());
    }
}
