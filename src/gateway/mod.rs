//! WebSocket connection gateway.
//!
//! Owns the local room registry, authenticates handshakes and turns transport
//! events into frames for the members of the affected rooms.

mod connection;
mod error;
mod fanout;
mod registry;
mod room;

pub use connection::{ConnectionHandle, ConnectionState};
pub use error::GatewayError;
pub use registry::{RegistryStats, RoomRegistry};
pub use room::{rooms_for_envelope, RoomId, GLOBAL_ROOM};

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::JwtValidator;
use crate::channel::{CHANNELS, FORCED_LOGOUT_CHANNEL};
use crate::metrics::{GatewayMetrics, SessionShareMetrics};
use crate::router::NotificationRouter;
use crate::session_share::{RoomEmit, SessionShare};
use crate::tenant::{IdentityStore, TenantResolver};
use crate::transport::{InboundEvent, TransportError};
use crate::websocket::{JoinTarget, OutboundMessage, ServerMessage};

use fanout::{FanoutHandler, RoomEmitHandler};

/// Close code sent to connections of a logged-out user
pub const LOGGED_OUT_CLOSE_CODE: u16 = 4401;

/// Close code for connections dropped by the inactivity sweep
pub const IDLE_CLOSE_CODE: u16 = 1001;

/// What the handshake offers for authentication
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub token: Option<String>,
    pub origin: Option<String>,
    pub host: Option<String>,
}

/// Who an authenticated connection belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub tenant_id: Option<String>,
}

pub struct ConnectionGateway {
    jwt: Arc<JwtValidator>,
    resolver: TenantResolver,
    identity: Arc<dyn IdentityStore>,
    session_share: Arc<dyn SessionShare>,
    registry: RoomRegistry,
    outbound_buffer: usize,
}

impl ConnectionGateway {
    pub fn new(
        jwt: Arc<JwtValidator>,
        resolver: TenantResolver,
        identity: Arc<dyn IdentityStore>,
        session_share: Arc<dyn SessionShare>,
        outbound_buffer: usize,
    ) -> Self {
        Self {
            jwt,
            resolver,
            identity,
            session_share,
            registry: RoomRegistry::new(),
            outbound_buffer: outbound_buffer.max(1),
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn session_share(&self) -> &Arc<dyn SessionShare> {
        &self.session_share
    }

    pub fn is_multi_tenant(&self) -> bool {
        self.resolver.is_enabled()
    }

    /// Verify the bearer token and, in multi-tenant mode, bind the connection
    /// to the tenant resolved from the request origin.
    #[tracing::instrument(
        name = "gateway.authenticate",
        skip(self, handshake),
        fields(has_token = handshake.token.is_some())
    )]
    pub async fn authenticate(&self, handshake: &Handshake) -> Result<Identity, GatewayError> {
        let token = handshake
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::AuthRejected("missing token".into()))?;

        let claims = self
            .jwt
            .validate(token)
            .map_err(|e| GatewayError::AuthRejected(e.to_string()))?;

        if !self.resolver.is_enabled() {
            return Ok(Identity {
                user_id: claims.sub,
                tenant_id: None,
            });
        }

        let tenant = self
            .resolver
            .resolve(handshake.origin.as_deref(), handshake.host.as_deref())
            .ok_or_else(|| GatewayError::TenantMismatch("no tenant for request origin".into()))?;

        if !claims.allows_tenant(&tenant) {
            return Err(GatewayError::TenantMismatch(format!(
                "token was not issued for tenant {}",
                tenant
            )));
        }

        match self.identity.user_exists(&tenant, claims.user_id()).await {
            Ok(true) => Ok(Identity {
                user_id: claims.sub,
                tenant_id: Some(tenant),
            }),
            Ok(false) => Err(GatewayError::TenantMismatch(format!(
                "user is not a member of tenant {}",
                tenant
            ))),
            Err(e) => Err(GatewayError::AuthUnavailable(e.to_string())),
        }
    }

    /// Take a new socket through the handshake: `Connecting -> Authenticating`,
    /// then `Authenticated` with a registered connection, or `Disconnected`.
    pub async fn admit(
        &self,
        handshake: &Handshake,
        state: &mut ConnectionState,
    ) -> Result<(Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>), GatewayError> {
        step(state, ConnectionState::Authenticating);

        match self.authenticate(handshake).await {
            Ok(identity) => {
                step(state, ConnectionState::Authenticated);
                Ok(self.connect(identity))
            }
            Err(e) => {
                step(state, ConnectionState::Disconnected);
                tracing::debug!(state = state.as_str(), code = e.code(), "Handshake ended");
                Err(e)
            }
        }
    }

    /// Register an authenticated connection. The receiver feeds the socket.
    pub fn connect(&self, identity: Identity) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(self.outbound_buffer);
        let handle = Arc::new(ConnectionHandle::new(identity.user_id, identity.tenant_id, tx));
        self.registry.register(handle.clone());

        GatewayMetrics::record_opened();
        self.update_gauges();
        tracing::info!(
            connection_id = %handle.id,
            user_id = %handle.user_id,
            tenant_id = ?handle.tenant_id,
            "Connection registered"
        );

        (handle, rx)
    }

    /// Join the room composed from the connection's own tenant. Idempotent.
    pub async fn join(&self, handle: &ConnectionHandle, target: &JoinTarget) -> Result<RoomId, GatewayError> {
        let room = RoomId::for_target(handle.tenant(), target)?;

        if self.registry.join(handle.id, room.clone()) {
            handle.transition(ConnectionState::RoomJoined);
            self.update_gauges();
            if let Err(e) = self.session_share.track_join(&room, handle.id).await {
                tracing::warn!(room = %room, error = %e, "Failed to share room membership");
            }
            tracing::debug!(connection_id = %handle.id, room = %room, "Joined room");
        }

        Ok(room)
    }

    pub async fn leave(&self, handle: &ConnectionHandle, target: &JoinTarget) -> Result<RoomId, GatewayError> {
        let room = RoomId::for_target(handle.tenant(), target)?;

        if self.registry.leave(handle.id, &room) {
            if self.registry.rooms_of(handle.id).is_empty() {
                handle.transition(ConnectionState::Authenticated);
            }
            self.update_gauges();
            if let Err(e) = self.session_share.track_leave(&room, handle.id).await {
                tracing::warn!(room = %room, error = %e, "Failed to share room membership");
            }
            tracing::debug!(connection_id = %handle.id, room = %room, "Left room");
        }

        Ok(room)
    }

    /// Remove the connection from every room and drop its record.
    pub async fn disconnect(&self, connection_id: Uuid) {
        let Some((handle, rooms)) = self.registry.unregister(connection_id) else {
            return;
        };
        handle.transition(ConnectionState::Disconnected);

        if !rooms.is_empty() {
            if let Err(e) = self.session_share.track_disconnect(&rooms, connection_id).await {
                tracing::warn!(connection_id = %connection_id, error = %e, "Failed to clear shared memberships");
            }
        }

        let duration = Utc::now()
            .signed_duration_since(handle.connected_at)
            .num_milliseconds() as f64
            / 1000.0;
        GatewayMetrics::record_closed(duration);
        self.update_gauges();
        tracing::info!(
            connection_id = %connection_id,
            user_id = %handle.user_id,
            rooms = rooms.len(),
            duration_secs = duration,
            "Connection unregistered"
        );
    }

    /// Register one fanout handler per catalogue channel, plus the room emit
    /// handler when emits are shared. Call once, before `router.start()`.
    pub fn register_handlers(self: &Arc<Self>, router: &NotificationRouter) -> Result<(), TransportError> {
        for channel in CHANNELS {
            router.subscribe_all(channel, Arc::new(FanoutHandler::new(self)))?;
        }

        if self.session_share.is_shared() {
            router.subscribe_all(
                self.session_share.routing_channel(),
                Arc::new(RoomEmitHandler::new(self)),
            )?;
        }

        tracing::info!(
            channels = CHANNELS.len(),
            shared = self.session_share.is_shared(),
            "Gateway handlers registered"
        );
        Ok(())
    }

    /// Deliver a transport event to the members of its rooms. Returns the
    /// number of connections the frame was queued for.
    pub fn fanout(&self, event: &InboundEvent) -> usize {
        let rooms = rooms_for_envelope(&event.envelope);
        let members = self.registry.members_of(&rooms);
        if members.is_empty() {
            return 0;
        }

        let frame = match OutboundMessage::preserialize(&ServerMessage::event(
            event.channel.clone(),
            event.envelope.data.clone(),
        )) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(channel = %event.channel, error = %e, "Failed to serialize event");
                return 0;
            }
        };

        let tenant = event.envelope.tenant();
        let mut delivered = 0;
        let mut dropped = 0;
        for member in members {
            if member.tenant() != tenant {
                tracing::warn!(
                    connection_id = %member.id,
                    channel = %event.channel,
                    "Skipping member of another tenant"
                );
                continue;
            }
            if member.try_send(frame.clone()) {
                delivered += 1;
            } else {
                dropped += 1;
            }
        }

        GatewayMetrics::record_fanout(delivered, dropped);
        tracing::debug!(
            channel = %event.channel,
            tenant_id = ?tenant,
            delivered,
            dropped,
            "Fanout complete"
        );
        delivered as usize
    }

    /// Close every connection of the user named in a logout event.
    pub fn force_logout(&self, event: &InboundEvent) -> usize {
        let Some(user_id) = event.envelope.data.get("userId").and_then(|v| v.as_str()) else {
            tracing::warn!(channel = FORCED_LOGOUT_CHANNEL, "Logout event without userId");
            return 0;
        };

        let mut closed = 0;
        for conn in self.registry.user_connections(event.envelope.tenant(), user_id) {
            let close = OutboundMessage::Close {
                code: LOGGED_OUT_CLOSE_CODE,
                reason: "logged out".to_string(),
            };
            if conn.try_send(close) {
                closed += 1;
            }
        }

        GatewayMetrics::record_forced_logout(closed);
        tracing::info!(user_id = %user_id, tenant_id = ?event.envelope.tenant(), closed, "Forced logout");
        closed as usize
    }

    /// Emit to the local members of one room.
    pub fn emit_local(&self, room: &RoomId, event: &str, data: &Value) -> usize {
        let members = self.registry.members_of(std::slice::from_ref(room));
        if members.is_empty() {
            return 0;
        }

        let frame = match OutboundMessage::preserialize(&ServerMessage::event(event, data.clone())) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(room = %room, error = %e, "Failed to serialize room emit");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut dropped = 0;
        for member in members {
            if member.tenant() != room.tenant_id() {
                continue;
            }
            if member.try_send(frame.clone()) {
                delivered += 1;
            } else {
                dropped += 1;
            }
        }

        GatewayMetrics::record_fanout(delivered, dropped);
        delivered as usize
    }

    /// Emit to a room on every process sharing sessions with this one.
    /// Returns the local delivery count.
    pub async fn emit_to_room(&self, room: &RoomId, event: &str, data: Value) -> usize {
        let local = self.emit_local(room, event, &data);

        if self.session_share.is_shared() {
            if let Err(e) = self.session_share.broadcast(room, event, &data).await {
                tracing::warn!(room = %room, event = %event, error = %e, "Failed to share room emit");
            }
        }

        local
    }

    /// Deliver a room emit published by another process.
    pub fn receive_room_emit(&self, event: &InboundEvent) -> usize {
        let emit: RoomEmit = match serde_json::from_value(event.envelope.data.clone()) {
            Ok(emit) => emit,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed room emit");
                return 0;
            }
        };

        if emit.origin == self.session_share.server_id() {
            return 0;
        }

        let Some(room) = RoomId::parse(&emit.room) else {
            tracing::warn!(room = %emit.room, "Discarding room emit for invalid room");
            return 0;
        };

        if room.tenant_id() != event.envelope.tenant() {
            tracing::warn!(
                room = %room,
                envelope_tenant = ?event.envelope.tenant(),
                "Discarding room emit tagged for another tenant"
            );
            return 0;
        }

        SessionShareMetrics::record_received();
        self.emit_local(&room, &emit.event, &emit.data)
    }

    /// Send a heartbeat frame to every connection. Returns (sent, failed).
    pub fn heartbeat(&self) -> (usize, usize) {
        let mut sent = 0;
        let mut failed = 0;
        for conn in self.registry.all_connections() {
            if conn.try_send(ServerMessage::Heartbeat.into()) {
                sent += 1;
            } else {
                failed += 1;
            }
        }
        (sent, failed)
    }

    /// Close and unregister connections inactive for longer than the timeout.
    pub async fn cleanup_stale(&self, timeout_secs: u64) -> usize {
        let stale = self.registry.find_stale(timeout_secs);
        for connection_id in &stale {
            if let Some(conn) = self.registry.get(*connection_id) {
                conn.try_send(OutboundMessage::Close {
                    code: IDLE_CLOSE_CODE,
                    reason: "idle timeout".to_string(),
                });
            }
            tracing::info!(connection_id = %connection_id, "Removing stale connection due to timeout");
            self.disconnect(*connection_id).await;
        }
        stale.len()
    }

    /// Tell every client the server is going away.
    pub fn notify_shutdown(&self, reconnect_after: u64) -> usize {
        let mut notified = 0;
        for conn in self.registry.all_connections() {
            if conn.try_send(ServerMessage::Shutdown { reconnect_after }.into()) {
                notified += 1;
            }
        }
        notified
    }

    fn update_gauges(&self) {
        GatewayMetrics::set_active(self.registry.connection_count(), self.registry.room_count());
    }
}

fn step(state: &mut ConnectionState, next: ConnectionState) {
    match state.advance(next) {
        Some(advanced) => *state = advanced,
        None => tracing::warn!(from = state.as_str(), to = next.as_str(), "Illegal connection state change"),
    }
}
