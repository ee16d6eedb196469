//! Connection handle and its lifecycle state machine

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::websocket::{OutboundMessage, ServerMessage};

/// `Connecting -> Authenticating -> Authenticated -> RoomJoined* -> Disconnected`
///
/// A rejected handshake goes from `Authenticating` straight to `Disconnected`.
/// The pre-auth states live on the socket task (`ConnectionGateway::admit`);
/// a `ConnectionHandle` only exists from `Authenticated` on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Authenticating = 1,
    Authenticated = 2,
    RoomJoined = 3,
    Disconnected = 4,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Connecting, Disconnected)
                | (Authenticating, Authenticated)
                | (Authenticating, Disconnected)
                | (Authenticated, RoomJoined)
                | (Authenticated, Disconnected)
                | (RoomJoined, RoomJoined)
                | (RoomJoined, Authenticated)
                | (RoomJoined, Disconnected)
        )
    }

    /// The next state, or `None` for an illegal transition
    pub fn advance(self, next: ConnectionState) -> Option<ConnectionState> {
        self.can_transition_to(next).then_some(next)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::RoomJoined => "room_joined",
            ConnectionState::Disconnected => "disconnected",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Authenticating,
            2 => ConnectionState::Authenticated,
            3 => ConnectionState::RoomJoined,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// An authenticated WebSocket connection. The tenant is fixed for its lifetime.
pub struct ConnectionHandle {
    pub id: Uuid,
    pub user_id: String,
    pub tenant_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::Sender<OutboundMessage>,
    /// Unix seconds
    last_activity: AtomicI64,
    state: AtomicU8,
}

impl ConnectionHandle {
    pub fn new(
        user_id: String,
        tenant_id: Option<String>,
        sender: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            tenant_id,
            connected_at: now,
            sender,
            last_activity: AtomicI64::new(now.timestamp()),
            state: AtomicU8::new(ConnectionState::Authenticated as u8),
        }
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next` if the transition is legal.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !ConnectionState::from_u8(current).can_transition_to(next) {
                return false;
            }
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn update_activity(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.last_activity.load(Ordering::Relaxed), 0)
            .unwrap_or_else(Utc::now)
    }

    /// Queue without waiting. A full or closed buffer drops the message.
    pub fn try_send(&self, message: OutboundMessage) -> bool {
        self.sender.try_send(message).is_ok()
    }

    pub async fn send(&self, message: ServerMessage) -> bool {
        self.sender
            .send(OutboundMessage::Message(message))
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_path() {
        let state = ConnectionState::Connecting;
        let state = state.advance(ConnectionState::Authenticating).unwrap();
        let state = state.advance(ConnectionState::Authenticated).unwrap();
        let state = state.advance(ConnectionState::RoomJoined).unwrap();
        let state = state.advance(ConnectionState::RoomJoined).unwrap();
        assert_eq!(
            state.advance(ConnectionState::Disconnected),
            Some(ConnectionState::Disconnected)
        );
    }

    #[test]
    fn test_rejection_skips_to_disconnected() {
        assert!(ConnectionState::Authenticating.can_transition_to(ConnectionState::Disconnected));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!ConnectionState::Connecting.can_transition_to(ConnectionState::RoomJoined));
        assert!(!ConnectionState::Authenticating.can_transition_to(ConnectionState::RoomJoined));
        assert!(!ConnectionState::Disconnected.can_transition_to(ConnectionState::Authenticated));
        assert!(!ConnectionState::Disconnected.can_transition_to(ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn test_handle_transitions_and_buffer() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new("u1".into(), Some("t1".into()), tx);
        assert_eq!(handle.state(), ConnectionState::Authenticated);

        assert!(handle.transition(ConnectionState::RoomJoined));
        assert!(handle.transition(ConnectionState::Disconnected));
        assert!(!handle.transition(ConnectionState::RoomJoined));

        assert!(handle.try_send(ServerMessage::Pong.into()));
        assert!(!handle.try_send(ServerMessage::Pong.into()));
        assert!(matches!(
            rx.recv().await,
            Some(OutboundMessage::Message(ServerMessage::Pong))
        ));
    }
}
