//! Room naming.
//!
//! | Room | Multi-tenant | Single-tenant |
//! |------|--------------|---------------|
//! | tenant-wide | `tenant-acme` | `global` |
//! | board | `tenant-acme:board:b1` | `global:board:b1` |

use std::fmt;

use serde::Serialize;

use crate::channel::{is_valid_tenant_id, TENANT_PREFIX};
use crate::transport::Envelope;
use crate::websocket::JoinTarget;

use super::GatewayError;

pub const GLOBAL_ROOM: &str = "global";

const MAX_RESOURCE_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// The tenant-wide room
    pub fn tenant(tenant_id: Option<&str>) -> Self {
        match tenant_id {
            Some(tenant) => Self(format!("{}{}", TENANT_PREFIX, tenant)),
            None => Self(GLOBAL_ROOM.to_string()),
        }
    }

    pub fn resource(tenant_id: Option<&str>, kind: &str, id: &str) -> Self {
        let base = Self::tenant(tenant_id);
        Self(format!("{}:{}:{}", base.0, kind, id))
    }

    pub fn board(tenant_id: Option<&str>, board_id: &str) -> Self {
        Self::resource(tenant_id, "board", board_id)
    }

    /// Compose the room for a join request from the connection's own tenant.
    pub fn for_target(tenant_id: Option<&str>, target: &JoinTarget) -> Result<Self, GatewayError> {
        match target {
            JoinTarget::Tenant => Ok(Self::tenant(tenant_id)),
            JoinTarget::Board { board_id } => {
                if !is_valid_resource_id(board_id) {
                    return Err(GatewayError::InvalidJoin(format!(
                        "invalid board id: {:?}",
                        board_id
                    )));
                }
                Ok(Self::board(tenant_id, board_id))
            }
        }
    }

    /// Parse a room name received from another process.
    pub fn parse(name: &str) -> Option<Self> {
        let mut parts = name.splitn(3, ':');
        let base = parts.next()?;

        if base != GLOBAL_ROOM {
            let tenant = base.strip_prefix(TENANT_PREFIX)?;
            if !is_valid_tenant_id(tenant) {
                return None;
            }
        }

        match (parts.next(), parts.next()) {
            (None, _) => Some(Self(name.to_string())),
            (Some(kind), Some(id))
                if !kind.is_empty() && !kind.contains(':') && is_valid_resource_id(id) =>
            {
                Some(Self(name.to_string()))
            }
            _ => None,
        }
    }

    /// Tenant the room belongs to; `None` for single-tenant rooms
    pub fn tenant_id(&self) -> Option<&str> {
        let base = self.0.split(':').next().unwrap_or_default();
        base.strip_prefix(TENANT_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_valid_resource_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_RESOURCE_ID_LEN
        && !id.contains(':')
        && !id.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Rooms an event is delivered to: the tenant-wide room, plus the board room
/// when the payload carries a `boardId`.
pub fn rooms_for_envelope(envelope: &Envelope) -> Vec<RoomId> {
    let tenant = envelope.tenant();
    let mut rooms = vec![RoomId::tenant(tenant)];

    if let Some(board_id) = envelope.data.get("boardId").and_then(|v| v.as_str()) {
        if is_valid_resource_id(board_id) {
            rooms.push(RoomId::board(tenant, board_id));
        }
    }

    rooms
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_room_names() {
        assert_eq!(RoomId::tenant(Some("t1")).as_str(), "tenant-t1");
        assert_eq!(RoomId::tenant(None).as_str(), "global");
        assert_eq!(RoomId::board(Some("t1"), "b1").as_str(), "tenant-t1:board:b1");
        assert_eq!(RoomId::board(None, "b1").as_str(), "global:board:b1");
    }

    #[test]
    fn test_room_tenant() {
        assert_eq!(RoomId::board(Some("acme"), "b1").tenant_id(), Some("acme"));
        assert_eq!(RoomId::tenant(None).tenant_id(), None);
    }

    #[test]
    fn test_join_target_uses_connection_tenant() {
        let room = RoomId::for_target(
            Some("t1"),
            &JoinTarget::Board {
                board_id: "b1".into(),
            },
        )
        .unwrap();
        assert_eq!(room.tenant_id(), Some("t1"));

        let bad = RoomId::for_target(
            Some("t1"),
            &JoinTarget::Board {
                board_id: "x:board:y".into(),
            },
        );
        assert!(matches!(bad, Err(GatewayError::InvalidJoin(_))));
    }

    #[test]
    fn test_parse() {
        assert_eq!(RoomId::parse("tenant-t1:board:b1"), Some(RoomId::board(Some("t1"), "b1")));
        assert_eq!(RoomId::parse("global"), Some(RoomId::tenant(None)));
        assert!(RoomId::parse("tenant-T1").is_none());
        assert!(RoomId::parse("lobby").is_none());
        assert!(RoomId::parse("tenant-t1:board").is_none());
    }

    #[test]
    fn test_rooms_for_envelope() {
        let with_board = Envelope::new(json!({"boardId": "b1"}), Some("t1"));
        assert_eq!(
            rooms_for_envelope(&with_board),
            vec![RoomId::tenant(Some("t1")), RoomId::board(Some("t1"), "b1")]
        );

        let tenant_only = Envelope::new(json!({"memberId": "m1"}), Some("t1"));
        assert_eq!(rooms_for_envelope(&tenant_only), vec![RoomId::tenant(Some("t1"))]);
    }
}
