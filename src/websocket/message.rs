use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    Join(JoinTarget),
    Leave(JoinTarget),
    Ping,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join(_) => "join",
            ClientMessage::Leave(_) => "leave",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Room a client asks for. The tenant always comes from the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum JoinTarget {
    Tenant,
    Board {
        #[serde(rename = "boardId")]
        board_id: String,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A transport event; `event` is the logical channel name
    Event { event: String, data: Value },
    /// Echoes the requested target; room ids stay server-side
    Joined { payload: JoinTarget },
    Left { payload: JoinTarget },
    Pong,
    Heartbeat,
    Shutdown {
        #[serde(rename = "reconnectAfter")]
        reconnect_after: u64,
    },
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn event(event: impl Into<String>, data: Value) -> Self {
        Self::Event {
            event: event.into(),
            data,
        }
    }
}

/// What the send task writes to the socket
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Message(ServerMessage),
    /// Serialized once, shared by every recipient of a fanout
    Preserialized(Arc<str>),
    Close { code: u16, reason: String },
}

impl OutboundMessage {
    /// Serialize a message once for sending to many connections
    pub fn preserialize(message: &ServerMessage) -> Result<Self, serde_json::Error> {
        Ok(Self::Preserialized(serde_json::to_string(message)?.into()))
    }
}

impl From<ServerMessage> for OutboundMessage {
    fn from(message: ServerMessage) -> Self {
        Self::Message(message)
    }
}
