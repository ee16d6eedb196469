mod handler;
mod message;

pub use handler::ws_handler;
pub use message::{ClientMessage, JoinTarget, OutboundMessage, ServerMessage};
