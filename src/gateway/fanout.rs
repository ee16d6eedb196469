use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::channel::FORCED_LOGOUT_CHANNEL;
use crate::transport::{EventHandler, InboundEvent};

use super::ConnectionGateway;

/// Fans one catalogue channel out to room members.
pub(super) struct FanoutHandler {
    gateway: Weak<ConnectionGateway>,
}

impl FanoutHandler {
    pub fn new(gateway: &Arc<ConnectionGateway>) -> Self {
        Self {
            gateway: Arc::downgrade(gateway),
        }
    }
}

#[async_trait]
impl EventHandler for FanoutHandler {
    async fn handle(&self, event: InboundEvent) {
        let Some(gateway) = self.gateway.upgrade() else {
            return;
        };

        gateway.fanout(&event);
        if event.channel == FORCED_LOGOUT_CHANNEL {
            gateway.force_logout(&event);
        }
    }
}

/// Receives room emits from other processes on the routing channel.
pub(super) struct RoomEmitHandler {
    gateway: Weak<ConnectionGateway>,
}

impl RoomEmitHandler {
    pub fn new(gateway: &Arc<ConnectionGateway>) -> Self {
        Self {
            gateway: Arc::downgrade(gateway),
        }
    }
}

#[async_trait]
impl EventHandler for RoomEmitHandler {
    async fn handle(&self, event: InboundEvent) {
        if let Some(gateway) = self.gateway.upgrade() {
            gateway.receive_room_emit(&event);
        }
    }
}
