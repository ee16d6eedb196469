use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::channel::{decode_wire_channel, is_valid_tenant_id};

use super::{Envelope, EventHandler, InboundEvent, TransportError};

/// What happened to one received message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// No handler for the channel
    Unrouted,
    /// Payload is not a valid envelope
    Malformed,
    /// Tenant in the wire name and tenant in the envelope disagree
    TenantMismatch,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered => "delivered",
            DeliveryOutcome::Unrouted => "unrouted",
            DeliveryOutcome::Malformed => "malformed",
            DeliveryOutcome::TenantMismatch => "tenant_mismatch",
        }
    }
}

/// Handlers registered on one transport, keyed by logical channel.
#[derive(Clone, Default)]
pub struct SubscriptionSet {
    handlers: Arc<DashMap<String, Arc<dyn EventHandler>>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        channel: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), TransportError> {
        match self.handlers.entry(channel.to_string()) {
            Entry::Occupied(_) => Err(TransportError::DuplicateSubscription(channel.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(())
            }
        }
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.handlers.contains_key(channel)
    }

    pub fn channels(&self) -> Vec<String> {
        self.handlers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn handler(&self, channel: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(channel).map(|entry| entry.value().clone())
    }

    /// Deliver a message received on a wire channel that may embed a tenant.
    pub async fn deliver_qualified(&self, wire: &str, raw: &str) -> DeliveryOutcome {
        let Some((channel, wire_tenant)) = decode_wire_channel(wire, |c| self.contains(c)) else {
            tracing::debug!(wire_channel = %wire, "No handler for wire channel");
            return DeliveryOutcome::Unrouted;
        };

        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(wire_channel = %wire, error = %e, "Discarding malformed envelope");
                return DeliveryOutcome::Malformed;
            }
        };

        if envelope.tenant() != wire_tenant {
            tracing::warn!(
                wire_channel = %wire,
                envelope_tenant = ?envelope.tenant(),
                "Discarding envelope tagged for another tenant"
            );
            return DeliveryOutcome::TenantMismatch;
        }

        self.dispatch(channel, envelope).await
    }

    /// Deliver a message received on a bare logical channel; the tenant comes
    /// from the envelope alone.
    pub async fn deliver_bare(&self, channel: &str, raw: &str) -> DeliveryOutcome {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Discarding malformed envelope");
                return DeliveryOutcome::Malformed;
            }
        };

        if let Some(tenant) = envelope.tenant() {
            if !is_valid_tenant_id(tenant) {
                tracing::warn!(channel = %channel, tenant = %tenant, "Discarding envelope with invalid tenant id");
                return DeliveryOutcome::TenantMismatch;
            }
        }

        self.dispatch(channel, envelope).await
    }

    async fn dispatch(&self, channel: &str, envelope: Envelope) -> DeliveryOutcome {
        let Some(handler) = self.handler(channel) else {
            return DeliveryOutcome::Unrouted;
        };

        handler
            .handle(InboundEvent {
                channel: channel.to_string(),
                envelope,
            })
            .await;
        DeliveryOutcome::Delivered
    }
}
