//! Tenant resolution and identity checks for the WebSocket handshake.

mod identity;

pub use identity::{
    create_identity_store, IdentityError, IdentityStore, MemoryIdentityStore,
    PostgresIdentityStore,
};

use axum::http::Uri;

use crate::channel::is_valid_tenant_id;
use crate::config::TenantConfig;

/// Longest DNS label a hostname can carry
const MAX_HOST_LABEL_LEN: usize = 63;

/// Maps the request origin to a tenant id: `acme.example.com` -> `acme`
#[derive(Debug, Clone)]
pub struct TenantResolver {
    enabled: bool,
    base_domain: String,
}

impl TenantResolver {
    pub fn new(config: &TenantConfig) -> Self {
        Self {
            enabled: config.enabled,
            base_domain: config.base_domain.trim_matches('.').to_ascii_lowercase(),
        }
    }

    /// Single-tenant resolver; every request resolves to no tenant.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            base_domain: String::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Resolve from the `Origin` header, falling back to `Host`.
    pub fn resolve(&self, origin: Option<&str>, host: Option<&str>) -> Option<String> {
        if !self.enabled {
            return None;
        }

        let hostname = origin
            .and_then(origin_host)
            .or_else(|| host.map(strip_port))?;
        self.tenant_from_host(&hostname)
    }

    pub fn tenant_from_host(&self, hostname: &str) -> Option<String> {
        let hostname = hostname.to_ascii_lowercase();
        let suffix = format!(".{}", self.base_domain);
        let label = hostname.strip_suffix(&suffix)?;

        let valid = !label.contains('.')
            && label.len() <= MAX_HOST_LABEL_LEN
            && is_valid_tenant_id(label);
        valid.then(|| label.to_string())
    }
}

fn origin_host(origin: &str) -> Option<String> {
    let uri: Uri = origin.parse().ok()?;
    uri.host().map(str::to_string)
}

fn strip_port(host: &str) -> String {
    host.split(':').next().unwrap_or(host).to_string()
}
