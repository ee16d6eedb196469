use std::collections::HashMap;
use std::env;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::channel::{is_valid_channel_name, CHANNELS};
use crate::resilience::{BackoffConfig, CircuitBreakerConfig};
use crate::session_share::ClusterConfig;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub jwt: JwtConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    /// Required by the postgres transport and the postgres identity store
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub tenant: TenantConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JwtConfig {
    #[serde(default)]
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    /// Key expected in `X-API-Key` on the producer endpoints; open when unset
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Seconds between server heartbeat frames
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// Seconds of client silence before a connection is dropped
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
    /// Per-connection outbound frame buffer; events for a full buffer are dropped
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportBackend {
    /// Broker pub/sub
    Redis,
    /// Database LISTEN/NOTIFY
    Postgres,
    /// In-process bus, single node
    #[default]
    Memory,
}

impl TransportBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportBackend::Redis => "redis",
            TransportBackend::Postgres => "postgres",
            TransportBackend::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub backend: TransportBackend,
    /// Envelope cap for the redis and memory backends; postgres always caps at 8000 bytes
    #[serde(default)]
    pub max_envelope_bytes: Option<usize>,
    #[serde(default = "default_backoff_initial_delay")]
    pub backoff_initial_delay_ms: u64,
    #[serde(default = "default_backoff_max_delay")]
    pub backoff_max_delay_ms: u64,
    /// How long `stop()` waits for the listener task
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
    /// Capacity of the in-process bus
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
}

impl TransportConfig {
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: self.backoff_initial_delay_ms,
            max_delay_ms: self.backoff_max_delay_ms,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_cb_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_cb_success_threshold")]
    pub circuit_breaker_success_threshold: u32,
    #[serde(default = "default_cb_reset_timeout")]
    pub circuit_breaker_reset_timeout_seconds: u64,
}

impl RedisConfig {
    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            success_threshold: self.circuit_breaker_success_threshold,
            reset_timeout_ms: self.circuit_breaker_reset_timeout_seconds * 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityBackend {
    /// Static `members` map from configuration
    #[default]
    Memory,
    /// Per-tenant schema lookup in the database
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenantConfig {
    /// Multi-tenant mode: tenant from request origin, tenant-qualified channels and rooms
    #[serde(default)]
    pub enabled: bool,
    /// `acme.{base_domain}` resolves to tenant `acme`
    #[serde(default = "default_base_domain")]
    pub base_domain: String,
    #[serde(default)]
    pub identity_backend: IdentityBackend,
    #[serde(default = "default_schema_prefix")]
    pub schema_prefix: String,
    #[serde(default = "default_users_table")]
    pub users_table: String,
    /// tenant id -> user ids, for the memory identity backend
    #[serde(default)]
    pub members: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
    /// Emit log lines as JSON objects
    #[serde(default)]
    pub json_logs: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_connection_timeout() -> u64 {
    120
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_outbound_buffer() -> usize {
    64
}

fn default_backoff_initial_delay() -> u64 {
    100
}

fn default_backoff_max_delay() -> u64 {
    30_000
}

fn default_stop_timeout() -> u64 {
    5_000
}

fn default_memory_capacity() -> usize {
    1024
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_cb_failure_threshold() -> u32 {
    5
}

fn default_cb_success_threshold() -> u32 {
    2
}

fn default_cb_reset_timeout() -> u64 {
    30
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_base_domain() -> String {
    "localhost".to_string()
}

fn default_schema_prefix() -> String {
    "tenant_".to_string()
}

fn default_users_table() -> String {
    "users".to_string()
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "realtime-relay".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    /// Layered load: defaults, `config/default`, `config/{RUN_MODE}`, then
    /// `RELAY__SECTION__KEY` environment variables.
    pub fn new() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let settings: Settings = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(
                Environment::with_prefix("RELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins"),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt.secret.is_empty() {
            return Err(ConfigError::Message("jwt.secret must be set".into()));
        }

        let needs_database = self.transport.backend == TransportBackend::Postgres
            || (self.tenant.enabled && self.tenant.identity_backend == IdentityBackend::Postgres);
        if needs_database && self.database.is_none() {
            return Err(ConfigError::Message(
                "database.url is required by the postgres transport or identity backend".into(),
            ));
        }

        if self.cluster.enabled {
            validate_routing_channel(&self.cluster.routing_channel)?;
        }

        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// The routing channel shares the wire namespace with the catalogue, so
/// neither name may end with `-` followed by the other.
fn validate_routing_channel(routing: &str) -> Result<(), ConfigError> {
    if !is_valid_channel_name(routing) {
        return Err(ConfigError::Message(format!(
            "cluster.routing_channel {:?} is not a valid channel name",
            routing
        )));
    }

    let clash = CHANNELS.iter().find(|channel| {
        **channel == routing
            || channel.ends_with(&format!("-{}", routing))
            || routing.ends_with(&format!("-{}", channel))
    });
    if let Some(channel) = clash {
        return Err(ConfigError::Message(format!(
            "cluster.routing_channel {:?} is ambiguous with channel {:?}",
            routing, channel
        )));
    }

    Ok(())
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            connection_timeout: default_connection_timeout(),
            cleanup_interval: default_cleanup_interval(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: TransportBackend::default(),
            max_envelope_bytes: None,
            backoff_initial_delay_ms: default_backoff_initial_delay(),
            backoff_max_delay_ms: default_backoff_max_delay(),
            stop_timeout_ms: default_stop_timeout(),
            memory_capacity: default_memory_capacity(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            circuit_breaker_failure_threshold: default_cb_failure_threshold(),
            circuit_breaker_success_threshold: default_cb_success_threshold(),
            circuit_breaker_reset_timeout_seconds: default_cb_reset_timeout(),
        }
    }
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_domain: default_base_domain(),
            identity_backend: IdentityBackend::default(),
            schema_prefix: default_schema_prefix(),
            users_table: default_users_table(),
            members: HashMap::new(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 8081);
        assert_eq!(settings.transport.backend, TransportBackend::Memory);
        assert_eq!(settings.tenant.schema_prefix, "tenant_");
        assert!(settings.database.is_none());
    }

    #[test]
    fn test_validate_requires_secret() {
        let settings = Settings::default();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_postgres_requires_database() {
        let mut settings = Settings::default();
        settings.jwt.secret = "secret".into();
        settings.transport.backend = TransportBackend::Postgres;
        assert!(settings.validate().is_err());

        settings.database = Some(DatabaseConfig {
            url: "postgres://localhost/relay".into(),
            pool_size: 5,
            connect_timeout_seconds: 5,
            idle_timeout_seconds: 60,
        });
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_routing_channel_against_catalogue() {
        let mut settings = Settings::default();
        settings.jwt.secret = "secret".into();
        settings.cluster.enabled = true;
        assert!(settings.validate().is_ok());

        for routing in ["emit-task-updated", "task-updated", "Room_Emit", "tenant-emit"] {
            settings.cluster.routing_channel = routing.into();
            assert!(settings.validate().is_err(), "accepted {}", routing);
        }

        settings.cluster.routing_channel = "updated".into();
        assert!(settings.validate().is_err());

        settings.cluster.enabled = false;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_backend_deserializes_lowercase() {
        let backend: TransportBackend = serde_json::from_str("\"postgres\"").unwrap();
        assert_eq!(backend, TransportBackend::Postgres);
    }

    #[test]
    fn test_tenant_members_from_toml_shape() {
        let config = Config::builder()
            .set_override("tenant.enabled", true)
            .unwrap()
            .set_override("tenant.members.acme", vec!["u1", "u2"])
            .unwrap()
            .set_override("jwt.secret", "s")
            .unwrap()
            .build()
            .unwrap();
        let settings: Settings = config.try_deserialize().unwrap();
        assert!(settings.tenant.enabled);
        assert_eq!(settings.tenant.members["acme"], vec!["u1", "u2"]);
    }
}
