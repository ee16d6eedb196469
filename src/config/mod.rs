mod settings;

pub use settings::{
    ApiConfig, DatabaseConfig, IdentityBackend, JwtConfig, OtelConfig, RedisConfig,
    ServerConfig, Settings, TenantConfig, TransportBackend, TransportConfig, WebSocketConfig,
};
