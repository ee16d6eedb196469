use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Authentication failed: {0}")]
    AuthRejected(String),

    #[error("Tenant mismatch: {0}")]
    TenantMismatch(String),

    #[error("Identity store unavailable: {0}")]
    AuthUnavailable(String),

    #[error("Invalid join: {0}")]
    InvalidJoin(String),
}

impl GatewayError {
    /// Code sent to the client in the `error` frame
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::AuthRejected(_) => "AUTH_REJECTED",
            GatewayError::TenantMismatch(_) => "TENANT_MISMATCH",
            GatewayError::AuthUnavailable(_) => "AUTH_UNAVAILABLE",
            GatewayError::InvalidJoin(_) => "INVALID_JOIN",
        }
    }

    /// WebSocket close code, for errors that end the connection
    pub fn close_code(&self) -> Option<u16> {
        match self {
            GatewayError::AuthRejected(_) => Some(4401),
            GatewayError::TenantMismatch(_) => Some(4403),
            GatewayError::AuthUnavailable(_) => Some(1013),
            GatewayError::InvalidJoin(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(GatewayError::AuthRejected("x".into()).code(), "AUTH_REJECTED");
        assert_eq!(GatewayError::AuthRejected("x".into()).close_code(), Some(4401));
        assert_eq!(GatewayError::TenantMismatch("x".into()).close_code(), Some(4403));
        assert_eq!(GatewayError::InvalidJoin("x".into()).close_code(), None);
    }
}
