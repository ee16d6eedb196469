use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use thiserror::Error;

use crate::config::JwtConfig;

use super::Claims;

/// Why a bearer credential was refused
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,

    #[error("token issued for another issuer or audience")]
    WrongAudience,

    #[error("invalid token: {0}")]
    Invalid(String),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::InvalidIssuer | ErrorKind::InvalidAudience => TokenError::WrongAudience,
            _ => TokenError::Invalid(err.to_string()),
        }
    }
}

/// Verifies bearer credentials presented at the socket handshake.
pub struct JwtValidator {
    key: DecodingKey,
    rules: Validation,
}

impl JwtValidator {
    pub fn new(config: &JwtConfig) -> Self {
        let mut rules = Validation::new(Algorithm::HS256);
        rules.set_required_spec_claims(&["exp", "sub"]);
        if let Some(issuer) = config.issuer.as_deref() {
            rules.set_issuer(&[issuer]);
        }
        if let Some(audience) = config.audience.as_deref() {
            rules.set_audience(&[audience]);
        }

        Self {
            key: DecodingKey::from_secret(config.secret.as_bytes()),
            rules,
        }
    }

    pub fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let claims = decode::<Claims>(token, &self.key, &self.rules)?.claims;
        if claims.sub.is_empty() {
            return Err(TokenError::Invalid("empty subject".into()));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn create_test_config() -> JwtConfig {
        JwtConfig {
            secret: "test-secret-key-for-testing".to_string(),
            issuer: None,
            audience: None,
        }
    }

    fn create_test_token(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims(tenant_id: Option<&str>, exp_offset: i64) -> Claims {
        let now = chrono::Utc::now().timestamp();
        Claims {
            sub: "user-123".to_string(),
            exp: now + exp_offset,
            iat: now,
            roles: vec!["member".to_string()],
            tenant_id: tenant_id.map(str::to_string),
            extra: Default::default(),
        }
    }

    #[test]
    fn test_valid_token() {
        let config = create_test_config();
        let validator = JwtValidator::new(&config);

        let token = create_test_token(&claims(Some("acme"), 3600), &config.secret);
        let validated = validator.validate(&token).unwrap();

        assert_eq!(validated.sub, "user-123");
        assert_eq!(validated.tenant_id(), Some("acme"));
    }

    #[test]
    fn test_expired_token() {
        let config = create_test_config();
        let validator = JwtValidator::new(&config);

        let token = create_test_token(&claims(None, -3600), &config.secret);
        assert!(matches!(validator.validate(&token), Err(TokenError::Expired)));
    }

    #[test]
    fn test_wrong_secret() {
        let validator = JwtValidator::new(&create_test_config());
        let token = create_test_token(&claims(None, 3600), "another-secret");
        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn test_audience_mismatch() {
        let config = JwtConfig {
            audience: Some("relay".to_string()),
            ..create_test_config()
        };
        let validator = JwtValidator::new(&config);
        let token = create_test_token(&claims(None, 3600), &config.secret);
        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn test_invalid_token() {
        let validator = JwtValidator::new(&create_test_config());
        assert!(validator.validate("invalid-token").is_err());
    }
}
