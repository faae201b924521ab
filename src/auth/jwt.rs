//! JWT Token Handler
//! Mission: Validate bearer session tokens minted by the external session
//! service. This crate never issues tokens in production; `generate_token`
//! exists so tests can produce a token without standing up that service.

use crate::auth::models::Claims;
use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use tracing::debug;

/// JWT Handler for token operations
pub struct JwtHandler {
    secret: String,
    expiration_hours: i64,
}

impl JwtHandler {
    /// Create a new JWT handler with secret key
    pub fn new(secret: String) -> Self {
        Self {
            secret,
            expiration_hours: 24, // 24-hour tokens by default
        }
    }

    /// Generate a session token for a user id. Test/dev convenience only.
    pub fn generate_token(&self, user_id: &str) -> Result<(String, usize)> {
        let now = Utc::now();
        let expiration = now
            .checked_add_signed(chrono::Duration::hours(self.expiration_hours))
            .context("invalid timestamp")?
            .timestamp() as usize;

        let expires_in = (self.expiration_hours * 3600) as usize;

        let claims = Claims {
            sub: user_id.to_string(),
            exp: expiration,
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .context("failed to generate session token")?;

        Ok((token, expires_in))
    }

    /// Validate a bearer token and extract claims.
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .context("invalid or expired token")?;

        debug!(user_id = %decoded.claims.sub, "validated session token");

        Ok(decoded.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jwt_generation_and_validation() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string());

        let (token, expires_in) = handler.generate_token("u1").unwrap();
        assert!(!token.is_empty());
        assert_eq!(expires_in, 24 * 3600);

        let claims = handler.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "u1");
    }

    #[test]
    fn test_invalid_token_rejected() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string());
        let result = handler.validate_token("invalid.token.here");
        assert!(result.is_err());
    }

    #[test]
    fn test_different_secrets_reject() {
        let handler1 = JwtHandler::new("secret1".to_string());
        let handler2 = JwtHandler::new("secret2".to_string());

        let (token, _) = handler1.generate_token("u1").unwrap();

        let result = handler2.validate_token(&token);
        assert!(result.is_err());
    }

    #[test]
    fn test_token_contains_sub_and_exp() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string());
        let (token, _) = handler.generate_token("anon-check").unwrap();
        let claims = handler.validate_token(&token).unwrap();

        assert_eq!(claims.sub, "anon-check");
        assert!(claims.exp > Utc::now().timestamp() as usize);
    }
}
