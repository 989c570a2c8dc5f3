//! Token validation
//!
//! Token issuance belongs to the external auth service; this service only
//! validates bearer tokens and extracts the authenticated principal. The
//! token's `sub` is the numeric user id, `role` the permission tier.

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use terminus_core::{Error, Result};
use terminus_types::{AuthUser, Role};

pub struct AuthService {
    jwt_secret: String,
}

impl AuthService {
    pub fn new(jwt_secret: String) -> Self {
        Self { jwt_secret }
    }

    pub fn validate_token(&self, token: &str) -> Result<AuthUser> {
        let validation = Validation::default();
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &validation,
        )
        .map_err(|e| Error::Auth(format!("invalid token: {}", e)))?;

        let user_id: i64 = token_data
            .claims
            .sub
            .parse()
            .map_err(|_| Error::Auth("malformed subject claim".to_string()))?;
        let role: Role = token_data
            .claims
            .role
            .parse()
            .map_err(|_| Error::Auth("unknown role claim".to_string()))?;

        Ok(AuthUser { user_id, role })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    role: String,
    exp: i64,
    iat: i64,
}
