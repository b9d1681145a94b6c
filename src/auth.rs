// ABOUTME: Bearer-token validation for externally issued identities
// ABOUTME: Validates HS256 JWTs from the identity provider and extracts the calling user
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! Authentication and session management
//!
//! Identity issuance is delegated to an external provider; this module only
//! *validates* the bearer tokens it issues (HS256, shared secret) and maps
//! them to a [`AuthResult`]. Token minting is kept for tests and the dev CLI.

use crate::errors::{AppError, AppResult};
use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audience expected in every accepted token
const TOKEN_AUDIENCE: &str = "tidemark";

/// `JWT` claims for user authentication
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User `ID`
    pub sub: String,
    /// User email
    pub email: String,
    /// Issued at timestamp
    pub iat: i64,
    /// Expiration timestamp
    pub exp: i64,
    /// Audience (who the token is intended for)
    pub aud: String,
}

/// Authentication result with user context
#[derive(Debug, Clone)]
pub struct AuthResult {
    /// Authenticated user `ID`
    pub user_id: Uuid,
    /// Email recorded in the token
    pub email: String,
}

/// Authentication manager for bearer tokens
pub struct AuthManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_expiry_hours: i64,
}

impl AuthManager {
    /// Create a new authentication manager from the shared HS256 secret
    #[must_use]
    pub fn new(secret: &[u8], token_expiry_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            token_expiry_hours,
        }
    }

    /// Generate a token for a user (tests and the dev CLI only; production
    /// tokens come from the external identity provider)
    ///
    /// # Errors
    ///
    /// Returns an error if JWT encoding fails.
    pub fn generate_token(&self, user_id: Uuid, email: &str) -> AppResult<String> {
        let now = Utc::now();
        let expiry = now + Duration::hours(self.token_expiry_hours);

        let claims = Claims {
            sub: user_id.to_string(),
            email: email.to_owned(),
            iat: now.timestamp(),
            exp: expiry.timestamp(),
            aud: TOKEN_AUDIENCE.to_owned(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AppError::internal(format!("Failed to encode token: {e}")))
    }

    /// Validate a bearer token and return its claims
    ///
    /// # Errors
    ///
    /// Returns `AuthInvalid` if the signature, audience, expiry, or subject
    /// is unacceptable.
    pub fn validate_token(&self, token: &str) -> AppResult<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_audience(&[TOKEN_AUDIENCE]);

        let token_data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| AppError::auth_invalid(format!("Token validation failed: {e}")))?;

        Ok(token_data.claims)
    }

    /// Authenticate a request from its `Authorization: Bearer` header
    ///
    /// # Errors
    ///
    /// Returns `AuthRequired` when the header is absent and `AuthInvalid`
    /// when the token does not validate or carries a malformed subject.
    pub fn authenticate(&self, headers: &HeaderMap) -> AppResult<AuthResult> {
        let auth_header = headers
            .get("authorization")
            .and_then(|h| h.to_str().ok())
            .ok_or_else(AppError::auth_required)?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AppError::auth_invalid("Authorization header must be a bearer token"))?;

        let claims = self.validate_token(token)?;

        let user_id = Uuid::parse_str(&claims.sub)
            .map_err(|e| AppError::auth_invalid(format!("Malformed token subject: {e}")))?;

        Ok(AuthResult {
            user_id,
            email: claims.email,
        })
    }
}

/// Generate a random secret suitable for HS256 signing (dev/test helper)
#[must_use]
pub fn generate_token_secret() -> [u8; 32] {
    use rand::RngCore;
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn manager() -> AuthManager {
        AuthManager::new(&generate_token_secret(), 24)
    }

    #[test]
    fn test_token_roundtrip() {
        let auth = manager();
        let user_id = Uuid::new_v4();

        let token = auth.generate_token(user_id, "user@example.com").unwrap();
        let claims = auth.validate_token(&token).unwrap();

        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.email, "user@example.com");
        assert_eq!(claims.aud, TOKEN_AUDIENCE);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let auth = manager();
        let other = manager();

        let token = auth
            .generate_token(Uuid::new_v4(), "user@example.com")
            .unwrap();
        assert!(other.validate_token(&token).is_err());
    }

    #[test]
    fn test_authenticate_requires_bearer() {
        let auth = manager();
        let mut headers = HeaderMap::new();

        assert!(auth.authenticate(&headers).is_err());

        headers.insert("authorization", "Basic abc".parse().unwrap());
        assert!(auth.authenticate(&headers).is_err());

        let token = auth
            .generate_token(Uuid::new_v4(), "user@example.com")
            .unwrap();
        headers.insert(
            "authorization",
            format!("Bearer {token}").parse().unwrap(),
        );
        assert!(auth.authenticate(&headers).is_ok());
    }
}
