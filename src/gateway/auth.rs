//! Token signing and verification shared by every service
//!
//! Users mints tokens; Wallets and Transactions verify them with the same
//! HS256 secret and only need the claims, not the user record.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, header},
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
    errors::{Error as JwtError, ErrorKind},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::cookies::{ACCESS_COOKIE, read_cookie};
use super::error::ApiError;
use crate::core_types::AccountId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// JWT claims
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub sub: String, // user email
    pub account_id: AccountId,
    pub kind: TokenKind,
    /// Random id so two tokens minted in the same second differ
    pub jti: String,
    pub exp: i64,
    pub iat: i64,
}

/// HMAC key pair built once from the process secret
#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn sign(
        &self,
        email: &str,
        account_id: &str,
        kind: TokenKind,
        issued_at: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<(String, Claims), JwtError> {
        let claims = Claims {
            sub: email.to_string(),
            account_id: account_id.to_string(),
            kind,
            jti: Uuid::new_v4().to_string(),
            exp: (issued_at + ttl).timestamp(),
            iat: issued_at.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok((token, claims))
    }

    /// Check signature, expiry and kind
    pub fn verify(&self, token: &str, kind: TokenKind) -> Result<Claims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        if data.claims.kind != kind {
            return Err(ErrorKind::InvalidToken.into());
        }
        Ok(data.claims)
    }
}

/// Caller identity injected by the auth middleware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub account_id: AccountId,
    pub email: String,
}

impl AuthUser {
    /// 403 unless the caller owns `account_id`
    pub fn ensure_account(&self, account_id: &str) -> Result<(), ApiError> {
        if self.account_id != account_id {
            return ApiError::forbidden("Access to another account is forbidden").into_err();
        }
        Ok(())
    }
}

/// Access token from `Authorization: Bearer` or the `access_token` cookie
pub fn access_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    bearer.or_else(|| read_cookie(headers, ACCESS_COOKIE))
}

/// Claims-only authentication for services that do not own user records
pub async fn require_auth(
    State(keys): State<Arc<TokenKeys>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = access_token(request.headers())
        .ok_or_else(|| ApiError::unauthorized("Authentication required"))?;
    let claims = keys
        .verify(&token, TokenKind::Access)
        .map_err(|_| ApiError::unauthorized("Invalid or expired token"))?;
    request.extensions_mut().insert(AuthUser {
        account_id: claims.account_id,
        email: claims.sub,
    });
    Ok(next.run(request).await)
}
