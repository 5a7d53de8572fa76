//! Password check, bearer token issuance and the request extractor that
//! resolves a bearer token to its user.

use anyhow::Result;
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::api::AppState;
use crate::config;
use crate::db::{self, Pool};
use crate::error::ApiError;

/// Lowercase hex SHA-256, the form passwords take in the config file.
/// Tokens are stored under the same digest.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

pub fn verify_password(auth: &config::Auth, username: &str, password: &str) -> bool {
    let digest = Sha256::digest(password.as_bytes());
    auth.users
        .iter()
        .filter(|u| u.username == username)
        .fold(false, |ok, u| digest_matches(&u.password_sha256, &digest) | ok)
}

/// Compares every byte so the time taken does not depend on where the
/// digests first differ.
fn digest_matches(stored_hex: &str, digest: &[u8]) -> bool {
    match hex::decode(stored_hex) {
        Ok(stored) if stored.len() == digest.len() => {
            stored.iter().zip(digest).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
        }
        _ => false,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
}

/// A fresh bearer token for valid credentials, `None` otherwise.
#[instrument(skip_all, fields(username = %username))]
pub async fn issue_token(
    pool: &Pool,
    auth: &config::Auth,
    username: &str,
    password: &str,
) -> Result<Option<IssuedToken>> {
    if !verify_password(auth, username, password) {
        warn!("rejected credentials");
        return Ok(None);
    }
    let token = Uuid::new_v4().simple().to_string();
    let now = Utc::now();
    let expires_at = now + Duration::seconds(auth.token_ttl_seconds as i64);
    db::insert_token(pool, &hash_password(&token), username, now, expires_at).await?;
    let purged = db::purge_expired_tokens(pool, now).await?;
    info!(purged, "token issued");
    Ok(Some(IssuedToken {
        access_token: token,
        token_type: "bearer",
        expires_in: auth.token_ttl_seconds,
    }))
}

/// The authenticated caller of a request.
#[derive(Debug, Clone, Serialize)]
pub struct AuthUser {
    pub username: String,
    pub expires_at: DateTime<Utc>,
}

fn bearer(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer(parts).ok_or_else(|| ApiError::Unauthorized("Not authenticated".into()))?;
        let record = db::find_token(&state.pool, &hash_password(token), Utc::now())
            .await?
            .ok_or_else(|| ApiError::Unauthorized("Could not validate credentials".into()))?;
        Ok(AuthUser {
            username: record.username,
            expires_at: record.expires_at,
        })
    }
}
