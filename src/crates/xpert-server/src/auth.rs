//! Authentication: API keys and short-lived client secrets
//!
//! Two accepted schemes. Server-to-server callers present an API key
//! (`x-api-key` or `Authorization: Bearer <key>`). Browser widgets use a
//! short-lived client secret issued by `POST /chatkit/sessions`
//! (`x-client-secret` or `Authorization: Bearer cs-x-…`). When no API keys
//! are configured, auth is disabled for local development.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::{
    body::Body,
    extract::State,
    http::{header, Request},
    middleware::Next,
    response::Response,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Prefix distinguishing client secrets from API keys
pub const CLIENT_SECRET_PREFIX: &str = "cs-x-";

/// Lifetime of an issued client secret
const SECRET_TTL_SECONDS: i64 = 600;

/// Credential registry
#[derive(Debug, Default)]
pub struct AuthService {
    api_keys: HashSet<String>,
    secrets: DashMap<String, DateTime<Utc>>,
}

impl AuthService {
    pub fn new(api_keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            api_keys: api_keys.into_iter().collect(),
            secrets: DashMap::new(),
        }
    }

    /// Auth is enforced only when at least one API key is configured
    pub fn enabled(&self) -> bool {
        !self.api_keys.is_empty()
    }

    pub fn check_api_key(&self, key: &str) -> bool {
        self.api_keys.contains(key)
    }

    pub fn check_client_secret(&self, secret: &str) -> bool {
        match self.secrets.get(secret) {
            Some(expiry) => *expiry > Utc::now(),
            None => false,
        }
    }

    /// Issue a fresh client secret
    pub fn issue_client_secret(&self) -> (String, DateTime<Utc>) {
        let token: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(40)
            .map(char::from)
            .collect();
        let secret = format!("{CLIENT_SECRET_PREFIX}{token}");
        let expires_at = Utc::now() + Duration::seconds(SECRET_TTL_SECONDS);
        self.secrets.insert(secret.clone(), expires_at);
        (secret, expires_at)
    }
}

fn bearer(req: &Request<Body>) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn header_value<'a>(req: &'a Request<Body>, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Axum middleware guarding every API route
pub async fn require_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.auth.enabled() {
        return Ok(next.run(req).await);
    }

    let api_key = header_value(&req, "x-api-key")
        .or_else(|| bearer(&req).filter(|v| !v.starts_with(CLIENT_SECRET_PREFIX)));
    if let Some(key) = api_key {
        if state.auth.check_api_key(key) {
            return Ok(next.run(req).await);
        }
    }

    let client_secret = header_value(&req, "x-client-secret")
        .or_else(|| bearer(&req).filter(|v| v.starts_with(CLIENT_SECRET_PREFIX)));
    if let Some(secret) = client_secret {
        if state.auth.check_client_secret(secret) {
            return Ok(next.run(req).await);
        }
    }

    Err(ApiError::Unauthorized(
        "missing or invalid credentials".to_string(),
    ))
}

/// Response of `POST /chatkit/sessions`
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatkitSessionResponse {
    pub client_secret: String,
    pub expires_at: DateTime<Utc>,
}

/// Issue a client secret for a browser widget session
pub async fn create_chatkit_session(
    State(state): State<AppState>,
) -> ApiResult<Json<ChatkitSessionResponse>> {
    let (client_secret, expires_at) = state.auth.issue_client_secret();
    tracing::debug!(%expires_at, "issued chatkit client secret");
    Ok(Json(ChatkitSessionResponse {
        client_secret,
        expires_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_keys_are_checked() {
        let auth = AuthService::new(["key-1".to_string()]);
        assert!(auth.enabled());
        assert!(auth.check_api_key("key-1"));
        assert!(!auth.check_api_key("key-2"));
    }

    #[test]
    fn disabled_when_no_keys() {
        let auth = AuthService::new([]);
        assert!(!auth.enabled());
    }

    #[test]
    fn client_secrets_expire() {
        let auth = AuthService::new(["key-1".to_string()]);
        let (secret, expires_at) = auth.issue_client_secret();
        assert!(secret.starts_with(CLIENT_SECRET_PREFIX));
        assert!(expires_at > Utc::now());
        assert!(auth.check_client_secret(&secret));
        assert!(!auth.check_client_secret("cs-x-unknown"));
    }
}
