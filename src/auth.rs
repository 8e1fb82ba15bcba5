use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::constants::{AUTH_COOKIE_MAX_AGE_SECS, AUTH_COOKIE_NAME};
use crate::ingress::LoginRequest;
use crate::AppState;

pub const AUTH_PASSCODE_ENV: &str = "AUTH_PASSCODE";
pub const SESSION_SECRET_ENV: &str = "SESSION_SECRET";
const DEFAULT_SESSION_SECRET: &str = "your-secret-key-at-least-32-characters-long";

/// Passcode gate over the API. Everything the core needs from this module is
/// the boolean `is_authorized`; token derivation is a salted hash compare,
/// not a claims scheme.
#[derive(Clone)]
pub struct AuthGate {
    secret: String,
    expected_token: Option<String>,
}

impl AuthGate {
    pub fn new(passcode: Option<&str>, secret: &str) -> Self {
        let expected_token = passcode
            .filter(|p| !p.trim().is_empty())
            .map(|p| derive_token(p, secret));
        Self {
            secret: secret.to_string(),
            expected_token,
        }
    }

    pub fn from_env() -> Self {
        let secret = std::env::var(SESSION_SECRET_ENV)
            .unwrap_or_else(|_| DEFAULT_SESSION_SECRET.to_string());
        let passcode = std::env::var(AUTH_PASSCODE_ENV).ok();

        let gate = Self::new(passcode.as_deref(), &secret);
        if !gate.enabled() {
            tracing::warn!(
                "{} is not set; the API is open to anyone who can reach it",
                AUTH_PASSCODE_ENV
            );
        }
        gate
    }

    pub fn enabled(&self) -> bool {
        self.expected_token.is_some()
    }

    /// Returns the cookie token when the submitted passcode is correct.
    pub fn login_token(&self, passcode: &str) -> Option<String> {
        let expected = self.expected_token.as_ref()?;
        let candidate = derive_token(passcode, &self.secret);
        if &candidate == expected {
            Some(candidate)
        } else {
            None
        }
    }

    /// The boolean gate the rest of the server consumes.
    pub fn is_authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = self.expected_token.as_ref() else {
            return true;
        };
        match cookie_value(headers, AUTH_COOKIE_NAME) {
            Some(token) => &token == expected,
            None => false,
        }
    }
}

fn derive_token(passcode: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(passcode.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        if parts.next() == Some(name) {
            return parts.next().map(|v| v.to_string());
        }
    }
    None
}

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !state.auth.is_authorized(req.headers()) {
        tracing::warn!("Unauthorized request to {}", req.uri().path());
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Unauthorized" })),
        )
            .into_response();
    }
    next.run(req).await
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    let request: LoginRequest = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "passcode is required" })),
            )
                .into_response();
        }
    };

    if !state.auth.enabled() {
        return (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "note": "auth is disabled" })),
        )
            .into_response();
    }

    match state.auth.login_token(&request.passcode) {
        Some(token) => {
            let cookie = format!(
                "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
                AUTH_COOKIE_NAME, token, AUTH_COOKIE_MAX_AGE_SECS
            );
            (
                StatusCode::OK,
                [(header::SET_COOKIE, cookie)],
                Json(serde_json::json!({ "success": true })),
            )
                .into_response()
        }
        None => {
            tracing::warn!("Login attempt with invalid passcode");
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "Invalid passcode" })),
            )
                .into_response()
        }
    }
}

pub async fn logout() -> Response {
    let cookie = format!("{}=; Path=/; HttpOnly; Max-Age=0", AUTH_COOKIE_NAME);
    (
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(serde_json::json!({ "success": true })),
    )
        .into_response()
}
