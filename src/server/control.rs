//! Control webhook and runtime settings editor
//!
//! `POST /control` is what the model's outbound webhook hits to pull
//! session updates mid-call; it accepts either a shared bearer token or an
//! HMAC-SHA256 signed-request envelope. `/control/settings` edits the
//! override layer and is guarded by a separate admin bearer token.
//! All secret comparisons are constant-time.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

use super::AppState;
use crate::session::SessionConfig;

type HmacSha256 = Hmac<Sha256>;

/// Minimum admin bearer length; anything shorter never authenticates
const MIN_ADMIN_SECRET_LEN: usize = 32;

const TIMESTAMP_HEADER: &str = "x-control-timestamp";
const SIGNATURE_HEADER: &str = "x-control-signature";

/// Signed-envelope verification failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlAuthError {
    #[error("no usable credentials on the request")]
    MissingCredentials,
    #[error("bearer token mismatch")]
    BadBearer,
    #[error("signature mismatch")]
    BadSignature,
    #[error("timestamp outside tolerance")]
    StaleTimestamp,
}

/// Constant-time bearer comparison
fn verify_bearer(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

/// Verify an HMAC-SHA256 signed-request envelope.
///
/// The MAC covers `timestamp + "." + body`. The presented signature may be
/// hex or base64, optionally prefixed with `v1,` or `sha256=`.
pub fn verify_signed_request(
    secret: &str,
    timestamp: &str,
    body: &str,
    signature: &str,
    tolerance_seconds: u64,
    now_epoch: i64,
) -> Result<(), ControlAuthError> {
    let ts: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| ControlAuthError::StaleTimestamp)?;
    if (now_epoch - ts).unsigned_abs() > tolerance_seconds {
        return Err(ControlAuthError::StaleTimestamp);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ControlAuthError::BadSignature)?;
    mac.update(timestamp.trim().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    let expected = mac.finalize().into_bytes();

    let presented = signature
        .trim()
        .trim_start_matches("v1,")
        .trim_start_matches("sha256=");
    let decoded = hex::decode(presented)
        .ok()
        .or_else(|| BASE64.decode(presented).ok())
        .ok_or(ControlAuthError::BadSignature)?;

    if expected.as_slice().ct_eq(&decoded).into() {
        Ok(())
    } else {
        Err(ControlAuthError::BadSignature)
    }
}

fn bearer_from(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Authenticate a /control request: bearer first, signed envelope second
fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    body: &str,
) -> Result<(), ControlAuthError> {
    if let (Some(expected), Some(presented)) =
        (state.config.control.secret.as_deref(), bearer_from(headers))
    {
        return if verify_bearer(expected, presented) {
            Ok(())
        } else {
            Err(ControlAuthError::BadBearer)
        };
    }

    let timestamp = headers.get(TIMESTAMP_HEADER).and_then(|v| v.to_str().ok());
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    if let (Some(secret), Some(ts), Some(sig)) = (
        state.config.control.signing_secret.as_deref(),
        timestamp,
        signature,
    ) {
        return verify_signed_request(
            secret,
            ts,
            body,
            sig,
            state.config.control.tolerance_seconds,
            chrono::Utc::now().timestamp(),
        );
    }

    Err(ControlAuthError::MissingCredentials)
}

fn unauthorized() -> Response {
    // No detail leaks: the caller learns only that auth failed
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response()
}

/// `POST /control`: the session-update pull the model invokes mid-call
pub async fn post_control(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Err(e) = authenticate(&state, &headers, &body) {
        warn!("Control webhook rejected: {}", e);
        return unauthorized();
    }
    debug!("Control webhook pull");
    Json(json!({ "events": [state.control.current_update_event()] })).into_response()
}

/// `GET /control`: current update, for diagnostics
pub async fn get_control(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = authenticate(&state, &headers, "") {
        warn!("Control diagnostics rejected: {}", e);
        return unauthorized();
    }
    Json(state.control.current_update_event()).into_response()
}

/// Admin bearer check for the settings editor
fn authenticate_admin(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = state.config.control.admin_secret.as_deref() else {
        return false;
    };
    if expected.len() < MIN_ADMIN_SECRET_LEN {
        warn!("Admin secret is shorter than {} bytes; refusing", MIN_ADMIN_SECRET_LEN);
        return false;
    }
    bearer_from(headers).is_some_and(|presented| verify_bearer(expected, presented))
}

/// `GET /control/settings`: defaults, overrides and the effective merge
pub async fn get_settings(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authenticate_admin(&state, &headers) {
        return unauthorized();
    }
    Json(json!({
        "defaults": state.control.defaults(),
        "overrides": state.control.overrides(),
        "effective": state.control.current(),
    }))
    .into_response()
}

/// `POST /control/settings`: replace the override layer. A `null` or empty
/// object body clears it.
pub async fn post_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if !authenticate_admin(&state, &headers) {
        return unauthorized();
    }

    let raw: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid JSON: {}", e) })),
            )
                .into_response();
        }
    };

    if raw.is_null() || raw.as_object().is_some_and(|o| o.is_empty()) {
        state.control.set_overrides(None);
        return Json(json!({ "ok": true, "overrides": Value::Null })).into_response();
    }

    let overrides: SessionConfig = match serde_json::from_value(raw) {
        Ok(c) => c,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid session config: {}", e) })),
            )
                .into_response();
        }
    };
    if let Err(e) = overrides.validate() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response();
    }

    state.control.set_overrides(Some(overrides.clone()));
    Json(json!({ "ok": true, "overrides": overrides })).into_response()
}
