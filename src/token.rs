//! Ephemeral credential minting
//!
//! POSTs to the model provider's client-secrets endpoint on behalf of a
//! carrier session. The credential endpoint accepts only a narrow subset of
//! the session record; the rest of the configuration is applied later via
//! `session.update` over the WebSocket, so everything else is stripped
//! before send.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::OpenAiConfig;

/// Outbound-call timeout. No retry; callers re-mint.
const MINT_TIMEOUT: Duration = Duration::from_secs(15);

/// Fields the credential endpoint accepts under `session`
const ALLOWED_SESSION_FIELDS: [&str; 4] = ["type", "model", "instructions", "prompt"];

/// Short-lived credential for one model WebSocket connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EphemeralCredential {
    pub value: String,
    /// Absolute expiry, epoch seconds
    pub expires_at: i64,
}

/// Outbound webhook reference, forwarded verbatim when supplied.
/// Accepts either a bare URL string or `{url, secret?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WebhookRef {
    Url(String),
    Full {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },
}

impl WebhookRef {
    /// Normalize to the `{url, secret?}` object shape
    fn normalize(&self) -> Value {
        match self {
            WebhookRef::Url(url) => json!({ "url": url }),
            WebhookRef::Full { url, secret } => match secret {
                Some(s) => json!({ "url": url, "secret": s }),
                None => json!({ "url": url }),
            },
        }
    }
}

/// Minting request
#[derive(Debug, Clone, Deserialize)]
pub struct MintRequest {
    /// Credential lifetime in seconds; zero means the configured default.
    /// The handler enforces [60, 3600].
    #[serde(default)]
    pub expires_after_seconds: u64,
    /// Session payload; sanitized before send
    #[serde(default)]
    pub session: Value,
    /// Optional control-webhook reference
    #[serde(default)]
    pub webhook: Option<WebhookRef>,
}

/// Minting failures
#[derive(Debug, Error)]
pub enum MintError {
    #[error("credential endpoint rejected the request (status {status}): {body}")]
    Upstream { status: u16, body: Value },
    #[error("credential response carried no secret value")]
    MissingSecret,
    #[error("credential request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Client for the model provider's credential endpoint
pub struct TokenMinter {
    client: reqwest::Client,
    api_base: String,
    org_id: Option<String>,
    project_id: Option<String>,
}

impl TokenMinter {
    pub fn new(openai: &OpenAiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: openai.api_base.clone(),
            org_id: openai.org_id.clone(),
            project_id: openai.project_id.clone(),
        }
    }

    /// Mint an ephemeral credential. Single-use; discarded after the model
    /// connection opens or on expiry.
    pub async fn mint(
        &self,
        api_key: &str,
        request: &MintRequest,
    ) -> Result<EphemeralCredential, MintError> {
        let mut body = json!({
            "expires_after": {
                "anchor": "created_at",
                "seconds": request.expires_after_seconds,
            },
            "session": sanitize_session(&request.session),
        });
        if let Some(webhook) = &request.webhook {
            body["server"] = webhook.normalize();
        }

        let mut builder = self
            .client
            .post(format!("{}/v1/realtime/client_secrets", self.api_base))
            .bearer_auth(api_key)
            .timeout(MINT_TIMEOUT)
            .json(&body);
        if let Some(org) = &self.org_id {
            builder = builder.header("OpenAI-Organization", org);
        }
        if let Some(project) = &self.project_id {
            builder = builder.header("OpenAI-Project", project);
        }

        let response = builder.send().await?;
        let status = response.status();
        let payload: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() || payload.get("error").is_some_and(|e| !e.is_null()) {
            return Err(MintError::Upstream {
                status: status.as_u16(),
                body: payload,
            });
        }

        let credential = parse_mint_response(&payload).ok_or(MintError::MissingSecret)?;
        debug!(expires_at = credential.expires_at, "Minted ephemeral credential");
        Ok(credential)
    }
}

/// Restrict the session payload to the fields the credential endpoint
/// accepts, coercing a numeric `prompt.version` to a string.
pub fn sanitize_session(session: &Value) -> Value {
    let mut out = serde_json::Map::new();
    if let Some(obj) = session.as_object() {
        for field in ALLOWED_SESSION_FIELDS {
            if let Some(value) = obj.get(field) {
                if value.is_null() {
                    continue;
                }
                out.insert(field.to_string(), value.clone());
            }
        }
    }
    out.entry("type".to_string())
        .or_insert_with(|| json!("realtime"));
    if let Some(version) = out
        .get_mut("prompt")
        .and_then(|p| p.as_object_mut())
        .and_then(|p| p.get_mut("version"))
    {
        if let Some(n) = version.as_i64() {
            *version = json!(n.to_string());
        } else if let Some(f) = version.as_f64() {
            *version = json!(f.to_string());
        }
    }
    Value::Object(out)
}

/// Accept the three known response shapes:
/// `{client_secret: {value, expires_at}}`, `{client_secret: "...",
/// expires_at}` and `{value, expires_at}`.
fn parse_mint_response(payload: &Value) -> Option<EphemeralCredential> {
    let top_expiry = payload.get("expires_at").and_then(Value::as_i64);
    match payload.get("client_secret") {
        Some(Value::Object(secret)) => {
            let value = secret.get("value")?.as_str()?.to_string();
            let expires_at = secret
                .get("expires_at")
                .and_then(Value::as_i64)
                .or(top_expiry)?;
            Some(EphemeralCredential { value, expires_at })
        }
        Some(Value::String(value)) => Some(EphemeralCredential {
            value: value.clone(),
            expires_at: top_expiry?,
        }),
        _ => {
            let value = payload.get("value")?.as_str()?.to_string();
            Some(EphemeralCredential {
                value,
                expires_at: top_expiry?,
            })
        }
    }
}
