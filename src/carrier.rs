//! Carrier wire protocol and REST client
//!
//! Serde types for the media-stream WebSocket events the carrier exchanges
//! with the bridge, plus the thin REST wrapper that places outbound calls.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::TwilioConfig;

/// E.164 phone-number shape
static E164: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+[1-9]\d{1,14}$").expect("E.164 regex"));

/// Whether `number` is a well-formed E.164 string
pub fn is_e164(number: &str) -> bool {
    E164.is_match(number)
}

// ─── Media-stream events (carrier → bridge) ──────────────────

/// Events the carrier sends over the media-stream WebSocket
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum CarrierEvent {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StartMetadata,
    },
    Media {
        media: MediaPayload,
    },
    Mark {
        mark: MarkPayload,
    },
    Stop {
        #[serde(default, rename = "streamSid")]
        stream_sid: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMetadata {
    pub call_sid: String,
    /// Parameters the control document attached to the stream
    #[serde(default)]
    pub custom_parameters: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct MediaPayload {
    /// base64-encoded μ-law audio
    pub payload: String,
    /// Milliseconds since stream start
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

// ─── Media-stream messages (bridge → carrier) ────────────────

/// Outbound media frame carrying base64 μ-law audio
pub fn media_message(stream_sid: &str, payload_b64: &str) -> String {
    json!({
        "event": "media",
        "streamSid": stream_sid,
        "media": { "payload": payload_b64 },
    })
    .to_string()
}

/// Playback-synchronization mark
pub fn mark_message(stream_sid: &str, name: &str) -> String {
    json!({
        "event": "mark",
        "streamSid": stream_sid,
        "mark": { "name": name },
    })
    .to_string()
}

/// Tell the carrier to drop its own playback buffer
pub fn clear_message(stream_sid: &str) -> String {
    json!({
        "event": "clear",
        "streamSid": stream_sid,
    })
    .to_string()
}

// ─── Outbound-call dispatcher ────────────────────────────────

/// Lifecycle events a status callback subscribes to
const STATUS_CALLBACK_EVENTS: [&str; 4] = ["initiated", "ringing", "answered", "completed"];

/// Outbound-call request
#[derive(Debug, Clone, Deserialize)]
pub struct PlaceCall {
    pub to: String,
    #[serde(default)]
    pub from: Option<String>,
    /// Control-document URL the carrier fetches when the call connects
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub record: bool,
    #[serde(default)]
    pub status_callback: Option<String>,
}

/// Dispatcher failures
#[derive(Debug, Error)]
pub enum PlaceCallError {
    #[error("destination is not E.164: {0:?}")]
    InvalidNumber(String),
    #[error("carrier credentials are not configured")]
    MissingCredentials,
    #[error("carrier rejected the call (status {status}): {body}")]
    Upstream { status: u16, body: Value },
    #[error("carrier request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Thin wrapper over the carrier's REST API
pub struct CallDispatcher {
    client: reqwest::Client,
    api_base: String,
    account_sid: Option<String>,
    auth_token: Option<String>,
    from_number: Option<String>,
}

impl CallDispatcher {
    pub fn new(twilio: &TwilioConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: twilio.api_base.clone(),
            account_sid: twilio.account_sid.clone(),
            auth_token: twilio.auth_token.clone(),
            from_number: twilio.from_number.clone(),
        }
    }

    fn credentials(&self) -> Result<(&str, &str), PlaceCallError> {
        match (self.account_sid.as_deref(), self.auth_token.as_deref()) {
            (Some(sid), Some(token)) => Ok((sid, token)),
            _ => Err(PlaceCallError::MissingCredentials),
        }
    }

    /// Place an outbound call pointing at `url`. Returns the carrier call id.
    pub async fn place(&self, request: &PlaceCall, default_url: &str) -> Result<String, PlaceCallError> {
        if !is_e164(&request.to) {
            return Err(PlaceCallError::InvalidNumber(request.to.clone()));
        }
        let (account_sid, auth_token) = self.credentials()?;
        let from = request
            .from
            .as_deref()
            .or(self.from_number.as_deref())
            .ok_or(PlaceCallError::MissingCredentials)?;
        if !is_e164(from) {
            return Err(PlaceCallError::InvalidNumber(from.to_string()));
        }

        let url = request.url.as_deref().unwrap_or(default_url);
        let form = build_place_form(request, from, url);

        let response = self
            .client
            .post(format!(
                "{}/2010-04-01/Accounts/{}/Calls.json",
                self.api_base, account_sid
            ))
            .basic_auth(account_sid, Some(auth_token))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(PlaceCallError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let call_sid = body
            .get("sid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        debug!(call_sid = %call_sid, to = %request.to, "Outbound call placed");
        Ok(call_sid)
    }

    /// Recent call records from the carrier
    pub async fn list(&self, page_size: u32) -> Result<Value, PlaceCallError> {
        let (account_sid, auth_token) = self.credentials()?;
        let response = self
            .client
            .get(format!(
                "{}/2010-04-01/Accounts/{}/Calls.json",
                self.api_base, account_sid
            ))
            .query(&[("PageSize", page_size)])
            .basic_auth(account_sid, Some(auth_token))
            .send()
            .await?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(PlaceCallError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

/// Form parameters for the carrier's call-creation endpoint
fn build_place_form(request: &PlaceCall, from: &str, url: &str) -> Vec<(&'static str, String)> {
    let mut form: Vec<(&'static str, String)> = vec![
        ("To", request.to.clone()),
        ("From", from.to_string()),
        ("Url", url.to_string()),
        ("Method", "POST".to_string()),
    ];
    if request.record {
        form.push(("Record", "true".to_string()));
        form.push(("RecordingChannels", "dual".to_string()));
    }
    if let Some(callback) = &request.status_callback {
        form.push(("StatusCallback", callback.clone()));
        form.push(("StatusCallbackMethod", "POST".to_string()));
        for event in STATUS_CALLBACK_EVENTS {
            form.push(("StatusCallbackEvent", event.to_string()));
        }
    }
    form
}
