//! Model WebSocket connection and event protocol
//!
//! Client events are built as JSON; server events are parsed loosely and
//! classified through one dispatch table that accepts both the GA event
//! names and their legacy aliases (`response.audio.*` et al).

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::header::{HeaderValue, AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL},
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

/// Model socket handshake timeout
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

pub type ModelSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How to present the credential during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <token>` header (preferred)
    Bearer,
    /// `realtime` + `openai-insecure-api-key.<token>` subprotocol pair
    /// (browser fallback)
    Subprotocol,
}

/// Build the handshake request: wss URL with the model id, credential
/// attached per `auth`. Per-message compression is not negotiated.
fn build_request(
    api_base: &str,
    model: &str,
    token: &str,
    auth: AuthStyle,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let ws_base = api_base
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    let url = format!("{}/v1/realtime?model={}", ws_base.trim_end_matches('/'), model);

    let mut request = url
        .into_client_request()
        .context("invalid model WebSocket URL")?;
    match auth {
        AuthStyle::Bearer => {
            request.headers_mut().insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .context("credential is not a valid header value")?,
            );
        }
        AuthStyle::Subprotocol => {
            request.headers_mut().insert(
                SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_str(&format!("realtime, openai-insecure-api-key.{token}"))
                    .context("credential is not a valid subprotocol value")?,
            );
        }
    }
    Ok(request)
}

/// Open the model WebSocket with a 15 s handshake timeout.
///
/// `api_base` is the HTTPS origin; the scheme is rewritten to wss.
pub async fn connect(
    api_base: &str,
    model: &str,
    token: &str,
    auth: AuthStyle,
) -> Result<ModelSocket> {
    let request = build_request(api_base, model, token, auth)?;
    let url = request.uri().to_string();

    let (socket, response) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(request))
        .await
        .context("model handshake timed out")?
        .context("model handshake failed")?;
    debug!(url = %url, status = %response.status(), "Model socket open");
    Ok(socket)
}

// ─── Server events ───────────────────────────────────────────

/// Canonical server-event classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelEventKind {
    SessionCreated,
    SessionUpdated,
    ResponseCreated,
    OutputItemAdded,
    OutputItemDone,
    AudioDelta,
    AudioDone,
    AudioTranscriptDelta,
    AudioTranscriptDone,
    TextDelta,
    TextDone,
    FunctionCallArgumentsDelta,
    FunctionCallArgumentsDone,
    ResponseDone,
    ResponseCancelled,
    SpeechStarted,
    SpeechStopped,
    InputCommitted,
    InputCleared,
    TranscriptionCompleted,
    TranscriptionFailed,
    RateLimitsUpdated,
    Error,
    Other,
}

/// Map an event-type string to its canonical kind, accepting both the GA
/// names and the legacy aliases from before the protocol rename.
pub fn classify(event_type: &str) -> ModelEventKind {
    use ModelEventKind::*;
    match event_type {
        "session.created" => SessionCreated,
        "session.updated" => SessionUpdated,
        "response.created" => ResponseCreated,
        "response.output_item.added" => OutputItemAdded,
        "response.output_item.done" => OutputItemDone,
        "response.output_audio.delta" | "response.audio.delta" => AudioDelta,
        "response.output_audio.done" | "response.audio.done" => AudioDone,
        "response.output_audio_transcript.delta" | "response.audio_transcript.delta" => {
            AudioTranscriptDelta
        }
        "response.output_audio_transcript.done" | "response.audio_transcript.done" => {
            AudioTranscriptDone
        }
        "response.output_text.delta" | "response.text.delta" => TextDelta,
        "response.output_text.done" | "response.text.done" => TextDone,
        "response.function_call_arguments.delta" => FunctionCallArgumentsDelta,
        "response.function_call_arguments.done" => FunctionCallArgumentsDone,
        "response.done" => ResponseDone,
        "response.cancelled" => ResponseCancelled,
        "input_audio_buffer.speech_started" => SpeechStarted,
        "input_audio_buffer.speech_stopped" => SpeechStopped,
        "input_audio_buffer.committed" => InputCommitted,
        "input_audio_buffer.cleared" => InputCleared,
        "conversation.item.input_audio_transcription.completed" => TranscriptionCompleted,
        "conversation.item.input_audio_transcription.failed" => TranscriptionFailed,
        "rate_limits.updated" => RateLimitsUpdated,
        "error" => Error,
        _ => Other,
    }
}

/// Loosely-parsed server event; fields are populated per kind
#[derive(Debug, Deserialize)]
pub struct ModelEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub delta: Option<String>,
    #[serde(default)]
    pub item_id: Option<String>,
    #[serde(default)]
    pub item: Option<Value>,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl ModelEvent {
    pub fn kind(&self) -> ModelEventKind {
        classify(&self.event_type)
    }

    /// Assistant item id from either the flat field or the item object
    pub fn assistant_item_id(&self) -> Option<&str> {
        self.item_id
            .as_deref()
            .or_else(|| self.item.as_ref()?.get("id")?.as_str())
    }
}

// ─── Client events ───────────────────────────────────────────

pub fn input_audio_append(audio_b64: &str) -> String {
    json!({ "type": "input_audio_buffer.append", "audio": audio_b64 }).to_string()
}

pub fn input_audio_commit() -> String {
    json!({ "type": "input_audio_buffer.commit" }).to_string()
}

pub fn input_audio_clear() -> String {
    json!({ "type": "input_audio_buffer.clear" }).to_string()
}

/// Tell the model how much assistant audio the caller actually heard
pub fn truncate_event(item_id: &str, audio_end_ms: u64) -> String {
    json!({
        "type": "conversation.item.truncate",
        "item_id": item_id,
        "content_index": 0,
        "audio_end_ms": audio_end_ms,
    })
    .to_string()
}

/// Request a response, optionally with per-turn overrides
pub fn response_create(overrides: Option<Value>) -> String {
    match overrides {
        Some(response) => json!({ "type": "response.create", "response": response }).to_string(),
        None => json!({ "type": "response.create" }).to_string(),
    }
}

pub fn response_cancel() -> String {
    json!({ "type": "response.cancel" }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_request_shape() {
        let request =
            build_request("https://api.openai.com", "gpt-realtime", "ek_X", AuthStyle::Bearer)
                .unwrap();
        assert_eq!(
            request.uri().to_string(),
            "wss://api.openai.com/v1/realtime?model=gpt-realtime"
        );
        assert_eq!(
            request.headers().get(AUTHORIZATION).unwrap(),
            "Bearer ek_X"
        );
    }

    #[test]
    fn test_subprotocol_fallback_request_shape() {
        let request = build_request(
            "http://127.0.0.1:9000",
            "gpt-realtime",
            "ek_X",
            AuthStyle::Subprotocol,
        )
        .unwrap();
        assert!(request.uri().to_string().starts_with("ws://127.0.0.1:9000/"));
        assert_eq!(
            request.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
            "realtime, openai-insecure-api-key.ek_X"
        );
        assert!(request.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_classify_ga_and_legacy_aliases() {
        assert_eq!(classify("response.output_audio.delta"), ModelEventKind::AudioDelta);
        assert_eq!(classify("response.audio.delta"), ModelEventKind::AudioDelta);
        assert_eq!(
            classify("response.output_audio_transcript.delta"),
            ModelEventKind::AudioTranscriptDelta
        );
        assert_eq!(
            classify("response.audio_transcript.delta"),
            ModelEventKind::AudioTranscriptDelta
        );
        assert_eq!(classify("response.text.delta"), ModelEventKind::TextDelta);
        assert_eq!(classify("response.output_text.delta"), ModelEventKind::TextDelta);
        assert_eq!(
            classify("response.function_call_arguments.done"),
            ModelEventKind::FunctionCallArgumentsDone
        );
        assert_eq!(classify("something.new"), ModelEventKind::Other);
    }

    #[test]
    fn test_event_parse_and_item_id_fallback() {
        let flat: ModelEvent =
            serde_json::from_str(r#"{"type":"response.output_item.added","item_id":"it_9"}"#)
                .unwrap();
        assert_eq!(flat.assistant_item_id(), Some("it_9"));

        let nested: ModelEvent = serde_json::from_str(
            r#"{"type":"response.output_item.added","item":{"id":"it_10","role":"assistant"}}"#,
        )
        .unwrap();
        assert_eq!(nested.assistant_item_id(), Some("it_10"));
    }

    #[test]
    fn test_truncate_event_shape() {
        let event: Value = serde_json::from_str(&truncate_event("it_9", 620)).unwrap();
        assert_eq!(event["type"], "conversation.item.truncate");
        assert_eq!(event["item_id"], "it_9");
        assert_eq!(event["content_index"], 0);
        assert_eq!(event["audio_end_ms"], 620);
    }

    #[test]
    fn test_response_create_with_overrides() {
        let event: Value = serde_json::from_str(&response_create(Some(
            json!({ "voice": "marin", "output_audio_format": "g711_ulaw" }),
        )))
        .unwrap();
        assert_eq!(event["response"]["voice"], "marin");
        let bare: Value = serde_json::from_str(&response_create(None)).unwrap();
        assert!(bare.get("response").is_none());
    }
}
