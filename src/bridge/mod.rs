//! Per-call bridge between the carrier media stream and the model socket
//!
//! One bridge per carrier connection. The bridge owns both sockets, the
//! egress frame pacer and the heartbeat; closure of either socket cascades
//! through a single closing transition.

pub mod frames;
pub mod model;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::carrier::{self, CarrierEvent};
use crate::server::AppState;
use crate::session::{SessionConfig, G711_ULAW};
use crate::transcript::EntryKind;
use frames::FrameBuffer;
use model::{AuthStyle, ModelEventKind};

/// Ping cadence on both sockets; keeps intermediate proxies from dropping
/// idle connections during long silences
const HEARTBEAT_SECS: u64 = 25;

/// WebSocket close codes
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_POLICY: u16 = 1008;
const CLOSE_SERVER_ERROR: u16 = 1011;

/// Carrier custom parameter carrying base64-encoded session overrides
const OVERRIDES_PARAMETER: &str = "session";

/// Carrier mark name that commits the input buffer and requests a response
const COMMIT_MARK: &str = "commit";

/// Session fields a carrier-provided override blob may set
const OVERRIDE_ALLOW_LIST: [&str; 12] = [
    "instructions",
    "prompt",
    "input_audio_transcription",
    "turn_detection",
    "tools",
    "tool_choice",
    "temperature",
    "max_response_output_tokens",
    "voice",
    "input_audio_format",
    "output_audio_format",
    "modalities",
];

#[derive(Debug, Deserialize)]
pub struct BridgeQuery {
    #[serde(default)]
    secret: Option<String>,
}

type UpgradeAttempt =
    Result<WebSocketUpgrade, axum::extract::ws::rejection::WebSocketUpgradeRejection>;

/// Upgrade handler for `GET /stream/twilio/{token}`
pub async fn ws_handler_path(
    Path(token): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
    ws: UpgradeAttempt,
) -> Response {
    match ws {
        Ok(ws) => upgrade(ws, headers, Some(token), state),
        Err(_) => upgrade_required(),
    }
}

/// Upgrade handler for `GET /stream/twilio` (credential in query or form)
pub async fn ws_handler_query(
    Query(query): Query<BridgeQuery>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
    State(state): State<AppState>,
    ws: UpgradeAttempt,
) -> Response {
    let Ok(ws) = ws else {
        return upgrade_required();
    };
    let token = query.secret.or_else(|| form_fallback_token(raw.as_deref()));
    upgrade(ws, headers, token, state)
}

/// Plain HTTP on the stream endpoint is a client error
fn upgrade_required() -> Response {
    (StatusCode::UPGRADE_REQUIRED, "WebSocket upgrade required").into_response()
}

/// Try the form-encoded fallback: some carriers move query parameters into
/// a form-style blob. Accepts `secret` or `token` keys.
fn form_fallback_token(raw_query: Option<&str>) -> Option<String> {
    let raw = raw_query?;
    url::form_urlencoded::parse(raw.as_bytes())
        .find(|(key, _)| key == "secret" || key == "token")
        .map(|(_, value)| value.into_owned())
}

fn upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    token: Option<String>,
    state: AppState,
) -> Response {
    // Echo the first subprotocol the carrier advertises
    let offered = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());

    let upgrade = match offered {
        Some(proto) => ws.protocols([proto]),
        None => ws,
    };
    upgrade.on_upgrade(move |socket| handle_socket(socket, token, state))
}

async fn handle_socket(mut socket: WebSocket, token: Option<String>, state: AppState) {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        // No credential in path, query or form: refuse before processing
        // any carrier frame
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_POLICY,
                reason: "missing credential".into(),
            })))
            .await;
        return;
    };

    if let Err(e) = run_call(socket, token, state).await {
        error!("Bridge terminated: {:#}", e);
    }
}

/// Per-call mutable state; lives for the carrier WebSocket lifetime
struct CallSession {
    stream_sid: String,
    call_sid: String,
    last_assistant_item: Option<String>,
    response_start_ts_ms: Option<u64>,
    latest_media_ts_ms: Option<u64>,
    response_active: bool,
    interrupted_this_turn: bool,
    overrides: SessionConfig,
    mark_counter: u64,
}

impl CallSession {
    fn new(stream_sid: String, call_sid: String, overrides: SessionConfig) -> Self {
        Self {
            stream_sid,
            call_sid,
            last_assistant_item: None,
            response_start_ts_ms: None,
            latest_media_ts_ms: None,
            response_active: false,
            interrupted_this_turn: false,
            overrides,
            mark_counter: 0,
        }
    }

    /// Transcript key: call id when known, stream id otherwise
    fn transcript_key(&self) -> &str {
        if self.call_sid.is_empty() {
            &self.stream_sid
        } else {
            &self.call_sid
        }
    }

    fn next_mark(&mut self) -> String {
        self.mark_counter += 1;
        format!("delta-{}", self.mark_counter)
    }
}

/// Decide whether a `speech_started` warrants a truncate, and reset the
/// per-response state either way. Returns the item id and the audio-end
/// offset: the milliseconds of assistant speech the caller actually heard.
fn barge_in_truncation(session: &mut CallSession) -> Option<(String, u64)> {
    let decision = if session.response_active && !session.interrupted_this_turn {
        session.last_assistant_item.take().map(|item| {
            session.interrupted_this_turn = true;
            let end = session
                .latest_media_ts_ms
                .unwrap_or(0)
                .saturating_sub(session.response_start_ts_ms.unwrap_or(0));
            (item, end)
        })
    } else {
        None
    };
    session.last_assistant_item = None;
    session.response_start_ts_ms = None;
    decision
}

/// Filter a carrier-provided override blob to the allowed session fields.
///
/// The blob is untrusted and the upstream rejects unknown fields, so
/// everything outside the allow-list is dropped.
fn filter_overrides(raw: &Value) -> SessionConfig {
    let mut filtered = serde_json::Map::new();
    if let Some(obj) = raw.as_object() {
        for key in OVERRIDE_ALLOW_LIST {
            if let Some(value) = obj.get(key) {
                if !value.is_null() {
                    filtered.insert(key.to_string(), value.clone());
                }
            }
        }
    }
    match serde_json::from_value(Value::Object(filtered)) {
        Ok(config) => config,
        Err(e) => {
            warn!("Discarding malformed session overrides: {}", e);
            SessionConfig::default()
        }
    }
}

/// Decode the base64 JSON override parameter from the carrier start frame
fn decode_override_parameter(custom_parameters: Option<&Value>) -> SessionConfig {
    let Some(encoded) = custom_parameters
        .and_then(|p| p.get(OVERRIDES_PARAMETER))
        .and_then(Value::as_str)
    else {
        return SessionConfig::default();
    };
    let Ok(decoded) = BASE64.decode(encoded) else {
        warn!("Override parameter is not valid base64");
        return SessionConfig::default();
    };
    match serde_json::from_slice::<Value>(&decoded) {
        Ok(raw) => filter_overrides(&raw),
        Err(e) => {
            warn!("Override parameter is not valid JSON: {}", e);
            SessionConfig::default()
        }
    }
}

/// Build the `session.update` sent once the model session exists: carrier
/// overrides first, control-plane fill, telephony codec forced last.
fn build_session_update(overrides: &SessionConfig, control_current: &SessionConfig) -> Value {
    let mut session = overrides.clone();
    session.merge_missing_from(control_current);
    session.force_telephony_audio();
    session.to_update_event()
}

/// Per-turn `response.create` overrides: voice and temperature follow the
/// session, output audio stays μ-law
fn response_overrides(overrides: &SessionConfig, control_current: &SessionConfig) -> Value {
    let effective = {
        let mut s = overrides.clone();
        s.merge_missing_from(control_current);
        s
    };
    let mut response = serde_json::Map::new();
    response.insert("output_audio_format".to_string(), json!(G711_ULAW));
    if let Some(voice) = &effective.voice {
        response.insert("voice".to_string(), json!(voice));
    }
    if let Some(temperature) = effective.temperature {
        response.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(max) = &effective.max_response_output_tokens {
        response.insert(
            "max_output_tokens".to_string(),
            serde_json::to_value(max).unwrap_or(Value::Null),
        );
    }
    Value::Object(response)
}

async fn run_call(socket: WebSocket, token: String, state: AppState) -> anyhow::Result<()> {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Outbound writer toward the carrier; everything the bridge sends
    // funnels through this channel so ordering is preserved
    let (carrier_tx, mut carrier_rx) = mpsc::channel::<Message>(256);
    let writer = tokio::spawn(async move {
        while let Some(msg) = carrier_rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let close_carrier = |code: u16, reason: &'static str| {
        let tx = carrier_tx.clone();
        async move {
            let _ = tx
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
        }
    };

    // AwaitingStart: nothing is bridged until the carrier names the stream
    let (stream_sid, call_sid, custom_parameters) = loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<CarrierEvent>(&text) {
                Ok(CarrierEvent::Start { stream_sid, start }) => {
                    break (stream_sid, start.call_sid, start.custom_parameters);
                }
                Ok(CarrierEvent::Connected { .. }) => continue,
                Ok(CarrierEvent::Stop { .. }) => {
                    writer.abort();
                    return Ok(());
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!("Dropping malformed pre-start frame: {}", e);
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => {
                writer.abort();
                return Ok(());
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                writer.abort();
                return Err(e.into());
            }
        }
    };

    let bridge_id = uuid::Uuid::new_v4();
    info!(%bridge_id, stream_sid = %stream_sid, call_sid = %call_sid, "Media stream started");
    let overrides = decode_override_parameter(custom_parameters.as_ref());
    let mut session = CallSession::new(stream_sid.clone(), call_sid, overrides);

    // Egress pacer: frames leave as carrier media messages
    let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(64);
    let frame_buffer = FrameBuffer::new(frame_tx);
    let frame_writer = {
        let carrier_tx = carrier_tx.clone();
        let stream_sid = stream_sid.clone();
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let payload = BASE64.encode(&frame);
                let msg = carrier::media_message(&stream_sid, &payload);
                if carrier_tx.send(Message::Text(msg.into())).await.is_err() {
                    break;
                }
            }
        })
    };

    // Connecting: open the model socket with the per-call credential
    let model_socket = match model::connect(
        &state.config.openai.api_base,
        &state.control.current().model.unwrap_or_default(),
        &token,
        AuthStyle::Bearer,
    )
    .await
    {
        Ok(socket) => socket,
        Err(e) => {
            error!(stream_sid = %stream_sid, "Model handshake failed: {:#}", e);
            frame_buffer.shutdown();
            close_carrier(CLOSE_SERVER_ERROR, "model unavailable").await;
            let _ = writer.await;
            frame_writer.abort();
            return Ok(());
        }
    };
    let (mut model_tx_half, mut model_rx_half) = model_socket.split();

    // Model writer task, same funnel pattern as the carrier side
    let (model_tx, mut model_rx) = mpsc::channel::<WsMessage>(256);
    let model_writer = tokio::spawn(async move {
        while let Some(msg) = model_rx.recv().await {
            let closing = matches!(msg, WsMessage::Close(_));
            if model_tx_half.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let mut session_ready = false;
    let mut heartbeat = tokio::time::interval(std::time::Duration::from_secs(HEARTBEAT_SECS));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.reset();

    // Active relay: one sequential loop per call, no reordering within
    // either direction
    let close_code: u16 = loop {
        tokio::select! {
            carrier_msg = ws_rx.next() => {
                match carrier_msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<CarrierEvent>(&text) {
                            Ok(event) => {
                                if handle_carrier_event(
                                    event,
                                    &mut session,
                                    session_ready,
                                    &model_tx,
                                    &state,
                                ).await {
                                    break CLOSE_NORMAL;
                                }
                            }
                            Err(e) => {
                                // One bad frame never ends the call
                                debug!("Dropping malformed carrier frame: {}", e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break CLOSE_NORMAL,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Carrier socket error: {}", e);
                        break CLOSE_NORMAL;
                    }
                }
            }
            model_msg = model_rx_half.next() => {
                match model_msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<model::ModelEvent>(&text) {
                            Ok(event) => {
                                session_ready |= handle_model_event(
                                    event,
                                    &mut session,
                                    &frame_buffer,
                                    &carrier_tx,
                                    &model_tx,
                                    &state,
                                ).await;
                            }
                            Err(e) => debug!("Dropping malformed model event: {}", e),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!(stream_sid = %session.stream_sid, "Model socket closed");
                        break CLOSE_NORMAL;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Model socket error: {}", e);
                        break CLOSE_SERVER_ERROR;
                    }
                }
            }
            _ = heartbeat.tick() => {
                let _ = carrier_tx.send(Message::Ping(Vec::<u8>::new().into())).await;
                let _ = model_tx.send(WsMessage::Ping(Vec::<u8>::new().into())).await;
            }
        }
    };

    // Closing: one atomic transition tears everything down
    info!(%bridge_id, stream_sid = %session.stream_sid, call_sid = %session.call_sid, "Bridge closing");
    frame_buffer.shutdown();
    let _ = model_tx.send(WsMessage::Close(None)).await;
    close_carrier(close_code, "bridge closed").await;
    let _ = writer.await;
    let _ = model_writer.await;
    frame_writer.abort();
    Ok(())
}

/// React to one carrier event. Returns true when the call should close.
async fn handle_carrier_event(
    event: CarrierEvent,
    session: &mut CallSession,
    session_ready: bool,
    model_tx: &mpsc::Sender<WsMessage>,
    state: &AppState,
) -> bool {
    match event {
        CarrierEvent::Media { media } => {
            if let Some(ts) = media.timestamp.as_deref().and_then(|t| t.parse::<u64>().ok()) {
                session.latest_media_ts_ms = Some(ts);
            }
            // The carrier is not paced by us and arbitrary buffering is
            // not an option: frames before the session exists are dropped
            if session_ready {
                let append = model::input_audio_append(&media.payload);
                let _ = model_tx.send(WsMessage::Text(append.into())).await;
            }
        }
        CarrierEvent::Mark { mark } if mark.name == COMMIT_MARK => {
            if session_ready {
                let _ = model_tx
                    .send(WsMessage::Text(model::input_audio_commit().into()))
                    .await;
                let overrides = response_overrides(&session.overrides, &state.control.current());
                let _ = model_tx
                    .send(WsMessage::Text(model::response_create(Some(overrides)).into()))
                    .await;
            }
        }
        CarrierEvent::Mark { mark } => {
            debug!(name = %mark.name, "Carrier mark");
        }
        CarrierEvent::Stop { .. } => {
            info!(stream_sid = %session.stream_sid, "Carrier stop");
            return true;
        }
        CarrierEvent::Connected { .. } | CarrierEvent::Start { .. } => {}
    }
    false
}

/// React to one model event. Returns true once the session exists and the
/// initial `session.update` has been queued.
async fn handle_model_event(
    event: model::ModelEvent,
    session: &mut CallSession,
    frame_buffer: &FrameBuffer,
    carrier_tx: &mpsc::Sender<Message>,
    model_tx: &mpsc::Sender<WsMessage>,
    state: &AppState,
) -> bool {
    match event.kind() {
        ModelEventKind::SessionCreated => {
            let update = build_session_update(&session.overrides, &state.control.current());
            let _ = model_tx
                .send(WsMessage::Text(update.to_string().into()))
                .await;
            info!(stream_sid = %session.stream_sid, "Session configured");
            return true;
        }
        ModelEventKind::SessionUpdated => {
            debug!("Session updated");
        }
        ModelEventKind::ResponseCreated => {
            session.response_active = true;
            session.interrupted_this_turn = false;
        }
        ModelEventKind::OutputItemAdded | ModelEventKind::OutputItemDone => {
            if let Some(id) = event.assistant_item_id() {
                session.last_assistant_item = Some(id.to_string());
            }
        }
        ModelEventKind::AudioDelta => {
            if let Some(delta) = &event.delta {
                // First delta of the response latches the playback origin
                // for barge-in math
                if session.response_start_ts_ms.is_none() {
                    session.response_start_ts_ms = session.latest_media_ts_ms;
                }
                if let Some(id) = event.assistant_item_id() {
                    session.last_assistant_item = Some(id.to_string());
                }
                match BASE64.decode(delta) {
                    Ok(bytes) => frame_buffer.enqueue(&bytes),
                    Err(e) => warn!("Audio delta is not valid base64: {}", e),
                }
                let next_mark = session.next_mark();
                let mark = carrier::mark_message(&session.stream_sid, &next_mark);
                let _ = carrier_tx.send(Message::Text(mark.into())).await;
            }
        }
        ModelEventKind::AudioTranscriptDelta => {
            if let Some(delta) = &event.delta {
                state.transcripts.append(
                    session.transcript_key(),
                    EntryKind::AudioTranscriptDelta,
                    delta.as_str(),
                );
            }
        }
        ModelEventKind::TextDelta => {
            if let Some(delta) = &event.delta {
                state
                    .transcripts
                    .append(session.transcript_key(), EntryKind::TextDelta, delta.as_str());
            }
        }
        ModelEventKind::AudioDone | ModelEventKind::AudioTranscriptDone | ModelEventKind::TextDone => {}
        ModelEventKind::FunctionCallArgumentsDelta => {}
        ModelEventKind::FunctionCallArgumentsDone => {
            debug!(item_id = ?event.item_id, "Function call arguments complete");
        }
        ModelEventKind::ResponseDone | ModelEventKind::ResponseCancelled => {
            session.response_active = false;
            session.interrupted_this_turn = false;
            session.last_assistant_item = None;
            session.response_start_ts_ms = None;
        }
        ModelEventKind::SpeechStarted => {
            // Barge-in: stop our playback, drop the carrier's buffer, then
            // tell the model where the caller stopped hearing us
            frame_buffer.clear();
            let clear = carrier::clear_message(&session.stream_sid);
            let _ = carrier_tx.send(Message::Text(clear.into())).await;
            if let Some((item_id, audio_end_ms)) = barge_in_truncation(session) {
                info!(item_id = %item_id, audio_end_ms, "Truncating interrupted response");
                let truncate = model::truncate_event(&item_id, audio_end_ms);
                let _ = model_tx.send(WsMessage::Text(truncate.into())).await;
            }
        }
        ModelEventKind::SpeechStopped | ModelEventKind::InputCommitted | ModelEventKind::InputCleared => {}
        ModelEventKind::TranscriptionCompleted => {
            if let Some(transcript) = &event.transcript {
                debug!(transcript = %transcript, "Caller transcription");
            }
        }
        ModelEventKind::TranscriptionFailed => {
            warn!("Caller transcription failed");
        }
        ModelEventKind::RateLimitsUpdated => {
            debug!("Rate limits updated");
        }
        ModelEventKind::Error => {
            // Mid-call model errors are logged; the connection stays open
            warn!(error = ?event.error, "Model error event");
        }
        ModelEventKind::Other => {
            debug!(event_type = %event.event_type, "Unhandled model event");
        }
    }
    false
}
