//! End-to-end bridge tests against a fake model server:
//! - Happy-path relay (session.update codec forcing, media forwarding,
//!   paced egress frames)
//! - Barge-in truncation with the single-truncate guard
//! - Commit mark handling
//! - Credential and handshake failure close codes

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message as AxMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use callbridge::config::{
    Config, ControlConfig, DeployConfig, OpenAiConfig, RealtimeDefaults, TwilioConfig,
};
use callbridge::{router, AppState};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// =====================================================================
// FAKE MODEL SERVER
// =====================================================================

#[derive(Clone)]
struct ModelHub {
    incoming: mpsc::UnboundedSender<Value>,
    inject: broadcast::Sender<String>,
}

async fn model_ws(State(hub): State<ModelHub>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_model(socket, hub))
}

async fn run_model(mut socket: WebSocket, hub: ModelHub) {
    let mut inject_rx = hub.inject.subscribe();
    let created = json!({ "type": "session.created" }).to_string();
    let _ = socket.send(AxMessage::Text(created.into())).await;
    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(AxMessage::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        let _ = hub.incoming.send(value);
                    }
                }
                Some(Ok(AxMessage::Close(_))) | None => break,
                _ => {}
            },
            inject = inject_rx.recv() => match inject {
                Ok(text) => {
                    if socket.send(AxMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
        }
    }
}

async fn spawn_fake_model() -> (
    SocketAddr,
    mpsc::UnboundedReceiver<Value>,
    broadcast::Sender<String>,
) {
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let (inject_tx, _) = broadcast::channel(64);
    let hub = ModelHub {
        incoming: incoming_tx,
        inject: inject_tx.clone(),
    };
    let app = Router::new()
        .route("/v1/realtime", get(model_ws))
        .with_state(hub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, incoming_rx, inject_tx)
}

// =====================================================================
// BRIDGE HARNESS
// =====================================================================

fn bridge_config(model_addr: Option<SocketAddr>) -> Config {
    let api_base = match model_addr {
        Some(addr) => format!("http://{}", addr),
        // Unroutable: handshake must fail
        None => "http://127.0.0.1:1".to_string(),
    };
    Config {
        openai: OpenAiConfig {
            api_key: Some("sk-test".to_string()),
            org_id: None,
            project_id: None,
            api_base,
        },
        twilio: TwilioConfig {
            account_sid: None,
            auth_token: None,
            from_number: None,
            api_base: "http://127.0.0.1:1".to_string(),
        },
        realtime: RealtimeDefaults {
            model: "gpt-realtime".to_string(),
            voice: Some("marin".to_string()),
            modalities: None,
            temperature: None,
            max_output_tokens: None,
            turn_detection: None,
            vad_threshold: None,
            vad_prefix_ms: None,
            vad_silence_ms: None,
            vad_create_response: None,
            input_sample_rate: None,
            audio_format: None,
            transcription_enabled: false,
            transcription_model: None,
            transcription_language: None,
            transcription_prompt: None,
            noise_reduction: None,
            instructions: Some("You answer the phone.".to_string()),
            prompt_id: None,
            prompt_version: None,
            expiry_seconds: 600,
        },
        deploy: DeployConfig {
            public_base_url: None,
            external_bridge_wss_url: None,
            twiml_default_mode: None,
            sip_gateway_host: "sip.api.openai.com".to_string(),
        },
        control: ControlConfig {
            secret: None,
            signing_secret: None,
            admin_secret: None,
            tolerance_seconds: 300,
        },
    }
}

async fn spawn_bridge(config: Config) -> (SocketAddr, AppState) {
    let state = AppState::new(config);
    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

type CarrierSocket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect_carrier(addr: SocketAddr, path: &str) -> (CarrierSocket, Option<String>) {
    let mut request = format!("ws://{}{}", addr, path).into_client_request().unwrap();
    request.headers_mut().insert(
        "sec-websocket-protocol",
        "audio.twilio.com".parse().unwrap(),
    );
    let (socket, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    let echoed = response
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    (socket, echoed)
}

fn start_frame(overrides: Option<&Value>) -> String {
    let mut start = json!({ "callSid": "CA1" });
    if let Some(session) = overrides {
        let blob = BASE64.encode(session.to_string());
        start["customParameters"] = json!({ "session": blob });
    }
    json!({ "event": "start", "streamSid": "MZ1", "start": start }).to_string()
}

fn media_frame(payload: &[u8], timestamp: u64) -> String {
    json!({
        "event": "media",
        "media": {
            "payload": BASE64.encode(payload),
            "timestamp": timestamp.to_string(),
        },
    })
    .to_string()
}

async fn next_model_event(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for model event")
        .expect("model channel closed")
}

async fn next_carrier_json(socket: &mut CarrierSocket) -> Value {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for carrier message")
            .expect("carrier socket ended")
            .expect("carrier socket error");
        match msg {
            WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected carrier message: {:?}", other),
        }
    }
}

// =====================================================================
// SCENARIOS
// =====================================================================

#[tokio::test]
async fn test_happy_path_relay() {
    let (model_addr, mut model_rx, inject) = spawn_fake_model().await;
    let (bridge_addr, _state) = spawn_bridge(bridge_config(Some(model_addr))).await;

    let (mut carrier, echoed) = connect_carrier(bridge_addr, "/stream/twilio/ek_test").await;
    assert_eq!(echoed.as_deref(), Some("audio.twilio.com"));

    let overrides = json!({ "voice": "cedar", "output_audio_format": "pcm16" });
    carrier
        .send(WsMessage::Text(start_frame(Some(&overrides)).into()))
        .await
        .unwrap();

    // The first thing the model sees is session.update with the telephony
    // codec forced on both directions, carrier overrides applied
    let update = next_model_event(&mut model_rx).await;
    assert_eq!(update["type"], "session.update");
    assert_eq!(update["session"]["type"], "realtime");
    assert_eq!(update["session"]["input_audio_format"], "g711_ulaw");
    assert_eq!(update["session"]["output_audio_format"], "g711_ulaw");
    assert_eq!(update["session"]["voice"], "cedar");

    // Caller audio flows to the model verbatim
    let ulaw = vec![0x7Fu8; 160];
    carrier
        .send(WsMessage::Text(media_frame(&ulaw, 1000).into()))
        .await
        .unwrap();
    let append = next_model_event(&mut model_rx).await;
    assert_eq!(append["type"], "input_audio_buffer.append");
    assert_eq!(append["audio"], BASE64.encode(&ulaw));

    // A 480-byte burst leaves as three paced 160-byte frames
    inject
        .send(json!({ "type": "response.created" }).to_string())
        .unwrap();
    let burst = vec![0x42u8; 480];
    inject
        .send(
            json!({
                "type": "response.output_audio.delta",
                "item_id": "it_9",
                "delta": BASE64.encode(&burst),
            })
            .to_string(),
        )
        .unwrap();

    let mut media_frames = Vec::new();
    let mut saw_mark = false;
    while media_frames.len() < 3 {
        let msg = next_carrier_json(&mut carrier).await;
        match msg["event"].as_str().unwrap() {
            "media" => {
                assert_eq!(msg["streamSid"], "MZ1");
                let bytes = BASE64
                    .decode(msg["media"]["payload"].as_str().unwrap())
                    .unwrap();
                assert_eq!(bytes.len(), 160);
                media_frames.push(bytes);
            }
            "mark" => saw_mark = true,
            other => panic!("unexpected carrier event {}", other),
        }
    }
    assert!(saw_mark, "no synchronization mark sent");
    let joined: Vec<u8> = media_frames.concat();
    assert_eq!(joined, burst);

    carrier
        .send(WsMessage::Text(json!({ "event": "stop" }).to_string().into()))
        .await
        .unwrap();
    // The bridge closes both sides
    loop {
        match tokio::time::timeout(RECV_TIMEOUT, carrier.next())
            .await
            .expect("timed out waiting for close")
        {
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(_)) => break,
        }
    }
}

#[tokio::test]
async fn test_barge_in_truncates_once() {
    let (model_addr, mut model_rx, inject) = spawn_fake_model().await;
    let (bridge_addr, _state) = spawn_bridge(bridge_config(Some(model_addr))).await;

    let (mut carrier, _) = connect_carrier(bridge_addr, "/stream/twilio/ek_test").await;
    carrier
        .send(WsMessage::Text(start_frame(None).into()))
        .await
        .unwrap();
    let update = next_model_event(&mut model_rx).await;
    assert_eq!(update["type"], "session.update");

    // Assistant audio starts while the latest caller media is at 1000 ms
    carrier
        .send(WsMessage::Text(media_frame(&[0u8; 160], 1000).into()))
        .await
        .unwrap();
    assert_eq!(
        next_model_event(&mut model_rx).await["type"],
        "input_audio_buffer.append"
    );

    inject
        .send(json!({ "type": "response.created" }).to_string())
        .unwrap();
    inject
        .send(
            json!({
                "type": "response.output_audio.delta",
                "item_id": "it_9",
                "delta": BASE64.encode([0x11u8; 160]),
            })
            .to_string(),
        )
        .unwrap();

    // The synchronization mark confirms the delta was processed, so the
    // playback origin is latched at 1000 ms before more caller media lands
    loop {
        let msg = next_carrier_json(&mut carrier).await;
        if msg["event"] == "mark" {
            break;
        }
    }

    // The caller hears 620 ms of it, then starts talking
    carrier
        .send(WsMessage::Text(media_frame(&[0u8; 160], 1620).into()))
        .await
        .unwrap();
    assert_eq!(
        next_model_event(&mut model_rx).await["type"],
        "input_audio_buffer.append"
    );

    inject
        .send(json!({ "type": "input_audio_buffer.speech_started" }).to_string())
        .unwrap();

    let truncate = next_model_event(&mut model_rx).await;
    assert_eq!(truncate["type"], "conversation.item.truncate");
    assert_eq!(truncate["item_id"], "it_9");
    assert_eq!(truncate["content_index"], 0);
    assert_eq!(truncate["audio_end_ms"], 620);

    // The carrier is told to flush its playback buffer
    loop {
        let msg = next_carrier_json(&mut carrier).await;
        if msg["event"] == "clear" {
            assert_eq!(msg["streamSid"], "MZ1");
            break;
        }
    }

    // A second speech_started in the same response must not truncate again
    inject
        .send(json!({ "type": "input_audio_buffer.speech_started" }).to_string())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = model_rx.try_recv() {
        assert_ne!(event["type"], "conversation.item.truncate");
    }
}

#[tokio::test]
async fn test_commit_mark_requests_response() {
    let (model_addr, mut model_rx, _inject) = spawn_fake_model().await;
    let (bridge_addr, _state) = spawn_bridge(bridge_config(Some(model_addr))).await;

    let (mut carrier, _) = connect_carrier(bridge_addr, "/stream/twilio/ek_test").await;
    carrier
        .send(WsMessage::Text(start_frame(None).into()))
        .await
        .unwrap();
    assert_eq!(next_model_event(&mut model_rx).await["type"], "session.update");

    carrier
        .send(WsMessage::Text(
            json!({ "event": "mark", "mark": { "name": "commit" } })
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

    assert_eq!(
        next_model_event(&mut model_rx).await["type"],
        "input_audio_buffer.commit"
    );
    let create = next_model_event(&mut model_rx).await;
    assert_eq!(create["type"], "response.create");
    assert_eq!(create["response"]["output_audio_format"], "g711_ulaw");
    assert_eq!(create["response"]["voice"], "marin");
}

#[tokio::test]
async fn test_transcript_deltas_reach_the_store() {
    let (model_addr, mut model_rx, inject) = spawn_fake_model().await;
    let (bridge_addr, state) = spawn_bridge(bridge_config(Some(model_addr))).await;

    let (mut carrier, _) = connect_carrier(bridge_addr, "/stream/twilio/ek_test").await;
    carrier
        .send(WsMessage::Text(start_frame(None).into()))
        .await
        .unwrap();
    assert_eq!(next_model_event(&mut model_rx).await["type"], "session.update");

    inject
        .send(
            json!({ "type": "response.output_audio_transcript.delta", "delta": "Hello " })
                .to_string(),
        )
        .unwrap();
    // Legacy alias lands in the same place
    inject
        .send(json!({ "type": "response.audio_transcript.delta", "delta": "there." }).to_string())
        .unwrap();

    // Keyed by callSid
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let (entries, _) = state.transcripts.range("CA1", 0);
        if entries.len() >= 2 {
            assert_eq!(entries[0].text, "Hello ");
            assert_eq!(entries[1].text, "there.");
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "transcript never arrived");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_missing_credential_closes_policy_violation() {
    let (model_addr, _model_rx, _inject) = spawn_fake_model().await;
    let (bridge_addr, _state) = spawn_bridge(bridge_config(Some(model_addr))).await;

    let (mut carrier, _) = connect_carrier(bridge_addr, "/stream/twilio").await;
    match tokio::time::timeout(RECV_TIMEOUT, carrier.next())
        .await
        .expect("timed out")
    {
        Some(Ok(WsMessage::Close(Some(frame)))) => {
            assert_eq!(frame.code, CloseCode::Policy);
        }
        other => panic!("expected policy-violation close, got {:?}", other),
    }
}

#[tokio::test]
async fn test_credential_in_query_accepted() {
    let (model_addr, mut model_rx, _inject) = spawn_fake_model().await;
    let (bridge_addr, _state) = spawn_bridge(bridge_config(Some(model_addr))).await;

    let (mut carrier, _) = connect_carrier(bridge_addr, "/stream/twilio?secret=ek_q").await;
    carrier
        .send(WsMessage::Text(start_frame(None).into()))
        .await
        .unwrap();
    assert_eq!(next_model_event(&mut model_rx).await["type"], "session.update");
}

#[tokio::test]
async fn test_runtime_overrides_reach_new_calls() {
    let (model_addr, mut model_rx, _inject) = spawn_fake_model().await;
    let (bridge_addr, state) = spawn_bridge(bridge_config(Some(model_addr))).await;

    // An operator changes the voice mid-deployment
    state.control.set_overrides(Some(callbridge::SessionConfig {
        voice: Some("cedar".to_string()),
        ..Default::default()
    }));

    let (mut carrier, _) = connect_carrier(bridge_addr, "/stream/twilio/ek_test").await;
    carrier
        .send(WsMessage::Text(start_frame(None).into()))
        .await
        .unwrap();

    let update = next_model_event(&mut model_rx).await;
    assert_eq!(update["type"], "session.update");
    assert_eq!(update["session"]["voice"], "cedar");
    // Defaults still fill the rest
    assert_eq!(update["session"]["model"], "gpt-realtime");
}

#[tokio::test]
async fn test_model_handshake_failure_closes_server_error() {
    let (bridge_addr, _state) = spawn_bridge(bridge_config(None)).await;

    let (mut carrier, _) = connect_carrier(bridge_addr, "/stream/twilio/ek_test").await;
    carrier
        .send(WsMessage::Text(start_frame(None).into()))
        .await
        .unwrap();

    loop {
        match tokio::time::timeout(Duration::from_secs(20), carrier.next())
            .await
            .expect("timed out waiting for close")
        {
            Some(Ok(WsMessage::Close(Some(frame)))) => {
                assert_eq!(frame.code, CloseCode::Error);
                break;
            }
            Some(Ok(_)) => continue,
            other => panic!("expected server-error close, got {:?}", other),
        }
    }
}
