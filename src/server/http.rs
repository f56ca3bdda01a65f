//! HTTP endpoint handlers
//!
//! Control documents, credential minting, outbound calls and diagnostics.

use axum::extract::{OriginalUri, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::AppState;
use crate::carrier::{PlaceCall, PlaceCallError};
use crate::token::{MintError, MintRequest};
use crate::twiml::{self, DocumentQuery, Mode};

/// Credential lifetime bounds for explicit mint requests
const MIN_EXPIRY_SECONDS: u64 = 60;
const MAX_EXPIRY_SECONDS: u64 = 3600;

const CARRIER_SIGNATURE_HEADER: &str = "x-twilio-signature";

fn xml_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
        body,
    )
        .into_response()
}

/// Reconstruct the URL the carrier signed: public origin plus the original
/// path and query
fn signed_url(state: &AppState, headers: &HeaderMap, uri: &OriginalUri) -> String {
    let origin = state
        .config
        .deploy
        .public_base_url
        .clone()
        .or_else(|| {
            headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(|host| format!("https://{}", host))
        })
        .unwrap_or_default();
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or(uri.path());
    format!("{}{}", origin.trim_end_matches('/'), path_and_query)
}

/// Verify the carrier signature when both the header and the shared token
/// are present. Absent either, the request passes.
fn carrier_signature_ok(
    state: &AppState,
    headers: &HeaderMap,
    uri: &OriginalUri,
    form_params: &[(String, String)],
) -> bool {
    let Some(signature) = headers
        .get(CARRIER_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        return true;
    };
    let Some(auth_token) = state.config.twilio.auth_token.as_deref() else {
        return true;
    };
    let url = signed_url(state, headers, uri);
    twiml::verify_carrier_signature(auth_token, &url, form_params, signature)
}

fn parse_form(body: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(body.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Mint a credential for a control document using the request's overrides,
/// falling back to the control-plane session
async fn mint_for_document(state: &AppState, query: &DocumentQuery) -> Result<String, MintError> {
    let api_key = match state.config.require_api_key() {
        Ok(k) => k.to_string(),
        Err(_) => {
            return Err(MintError::Upstream {
                status: 500,
                body: json!({ "error": "OPENAI_API_KEY is not set" }),
            })
        }
    };

    let current = state.control.current();
    let model = query
        .model
        .clone()
        .or(current.model.clone())
        .unwrap_or_default();

    let mut session = json!({ "type": "realtime", "model": model });
    if let Some(id) = query.prompt_id.clone().or_else(|| {
        current.prompt.as_ref().map(|p| p.id.clone())
    }) {
        let mut prompt = json!({ "id": id });
        if let Some(version) = query
            .prompt_version
            .clone()
            .or_else(|| current.prompt.as_ref().and_then(|p| p.version.clone()))
        {
            prompt["version"] = json!(version);
        }
        session["prompt"] = prompt;
    } else {
        let instructions = query
            .instructions
            .clone()
            .or(current.instructions.clone())
            .unwrap_or_else(|| "You are a helpful voice assistant.".to_string());
        session["instructions"] = json!(instructions);
    }

    let request = MintRequest {
        expires_after_seconds: state.config.realtime.expiry_seconds,
        session,
        webhook: None,
    };
    state
        .minter
        .mint(&api_key, &request)
        .await
        .map(|credential| credential.value)
}

/// Build the response document for stream mode
fn stream_response(state: &AppState, token: &str, in_query: bool) -> Response {
    match twiml::bridge_stream_url(&state.config.deploy, token, in_query) {
        Some(url) => xml_response(StatusCode::OK, twiml::stream_document(&url)),
        None => {
            error!("No public or external bridge URL configured for stream mode");
            xml_response(StatusCode::OK, twiml::unavailable_document())
        }
    }
}

/// `GET|POST /twiml`: the control document the carrier fetches on call
/// setup
pub async fn twiml_handler(
    State(state): State<AppState>,
    Query(query): Query<DocumentQuery>,
    uri: OriginalUri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let form_params = parse_form(&body);
    if !carrier_signature_ok(&state, &headers, &uri, &form_params) {
        warn!("Carrier signature verification failed");
        return xml_response(StatusCode::FORBIDDEN, twiml::forbidden_document());
    }

    let mode = Mode::resolve(query.mode.as_deref(), &state.config.deploy);
    info!(?mode, "Serving control document");

    if mode == Mode::Simple {
        return xml_response(
            StatusCode::OK,
            twiml::simple_document("The voice assistant is online. Goodbye."),
        );
    }

    // Fail closed: a failed mint never leaks a bridge URL
    let token = match &query.token {
        Some(token) => token.clone(),
        None => match mint_for_document(&state, &query).await {
            Ok(token) => token,
            Err(e) => {
                error!("Credential mint failed: {}", e);
                return xml_response(StatusCode::OK, twiml::unavailable_document());
            }
        },
    };

    match mode {
        Mode::Stream => stream_response(&state, &token, query.secret_in_query.unwrap_or(false)),
        Mode::Sip => {
            let action_url = state
                .config
                .deploy
                .public_base_url
                .as_deref()
                .map(|base| format!("{}/twiml/action", base.trim_end_matches('/')));
            xml_response(
                StatusCode::OK,
                twiml::sip_document(
                    &token,
                    &state.config.deploy.sip_gateway_host,
                    query.scheme.as_deref(),
                    query.transport.as_deref(),
                    query.port,
                    action_url.as_deref(),
                ),
            )
        }
        Mode::Simple => unreachable!("handled above"),
    }
}

/// `POST /twiml/action`: post-dial continuation. A failed SIP leg falls
/// back to stream mode; anything else hangs up.
pub async fn twiml_action_handler(
    State(state): State<AppState>,
    Query(query): Query<DocumentQuery>,
    uri: OriginalUri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let form_params = parse_form(&body);
    if !carrier_signature_ok(&state, &headers, &uri, &form_params) {
        warn!("Carrier signature verification failed on action callback");
        return xml_response(StatusCode::FORBIDDEN, twiml::forbidden_document());
    }

    let dial_status = form_params
        .iter()
        .find(|(k, _)| k == "DialCallStatus")
        .map(|(_, v)| v.as_str())
        .unwrap_or_default();

    match dial_status {
        "failed" | "busy" | "no-answer" => {
            info!(dial_status, "SIP leg failed, falling back to stream");
            match mint_for_document(&state, &query).await {
                Ok(token) => stream_response(&state, &token, false),
                Err(e) => {
                    error!("Fallback mint failed: {}", e);
                    xml_response(StatusCode::OK, twiml::unavailable_document())
                }
            }
        }
        _ => xml_response(StatusCode::OK, twiml::hangup_document()),
    }
}

/// `POST /realtime-token`: mint an ephemeral credential
pub async fn mint_handler(
    State(state): State<AppState>,
    Json(mut request): Json<MintRequest>,
) -> Response {
    if request.expires_after_seconds == 0 {
        request.expires_after_seconds = state.config.realtime.expiry_seconds;
    }
    if !(MIN_EXPIRY_SECONDS..=MAX_EXPIRY_SECONDS).contains(&request.expires_after_seconds) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "expires_after_seconds must be within [60, 3600]",
                "got": request.expires_after_seconds,
            })),
        )
            .into_response();
    }
    if request.session.is_null() {
        request.session = serde_json::to_value(state.control.current()).unwrap_or_default();
    }

    let api_key = match state.config.require_api_key() {
        Ok(k) => k.to_string(),
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    match state.minter.mint(&api_key, &request).await {
        Ok(credential) => Json(json!({
            "value": credential.value,
            "expires_at": credential.expires_at,
        }))
        .into_response(),
        Err(MintError::Upstream { status, body }) => {
            // Forward upstream client errors verbatim; everything else is
            // a gateway failure
            let code = if (400..500).contains(&status) {
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY)
            } else {
                StatusCode::BAD_GATEWAY
            };
            (code, Json(body)).into_response()
        }
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// `POST /calls`: place an outbound call toward the control document
pub async fn place_call_handler(
    State(state): State<AppState>,
    Json(mut request): Json<PlaceCall>,
) -> Response {
    let base = state
        .config
        .deploy
        .public_base_url
        .as_deref()
        .map(|base| base.trim_end_matches('/').to_string());
    let default_url = base
        .as_deref()
        .map(|base| format!("{}/twiml", base))
        .unwrap_or_default();
    // Subscribe to lifecycle events unless the caller brought a receiver
    if request.status_callback.is_none() {
        request.status_callback = base.as_deref().map(|base| format!("{}/calls/status", base));
    }

    match state.dispatcher.place(&request, &default_url).await {
        Ok(call_sid) => Json(json!({ "sid": call_sid })).into_response(),
        Err(PlaceCallError::InvalidNumber(number)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "phone number must be E.164", "number": number })),
        )
            .into_response(),
        Err(PlaceCallError::MissingCredentials) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "carrier credentials are not configured" })),
        )
            .into_response(),
        Err(PlaceCallError::Upstream { status, body }) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": "carrier rejected the call", "status": status, "body": body })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// `POST /calls/status`: carrier lifecycle callback for outbound calls
pub async fn status_callback_handler(body: String) -> Response {
    let form = parse_form(&body);
    let get = |key: &str| {
        form.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .unwrap_or_default()
    };
    info!(
        call_sid = get("CallSid"),
        status = get("CallStatus"),
        "Call lifecycle event"
    );
    StatusCode::NO_CONTENT.into_response()
}

/// `GET /calls`: recent carrier call records
pub async fn list_calls_handler(State(state): State<AppState>) -> Response {
    match state.dispatcher.list(20).await {
        Ok(body) => Json(body).into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// `GET /health`: liveness
pub async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok", "version": crate::VERSION }))
}

/// `GET /env-check`: boolean matrix of recognized env vars
pub async fn env_check_handler() -> Json<Value> {
    let matrix = crate::config::Config::env_matrix();
    let ok = matrix.iter().all(|(_, required, set)| !required || *set);
    let vars: Vec<Value> = matrix
        .into_iter()
        .map(|(name, required, set)| json!({ "name": name, "required": required, "set": set }))
        .collect();
    Json(json!({ "ok": ok, "vars": vars }))
}
