//! HTTP server wiring
//!
//! Routes, shared state and startup. One process serves the control
//! documents, the bridge WebSocket, the token minter, the control webhook
//! and the live-transcript stream.

pub mod control;
pub mod http;
pub mod live;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::carrier::CallDispatcher;
use crate::config::Config;
use crate::session::ControlState;
use crate::token::TokenMinter;
use crate::transcript::TranscriptStore;

/// Shared server state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub control: Arc<ControlState>,
    pub transcripts: Arc<TranscriptStore>,
    pub minter: Arc<TokenMinter>,
    pub dispatcher: Arc<CallDispatcher>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let control = Arc::new(ControlState::from_defaults(&config.realtime));
        let minter = Arc::new(TokenMinter::new(&config.openai));
        let dispatcher = Arc::new(CallDispatcher::new(&config.twilio));
        Self {
            config: Arc::new(config),
            control,
            transcripts: TranscriptStore::new(),
            minter,
            dispatcher,
        }
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_page))
        .route("/twiml", get(http::twiml_handler).post(http::twiml_handler))
        .route("/twiml/action", post(http::twiml_action_handler))
        .route("/stream/twilio", get(crate::bridge::ws_handler_query))
        .route("/stream/twilio/{token}", get(crate::bridge::ws_handler_path))
        .route("/realtime-token", post(http::mint_handler))
        .route("/calls", post(http::place_call_handler).get(http::list_calls_handler))
        .route("/calls/status", post(http::status_callback_handler))
        .route("/control", get(control::get_control).post(control::post_control))
        .route(
            "/control/settings",
            get(control::get_settings).post(control::post_settings),
        )
        .route("/live/{key}", get(live::stream_handler))
        .route("/live/{key}/push", post(live::push_handler))
        .route("/health", get(http::health_handler))
        .route("/env-check", get(http::env_check_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Handler for the index page
async fn index_page() -> axum::response::Html<&'static str> {
    axum::response::Html(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Callbridge</title>
    <meta charset="utf-8">
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            max-width: 800px;
            margin: 0 auto;
            padding: 20px;
            background: #1a1a1a;
            color: #e0e0e0;
        }
        h1 { color: #4CAF50; }
        .endpoint {
            background: #333;
            padding: 10px;
            margin: 10px 0;
            border-radius: 4px;
            font-family: monospace;
        }
    </style>
</head>
<body>
    <h1>Callbridge</h1>
    <p>Carrier media streams bridged to a realtime speech-to-speech model.</p>
    <h2>Endpoints:</h2>
    <div class="endpoint">GET/POST /twiml - Call-control document</div>
    <div class="endpoint">GET /stream/twilio/{token} - Media-stream WebSocket</div>
    <div class="endpoint">POST /realtime-token - Mint ephemeral credential</div>
    <div class="endpoint">POST /calls - Place outbound call</div>
    <div class="endpoint">GET/POST /control - Session-update webhook</div>
    <div class="endpoint">GET /live/{key} - Live transcript (SSE)</div>
    <div class="endpoint">GET /health - Liveness</div>
    <div class="endpoint">GET /env-check - Environment matrix</div>
</body>
</html>"#,
    )
}

/// Start the server
pub async fn start(
    host: &str,
    port: u16,
    https: bool,
    cert: Option<String>,
    key: Option<String>,
) -> Result<()> {
    let config = Config::from_env()?;
    let state = AppState::new(config);
    state.transcripts.spawn_sweeper();

    let app = router(state);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("invalid listen address")?;

    info!(%addr, https, "Bridge server starting");

    if https {
        if let (Some(cert_path), Some(key_path)) = (cert, key) {
            let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert_path, &key_path)
                .await
                .context("failed to load TLS certificate or key")?;
            axum_server::bind_rustls(addr, tls)
                .serve(app.into_make_service())
                .await?;
            return Ok(());
        }
        anyhow::bail!("--https requires --cert and --key");
    }

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Resolve on ctrl-c or SIGTERM so in-flight calls can drain
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
