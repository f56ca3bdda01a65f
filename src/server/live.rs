//! Live transcript streaming
//!
//! Tails the transcript store over server-sent events. Readers keep their
//! own cursor; the stream polls the store at a modest cadence and never
//! misses an entry appended between polls.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::AppState;
use crate::transcript::EntryKind;

/// Poll cadence against the store
const POLL_INTERVAL: Duration = Duration::from_millis(600);

/// Comment keepalive cadence
const KEEPALIVE_SECS: u64 = 15;

/// `GET /live/{key}`: tail a call's transcript as `line` events
pub async fn stream_handler(
    Path(key): Path<String>,
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!(key = %key, "Transcript subscriber attached");

    let transcripts = state.transcripts.clone();
    let batches = stream::unfold(0usize, move |mut cursor| {
        let transcripts = transcripts.clone();
        let key = key.clone();
        async move {
            loop {
                let (entries, next) = transcripts.range(&key, cursor);
                if entries.is_empty() {
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }
                cursor = next;
                let events: Vec<Result<Event, Infallible>> = entries
                    .iter()
                    .map(|entry| {
                        let data = serde_json::to_string(entry).unwrap_or_default();
                        Ok(Event::default().event("line").data(data))
                    })
                    .collect();
                return Some((stream::iter(events), cursor));
            }
        }
    })
    .flatten();

    Sse::new(batches).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(KEEPALIVE_SECS))
            .text("keep-alive"),
    )
}

/// External publisher payload
#[derive(Debug, Deserialize)]
pub struct PushRequest {
    #[serde(default)]
    pub kind: Option<EntryKind>,
    pub text: String,
}

/// `POST /live/{key}/push`: append a line on behalf of a publisher
pub async fn push_handler(
    Path(key): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<PushRequest>,
) -> impl IntoResponse {
    let kind = request.kind.unwrap_or(EntryKind::TextDelta);
    state.transcripts.append(&key, kind, request.text);
    let (_, len) = state.transcripts.range(&key, usize::MAX);
    Json(json!({ "ok": true, "len": len }))
}
