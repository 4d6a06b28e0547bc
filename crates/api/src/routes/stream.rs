use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn transcript(
    State(state): State<AppState>,
    Path((bot_id, guild_id)): Path<(String, String)>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let call = state
        .registry
        .get(&bot_id, &guild_id)
        .ok_or_else(|| ApiError::NotFound("Not in voice call".to_string()))?;
    Ok(sse_feed(call.subscribe_transcript()))
}

pub async fn tool_messages(
    State(state): State<AppState>,
    Path((bot_id, guild_id)): Path<(String, String)>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let call = state
        .registry
        .get(&bot_id, &guild_id)
        .ok_or_else(|| ApiError::NotFound("Not in voice call".to_string()))?;
    Ok(sse_feed(call.subscribe_tool_messages()))
}

pub async fn usage(
    State(state): State<AppState>,
    Path((bot_id, guild_id)): Path<(String, String)>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let call = state
        .registry
        .get(&bot_id, &guild_id)
        .ok_or_else(|| ApiError::NotFound("Not in voice call".to_string()))?;
    Ok(sse_feed(call.subscribe_usage()))
}

/// Adapts a call feed to SSE. A lagging subscriber skips dropped events and
/// keeps reading; the stream ends when the call does.
fn sse_feed(
    rx: broadcast::Receiver<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(payload) => Some(Ok(Event::default().data(payload))),
            Err(BroadcastStreamRecvError::Lagged(_)) => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
