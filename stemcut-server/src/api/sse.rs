//! Server-Sent Events stream of service events

use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;
use stemcut_common::sse::event_bus_sse_stream;

use crate::AppState;

/// GET /events
///
/// Streams log lines, queue item updates, completions, failures, deletions
/// and pending warnings.
pub async fn event_stream(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    event_bus_sse_stream(&state.event_bus)
}
