//! SSE change stream: `DownloadChanged`, `Resync`, and `Heartbeat` events.
//!
//! Each connection subscribes to the event bus with its own bounded
//! buffer. A connection that falls behind receives a `Resync` event
//! instructing it to re-fetch the full list; publishers are never blocked.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use futures_util::Stream;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use super::AppState;
use crate::events::HEARTBEAT_INTERVAL_SECS;

/// GET /downloads/stream
pub async fn stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.orchestrator.events().subscribe();

    let stream = async_stream::stream! {
        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
        // The first interval tick fires immediately; consume it so the
        // heartbeat cadence starts one interval from now.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    yield Ok(Event::default().event("Heartbeat").data("{}"));
                }
                received = rx.recv() => match received {
                    Ok(change) => {
                        if let Ok(payload) = serde_json::to_string(&change) {
                            yield Ok(Event::default()
                                .event("DownloadChanged")
                                .data(payload));
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // This subscriber's buffer overflowed; tell the
                        // client to re-fetch the full list.
                        debug!(skipped, "SSE subscriber lagged, sending resync");
                        yield Ok(Event::default()
                            .event("Resync")
                            .data(json!({ "skipped": skipped }).to_string()));
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    };

    Sse::new(stream)
}
