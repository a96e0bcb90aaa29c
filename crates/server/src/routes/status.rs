// crates/server/src/routes/status.rs
//! SSE stream of job status records.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use qmd_hasher_jobs::Job;
use tokio::sync::mpsc::error::TryRecvError;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// GET /api/status/stream/{job_id} - one `status` event per job mutation.
///
/// The first event carries the current state. The stream ends after the
/// terminal record, or when the job is removed. Snapshots dropped on a full
/// buffer are not replayed; whenever the buffer runs dry the stored job is
/// consulted, so a lost terminal snapshot still ends the stream.
pub async fn stream_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>> {
    let subscription = state
        .jobs
        .subscribe(&job_id)
        .ok_or_else(|| ApiError::JobNotFound(job_id.clone()))?;

    let stream = async_stream::stream! {
        let mut subscription = subscription;
        loop {
            let job = match subscription.try_recv() {
                Ok(job) => job,
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => match state.jobs.get(&job_id) {
                    // Snapshots that landed since the empty check go first.
                    Some(current) if current.is_terminal() => match subscription.try_recv() {
                        Ok(job) => job,
                        Err(_) => Arc::new(current),
                    },
                    Some(_) => match subscription.recv().await {
                        Some(job) => job,
                        None => break,
                    },
                    None => break,
                },
            };
            yield Ok(status_event(&job));
            if job.is_terminal() {
                break;
            }
        }
        tracing::debug!(job_id = %subscription.job_id(), "Status stream closed");
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn status_event(job: &Job) -> Event {
    let json = serde_json::to_string(&job.record()).unwrap_or_default();
    Event::default().event("status").data(json)
}

/// Create the status stream router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/status/stream/{job_id}", get(stream_status))
}
