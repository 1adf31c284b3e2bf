//! Axum API surface for the contractor directory harvester.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rcd_core::Job;
use rcd_queue::{JobQueueManager, QueueError};
use rcd_storage::RecordStore;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "rcd-web";

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<JobQueueManager>,
    pub store: RecordStore,
}

impl AppState {
    pub fn new(queue: Arc<JobQueueManager>, store: RecordStore) -> Self {
        Self { queue, store }
    }
}

#[derive(Debug, Serialize)]
struct RefreshAccepted {
    status: &'static str,
    message: &'static str,
    position: usize,
}

#[derive(Debug, Serialize)]
struct QueueStatus {
    position: usize,
    estimated_wait: u64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_json(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/refresh", post(refresh_handler))
        .route("/api/queue/status", get(queue_status_handler))
        .route("/api/contractors", get(contractors_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Enqueue a refresh job. Backpressure shows up as 429 once the pending
/// list hits its depth bound.
async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.queue.enqueue(Job::refresh(Utc::now())) {
        Ok(snapshot) => {
            info!(position = snapshot.position, "refresh job queued");
            Json(RefreshAccepted {
                status: "queued",
                message: "Refresh job has been queued",
                position: snapshot.position,
            })
            .into_response()
        }
        Err(err @ QueueError::Full { .. }) => {
            error_json(StatusCode::TOO_MANY_REQUESTS, err.to_string())
        }
    }
}

/// Current queue position for polling clients. There is no duration model
/// for a harvest run, so the estimate is always zero.
async fn queue_status_handler(State(state): State<Arc<AppState>>) -> Json<QueueStatus> {
    let snapshot = state.queue.snapshot();
    Json(QueueStatus {
        position: snapshot.position,
        estimated_wait: 0,
    })
}

/// The full record collection, served only while the queue is idle. Any
/// pending or in-flight refresh fails the read closed so clients never see
/// a half-merged snapshot.
async fn contractors_handler(State(state): State<Arc<AppState>>) -> Response {
    if !state.queue.snapshot().is_idle() {
        return error_json(StatusCode::TOO_MANY_REQUESTS, "Please wait for your turn");
    }
    match state.store.read_all() {
        Ok(records) => Json(records).into_response(),
        Err(err) => {
            error!(error = %err, "reading record store failed");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "record store unavailable")
        }
    }
}
