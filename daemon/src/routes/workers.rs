use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::serve::AppState;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerInfo {
    pub name: String,
    pub threads: usize,
    pub queue: usize,
    pub enabled: bool,
    pub frozen: bool,
    /// `[id:key]` per worker.
    pub info: String,
}

#[derive(Debug, Deserialize)]
pub struct Resize {
    pub size: usize,
}

fn snapshot(state: &AppState) -> WorkerInfo {
    let workers = state.mgr().workers();
    WorkerInfo {
        name: workers.name().to_string(),
        threads: workers.thread_count(),
        queue: workers.queue_len(),
        enabled: workers.enabled(),
        frozen: workers.action().frozen(),
        info: workers.worker_info(),
    }
}

pub async fn info(State(state): State<AppState>) -> Json<WorkerInfo> {
    Json(snapshot(&state))
}

#[tracing::instrument(skip(state))]
pub async fn resize(State(state): State<AppState>, Json(request): Json<Resize>) -> Json<WorkerInfo> {
    state.mgr().workers().resize_worker(request.size);
    Json(snapshot(&state))
}

pub async fn freeze(State(state): State<AppState>) -> Json<WorkerInfo> {
    state.mgr().workers().action().freeze();
    Json(snapshot(&state))
}

pub async fn unfreeze(State(state): State<AppState>) -> Json<WorkerInfo> {
    state.mgr().workers().action().unfreeze();
    Json(snapshot(&state))
}
