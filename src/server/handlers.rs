//! RPC handlers. Each one is a thin shim: take the coordinator lock, call
//! the corresponding scheduler operation, serialize the answer.

use axum::extract::State;
use axum::Json;

use super::AppState;
use crate::rpc::{
    HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse, ReportRequest,
    ReportResponse, StatusResponse, WorkRequest, WorkResponse,
};

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Json<RegisterResponse> {
    let mut coordinator = state.coordinator.lock().await;
    let executor_id = coordinator.register_executor(req.host, req.total_memory_gb, req.cores);
    Json(RegisterResponse {
        executor_id,
        pipeline_name: coordinator.pipeline_name().to_string(),
        heartbeat_interval_secs: coordinator.settings().heartbeat_interval,
    })
}

pub async fn request_work(
    State(state): State<AppState>,
    Json(req): Json<WorkRequest>,
) -> Json<WorkResponse> {
    let mut coordinator = state.coordinator.lock().await;
    Json(coordinator.request_work(req.executor_id, req.free_memory_gb, req.free_cores))
}

pub async fn report(
    State(state): State<AppState>,
    Json(req): Json<ReportRequest>,
) -> Json<ReportResponse> {
    let mut coordinator = state.coordinator.lock().await;
    let accepted = coordinator.report(req.executor_id, req.stage_id, &req.outcome);
    Json(ReportResponse { accepted })
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> Json<HeartbeatResponse> {
    let mut coordinator = state.coordinator.lock().await;
    let known = coordinator.heartbeat(req.executor_id, req.seq, req.resident_memory_gb);
    Json(HeartbeatResponse { known })
}

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let coordinator = state.coordinator.lock().await;
    Json(coordinator.status())
}
