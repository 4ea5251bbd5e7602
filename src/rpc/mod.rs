//! RPC message types shared by the server and the executor agent.
//!
//! The protocol is deliberately thin: five request/reply shapes carried as
//! JSON over HTTP. Everything stateful lives behind the scheduler's
//! critical section; the transport only moves these structs.

mod client;

pub use client::{read_uri_file, SchedulerClient, REGISTRATION_WINDOW};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dag::DagCounts;
use crate::models::{ExecutorId, StageId};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid server uri: {0}")]
    BadUri(#[from] url::ParseError),
    #[error("could not register with server after {0} seconds")]
    RegistrationTimeout(u64),
    #[error("could not read server uri file {path}: {source}")]
    UriFile {
        path: String,
        source: std::io::Error,
    },
}

/// Executor -> server: announce resources and identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub host: String,
    pub total_memory_gb: f64,
    pub cores: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub executor_id: ExecutorId,
    /// Pipeline name, used by the executor to prefix its log directory.
    pub pipeline_name: String,
    /// Server-configured heartbeat period the executor must honor.
    pub heartbeat_interval_secs: u64,
}

/// Executor -> server: offer free resources, ask for a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRequest {
    pub executor_id: ExecutorId,
    pub free_memory_gb: f64,
    pub free_cores: u32,
}

/// A stage handed to an executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageAssignment {
    pub stage_id: StageId,
    pub name: String,
    pub command: Vec<String>,
    /// Memory the scheduler reserved for this stage; the executor counts
    /// it against its own allotment.
    pub memory_gb: f64,
}

/// Server -> executor: answer to a work request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkResponse {
    /// Run this stage.
    Stage { assignment: StageAssignment },
    /// Nothing fits right now; ask again later.
    Wait,
    /// Drain: finish in-flight stages, then exit.
    Shutdown,
}

/// Outcome of one stage execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    Finished,
    Failed { cause: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub executor_id: ExecutorId,
    pub stage_id: StageId,
    #[serde(flatten)]
    pub outcome: StageOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportResponse {
    /// False when the completion could not be made durable; the executor
    /// must re-report the same outcome.
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub executor_id: ExecutorId,
    /// Monotonic per-executor sequence number; the server ignores
    /// heartbeats that arrive out of order.
    pub seq: u64,
    pub resident_memory_gb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// False when the server no longer tracks this executor (reaped as
    /// lost, or never registered); the executor should drain.
    pub known: bool,
}

/// Read-only pipeline counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub total: usize,
    pub finished: usize,
    pub failed: usize,
    pub running: usize,
    pub runnable: usize,
}

impl From<DagCounts> for StatusResponse {
    fn from(c: DagCounts) -> Self {
        Self {
            total: c.total,
            finished: c.finished,
            failed: c.failed,
            running: c.running,
            runnable: c.runnable,
        }
    }
}

impl std::fmt::Display for StatusResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of {} stages complete ({} failed, {} running)",
            self.finished, self.total, self.failed, self.running
        )
    }
}
