//! Scheduler-side view of a registered executor.

use std::collections::HashSet;
use std::time::Instant;

use uuid::Uuid;

use super::stage::StageId;

/// Opaque executor identity, assigned at registration.
pub type ExecutorId = Uuid;

/// Lifecycle of an executor record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Registered but has not requested work yet.
    Registered,
    /// Actively requesting and running stages.
    Active,
    /// Told to shut down; allowed to finish its in-flight stages.
    Draining,
    /// Gone. The record is destroyed shortly after entering this state.
    Dead,
}

/// Bookkeeping for one executor, owned by the scheduler.
#[derive(Debug)]
pub struct ExecutorRecord {
    pub id: ExecutorId,
    /// Host the executor reported at registration, for log messages.
    pub host: String,
    pub total_memory_gb: f64,
    pub cores: u32,
    /// Sum of the memory estimates of this executor's running stages.
    /// Invariant: never exceeds `total_memory_gb`.
    pub reserved_memory_gb: f64,
    pub running: HashSet<StageId>,
    pub last_heartbeat: Instant,
    /// Highest heartbeat sequence number seen. Heartbeats arriving out of
    /// order are ignored.
    pub heartbeat_seq: u64,
    /// Resident memory from the last heartbeat, for operator visibility.
    pub resident_memory_gb: f64,
    pub state: ExecutorState,
}

impl ExecutorRecord {
    pub fn new(host: String, total_memory_gb: f64, cores: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            host,
            total_memory_gb,
            cores,
            reserved_memory_gb: 0.0,
            running: HashSet::new(),
            last_heartbeat: Instant::now(),
            heartbeat_seq: 0,
            resident_memory_gb: 0.0,
            state: ExecutorState::Registered,
        }
    }

    pub fn free_memory_gb(&self) -> f64 {
        (self.total_memory_gb - self.reserved_memory_gb).max(0.0)
    }

    /// Reserve memory for a dispatched stage.
    pub fn reserve(&mut self, stage: StageId, memory_gb: f64) {
        self.running.insert(stage);
        self.reserved_memory_gb += memory_gb;
    }

    /// Release a stage's reservation after it finishes, fails, or is lost.
    pub fn release(&mut self, stage: StageId, memory_gb: f64) {
        if self.running.remove(&stage) {
            self.reserved_memory_gb = (self.reserved_memory_gb - memory_gb).max(0.0);
        }
    }

    pub fn is_idle(&self) -> bool {
        self.running.is_empty()
    }
}
