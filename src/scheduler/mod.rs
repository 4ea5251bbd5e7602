//! Scheduler core: the coordinator that owns the DAG, the completion log,
//! and the executor table.
//!
//! One coordinator exists per pipeline invocation and every mutation goes
//! through it under a single lock, so the scheduling logic is logically
//! single-threaded no matter how many RPC handlers are in flight. Earlier
//! generations of this system ran threaded RPC servers against shared
//! graph state and hung at scale; the serialized critical section is a
//! hard design constraint, not a simplification.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use thiserror::Error;

use crate::backup::{BackupError, CompletionLog};
use crate::config::Settings;
use crate::dag::{DagError, StageDag};
use crate::models::{
    ExecutorId, ExecutorRecord, ExecutorState, FailureCause, StageAction, StageId, StageStatus,
    StageTemplate, MAX_RETRIES,
};
use crate::rpc::{StageAssignment, StatusResponse, WorkResponse};

/// Memory granted to generated verification-image stages. Snapshot tools
/// read one slice at a time and never approach the registration tools'
/// footprints.
const VERIFICATION_MEMORY_GB: f64 = 0.25;

/// Slack for floating-point memory comparisons.
const MEM_EPSILON: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Dag(#[from] DagError),
    #[error(transparent)]
    Backup(#[from] BackupError),
    #[error(
        "insufficient resources: stage {stage:?} needs {needed_gb:.2} GB but \
         no executor may exceed {limit_gb:.2} GB"
    )]
    InsufficientResources {
        stage: String,
        needed_gb: f64,
        limit_gb: f64,
    },
}

/// The coordinator: C1 + C2 + the executor table behind one interface.
pub struct Coordinator {
    pipeline_name: String,
    work_dir: PathBuf,
    dag: StageDag,
    log: CompletionLog,
    executors: HashMap<ExecutorId, ExecutorRecord>,
    settings: Settings,
    draining: bool,
    fatal: Option<String>,
}

impl Coordinator {
    /// Build a coordinator over a fully-constructed DAG, consulting the
    /// completion log so stages finished by an earlier run are skipped.
    pub fn new(
        pipeline_name: impl Into<String>,
        mut dag: StageDag,
        settings: Settings,
        work_dir: &Path,
    ) -> Result<Self, SchedulerError> {
        dag.topological_validate()?;

        let mut log = CompletionLog::open(work_dir)?;
        let done = log.load()?;
        let resumed = dag.resume_finished(&done);
        dag.activate();

        if resumed > 0 {
            tracing::info!(
                resumed,
                total = dag.len(),
                "recognized previously-finished stages from the completion log"
            );
        }

        let mut coordinator = Self {
            pipeline_name: pipeline_name.into(),
            work_dir: work_dir.to_path_buf(),
            dag,
            log,
            executors: HashMap::new(),
            settings,
            draining: false,
            fatal: None,
        };
        // A fully-resumed (or empty) pipeline has nothing to hand out.
        coordinator.check_drain();
        Ok(coordinator)
    }

    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn fatal_error(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    /// Whether the run is over: drained and every executor record gone.
    pub fn is_complete(&self) -> bool {
        self.draining && self.executors.is_empty()
    }

    pub fn status(&self) -> StatusResponse {
        self.dag.counts().into()
    }

    pub fn failed_stage_names(&self) -> Vec<String> {
        self.dag
            .failed_stages()
            .map(|s| {
                let cause = s
                    .failure
                    .as_ref()
                    .map(|c| c.describe())
                    .unwrap_or_else(|| "unknown".to_string());
                format!("{} ({})", s.name, cause)
            })
            .collect()
    }

    /// Register an executor and return its identity plus the parameters it
    /// must honor.
    pub fn register_executor(&mut self, host: String, total_memory_gb: f64, cores: u32) -> ExecutorId {
        let record = ExecutorRecord::new(host, total_memory_gb, cores);
        let id = record.id;
        tracing::info!(
            executor = %id,
            host = %record.host,
            memory_gb = total_memory_gb,
            cores,
            "executor registered"
        );
        self.executors.insert(id, record);
        id
    }

    /// Answer an executor's offer of free resources.
    pub fn request_work(
        &mut self,
        executor_id: ExecutorId,
        free_memory_gb: f64,
        free_cores: u32,
    ) -> WorkResponse {
        let now = Instant::now();
        let Some(record) = self.executors.get_mut(&executor_id) else {
            // Reaped as lost, or never registered. Either way: go away.
            return WorkResponse::Shutdown;
        };
        record.last_heartbeat = now;
        if record.state == ExecutorState::Registered {
            record.state = ExecutorState::Active;
        }

        self.check_drain();
        if self.draining {
            return self.shut_down_executor(executor_id);
        }

        if free_cores == 0 {
            return WorkResponse::Wait;
        }

        // First runnable stage, in insertion order, that fits the offer.
        // Deferred memory estimates are evaluated here, on the way to
        // their first dispatch.
        let runnable: Vec<StageId> = self.dag.runnable_iter().map(|s| s.id).collect();
        for stage_id in &runnable {
            let Ok(stage) = self.dag.stage_mut(*stage_id) else {
                continue;
            };
            stage.refresh_memory();
            let memory_gb = stage.memory_gb();
            if memory_gb <= free_memory_gb + MEM_EPSILON {
                return self.dispatch(executor_id, *stage_id, memory_gb);
            }
        }

        // Nothing fits this offer. If some runnable stage can never fit
        // anywhere, the pipeline is unsatisfiable and continuing would
        // just spin every executor on Wait forever.
        let limit_gb = self.cluster_memory_ceiling();
        let hopeless = self
            .dag
            .runnable_iter()
            .find(|s| s.memory_gb() > limit_gb + MEM_EPSILON)
            .map(|s| (s.name.clone(), s.memory_gb()));
        if let Some((stage, needed_gb)) = hopeless {
            let err = SchedulerError::InsufficientResources {
                stage,
                needed_gb,
                limit_gb,
            };
            tracing::error!("{}", err);
            self.fatal = Some(err.to_string());
            self.draining = true;
            return self.shut_down_executor(executor_id);
        }

        WorkResponse::Wait
    }

    fn dispatch(
        &mut self,
        executor_id: ExecutorId,
        stage_id: StageId,
        memory_gb: f64,
    ) -> WorkResponse {
        // All three mutations happen here, inside the caller's critical
        // section: frontier removal, status change, memory reservation.
        if let Err(err) = self.dag.mark_running(stage_id) {
            tracing::error!("refusing dispatch: {}", err);
            return WorkResponse::Wait;
        }
        let Some(record) = self.executors.get_mut(&executor_id) else {
            // The record vanished between the fit check and here; put the
            // stage back rather than strand it in RUNNING with no owner.
            let _ = self.dag.mark_runnable_again(stage_id);
            return WorkResponse::Shutdown;
        };
        record.reserve(stage_id, memory_gb);

        let stage = match self.dag.stage(stage_id) {
            Ok(s) => s,
            Err(err) => {
                tracing::error!("dispatched stage vanished: {}", err);
                return WorkResponse::Wait;
            }
        };
        tracing::debug!(
            stage = %stage.name,
            executor = %executor_id,
            memory_gb,
            "dispatched stage"
        );
        WorkResponse::Stage {
            assignment: StageAssignment {
                stage_id,
                name: stage.name.clone(),
                command: stage.command.clone(),
                memory_gb,
            },
        }
    }

    /// Hand Shutdown to an executor, destroying its record once it has
    /// nothing in flight. Executors with running stages keep their record
    /// until the final report arrives.
    fn shut_down_executor(&mut self, executor_id: ExecutorId) -> WorkResponse {
        if let Some(record) = self.executors.get_mut(&executor_id) {
            if record.is_idle() {
                record.state = ExecutorState::Dead;
                tracing::info!(executor = %executor_id, "executor released");
                self.executors.remove(&executor_id);
            } else {
                record.state = ExecutorState::Draining;
            }
        }
        WorkResponse::Shutdown
    }

    /// Record a stage outcome. Returns false when the completion could not
    /// be made durable, in which case the executor must re-report.
    pub fn report(
        &mut self,
        executor_id: ExecutorId,
        stage_id: StageId,
        outcome: &crate::rpc::StageOutcome,
    ) -> bool {
        let owns = self
            .executors
            .get(&executor_id)
            .map(|r| r.running.contains(&stage_id))
            .unwrap_or(false);
        let running = self
            .dag
            .stage(stage_id)
            .map(|s| s.status == StageStatus::Running)
            .unwrap_or(false);
        if !owns || !running {
            // A stale report: the executor was reaped as lost and the stage
            // already requeued. Accept it so the executor moves on; the
            // retried execution is authoritative.
            tracing::warn!(
                executor = %executor_id,
                stage_id,
                "ignoring report for a stage this executor no longer owns"
            );
            return true;
        }

        if let Some(record) = self.executors.get_mut(&executor_id) {
            record.last_heartbeat = Instant::now();
        }

        match outcome {
            crate::rpc::StageOutcome::Finished => {
                if !self.commit_finished(executor_id, stage_id) {
                    return false;
                }
            }
            crate::rpc::StageOutcome::Failed { cause } => {
                self.release_reservation(executor_id, stage_id);
                self.retry_or_fail(stage_id, FailureCause::Command(cause.clone()));
            }
        }

        self.check_drain();
        self.reap_idle_drainer(executor_id);
        true
    }

    /// The completion path: write-ahead to the log, run completion-time
    /// actions, then unblock dependents. Returns false only on a log write
    /// failure, leaving the stage RUNNING for a re-report.
    fn commit_finished(&mut self, executor_id: ExecutorId, stage_id: StageId) -> bool {
        let fingerprint = match self.dag.stage(stage_id) {
            Ok(s) => s.fingerprint().clone(),
            Err(err) => {
                tracing::error!("report for unknown stage: {}", err);
                return true;
            }
        };
        if let Err(err) = self.log.append(&fingerprint) {
            tracing::error!(stage_id, "could not persist completion, rejecting report: {}", err);
            return false;
        }

        self.release_reservation(executor_id, stage_id);

        if let Err(cause) = self.apply_completion_actions(stage_id) {
            tracing::warn!(stage_id, %cause, "completion action failed");
            self.retry_or_fail(stage_id, FailureCause::Action(cause));
            return true;
        }

        match self.dag.mark_finished(stage_id) {
            Ok(newly_runnable) => {
                let counts = self.dag.counts();
                tracing::info!(
                    stage_id,
                    unblocked = newly_runnable.len(),
                    "stage finished ({} of {} complete)",
                    counts.finished,
                    counts.total
                );
            }
            Err(err) => tracing::error!("could not mark stage finished: {}", err),
        }
        true
    }

    /// Evaluate the completion-time hook actions of a stage, registering
    /// any followup stages as dependents. Runs before the stage itself is
    /// marked finished, so the followups are unblocked by the same
    /// `mark_finished` that unblocks ordinary dependents.
    fn apply_completion_actions(&mut self, stage_id: StageId) -> Result<(), String> {
        let (name, outputs, actions): (String, Vec<PathBuf>, Vec<StageAction>) =
            match self.dag.stage(stage_id) {
                Ok(s) => (
                    s.name.clone(),
                    s.outputs.clone(),
                    s.completion_actions().cloned().collect(),
                ),
                Err(_) => return Ok(()),
            };

        for action in actions {
            match action {
                StageAction::EmitVerificationImage { tool, output } => {
                    if tool.is_empty() {
                        return Err("verification tool is empty".to_string());
                    }
                    let source = outputs
                        .first()
                        .cloned()
                        .ok_or_else(|| "stage has no outputs to verify".to_string())?;
                    let template = StageTemplate::new(
                        format!("{}-verify", name),
                        vec![
                            tool,
                            source.to_string_lossy().into_owned(),
                            output.to_string_lossy().into_owned(),
                        ],
                    )
                    .with_inputs(vec![source])
                    .with_outputs(vec![output])
                    .with_memory(VERIFICATION_MEMORY_GB);
                    self.register_followup(stage_id, template)?;
                }
                StageAction::RegisterFollowup { stage } => {
                    if stage.command.is_empty() {
                        return Err(format!("followup stage {:?} has an empty command", stage.name));
                    }
                    if !stage.depends.is_empty() {
                        return Err(format!(
                            "followup stage {:?} may not declare name dependencies",
                            stage.name
                        ));
                    }
                    self.register_followup(stage_id, stage)?;
                }
                StageAction::RecomputeMemory { .. } => {}
            }
        }
        Ok(())
    }

    fn register_followup(
        &mut self,
        parent: StageId,
        template: StageTemplate,
    ) -> Result<(), String> {
        let name = template.name.clone();
        let id = self.dag.add_stage(template);
        self.dag
            .add_dependency(parent, id)
            .map_err(|e| e.to_string())?;
        tracing::debug!(parent, followup = %name, "registered followup stage");
        Ok(())
    }

    fn release_reservation(&mut self, executor_id: ExecutorId, stage_id: StageId) {
        let memory_gb = self
            .dag
            .stage(stage_id)
            .map(|s| s.memory_gb())
            .unwrap_or(0.0);
        if let Some(record) = self.executors.get_mut(&executor_id) {
            record.release(stage_id, memory_gb);
        }
    }

    /// Shared retry policy for command failures, action failures, and lost
    /// executors: up to [`MAX_RETRIES`] requeues, then permanent failure
    /// with dependency propagation.
    fn retry_or_fail(&mut self, stage_id: StageId, cause: FailureCause) {
        let (name, retries) = match self.dag.stage_mut(stage_id) {
            Ok(stage) => {
                stage.retries += 1;
                (stage.name.clone(), stage.retries)
            }
            Err(err) => {
                tracing::error!("failure report for unknown stage: {}", err);
                return;
            }
        };

        if retries <= MAX_RETRIES {
            tracing::warn!(
                stage = %name,
                attempt = retries,
                max = MAX_RETRIES,
                "stage failed ({}), requeueing",
                cause.describe()
            );
            if let Err(err) = self.dag.mark_runnable_again(stage_id) {
                tracing::error!("could not requeue stage: {}", err);
            }
            return;
        }

        tracing::error!(stage = %name, "stage failed permanently: {}", cause.describe());
        match self.dag.mark_failed(stage_id, cause) {
            Ok(deps) if !deps.is_empty() => {
                tracing::warn!(
                    stage = %name,
                    dependents = deps.len(),
                    "propagated failure to dependents"
                );
            }
            Ok(_) => {}
            Err(err) => tracing::error!("could not mark stage failed: {}", err),
        }
    }

    /// Record a heartbeat. Returns false for executors this coordinator
    /// does not track, telling them to drain.
    pub fn heartbeat(&mut self, executor_id: ExecutorId, seq: u64, resident_memory_gb: f64) -> bool {
        let Some(record) = self.executors.get_mut(&executor_id) else {
            return false;
        };
        if seq <= record.heartbeat_seq {
            tracing::debug!(executor = %executor_id, seq, "ignoring out-of-order heartbeat");
            return true;
        }
        record.heartbeat_seq = seq;
        record.last_heartbeat = Instant::now();
        record.resident_memory_gb = resident_memory_gb;
        true
    }

    /// Destroy records of executors silent for longer than the latency
    /// tolerance and requeue their in-flight stages with an extra retry.
    /// Returns the reaped executor ids.
    pub fn reap_lost_executors(&mut self) -> Vec<ExecutorId> {
        let tolerance = self.settings.latency_tolerance();
        let now = Instant::now();
        let lost: Vec<ExecutorId> = self
            .executors
            .iter()
            .filter(|(_, r)| now.duration_since(r.last_heartbeat) > tolerance)
            .map(|(id, _)| *id)
            .collect();

        for executor_id in &lost {
            let Some(mut record) = self.executors.remove(executor_id) else {
                continue;
            };
            record.state = ExecutorState::Dead;
            tracing::warn!(
                executor = %executor_id,
                host = %record.host,
                stages = record.running.len(),
                "executor lost: no heartbeat within tolerance"
            );
            for stage_id in record.running {
                if let Ok(stage) = self.dag.stage_mut(stage_id) {
                    stage.status = StageStatus::Lost;
                }
                self.retry_or_fail(stage_id, FailureCause::ExecutorLost);
            }
        }
        if !lost.is_empty() {
            self.check_drain();
        }
        lost
    }

    /// Begin a drain: no new work is handed out, in-flight stages finish.
    pub fn initiate_drain(&mut self, reason: &str) {
        if !self.draining {
            tracing::info!(reason, "draining pipeline");
            self.draining = true;
        }
    }

    /// Record a fatal condition and drain. Used for failures detected
    /// outside a work request, such as an unsatisfiable batch submission.
    pub fn set_fatal(&mut self, message: String) {
        tracing::error!("{}", message);
        if self.fatal.is_none() {
            self.fatal = Some(message);
        }
        self.draining = true;
    }

    /// Memory request for the next batch-submitted executor, derived from
    /// the largest runnable stage. Fails rather than submit a job that can
    /// never host its stage.
    pub fn executor_memory_request(&self) -> Result<f64, SchedulerError> {
        let largest = self.dag.largest_runnable_memory_gb().unwrap_or(1.0);
        if largest > self.settings.mem + MEM_EPSILON {
            let stage = self
                .dag
                .runnable_iter()
                .find(|s| s.memory_gb() >= largest - MEM_EPSILON)
                .map(|s| s.name.clone())
                .unwrap_or_default();
            return Err(SchedulerError::InsufficientResources {
                stage,
                needed_gb: largest,
                limit_gb: self.settings.mem,
            });
        }
        Ok(largest.clamp(1.0, self.settings.mem))
    }

    /// The most memory any single stage could ever be granted: the largest
    /// declared executor, or the configured per-executor cap when that is
    /// higher (covering executors yet to be submitted).
    fn cluster_memory_ceiling(&self) -> f64 {
        self.executors
            .values()
            .map(|r| r.total_memory_gb)
            .fold(self.settings.mem, f64::max)
    }

    fn check_drain(&mut self) {
        if !self.draining && !self.dag.has_work() {
            let counts = self.dag.counts();
            tracing::info!(
                "no work remains: {} finished, {} failed of {} stages",
                counts.finished,
                counts.failed,
                counts.total
            );
            self.draining = true;
        }
    }

    /// Remove a draining executor's record once its last report is in.
    fn reap_idle_drainer(&mut self, executor_id: ExecutorId) {
        if let Some(record) = self.executors.get(&executor_id) {
            if record.state == ExecutorState::Draining && record.is_idle() {
                tracing::info!(executor = %executor_id, "executor released");
                self.executors.remove(&executor_id);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn dag(&self) -> &StageDag {
        &self.dag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::StageOutcome;
    use std::path::Path;

    fn stage(name: &str, mem: f64) -> StageTemplate {
        StageTemplate::new(name, vec!["echo".to_string(), name.to_string()]).with_memory(mem)
    }

    fn chain_dag(names: &[&str], mem: f64) -> StageDag {
        let mut dag = StageDag::new();
        let ids: Vec<StageId> = names.iter().map(|n| dag.add_stage(stage(n, mem))).collect();
        for pair in ids.windows(2) {
            dag.add_dependency(pair[0], pair[1]).unwrap();
        }
        dag
    }

    fn coordinator(dag: StageDag, dir: &Path) -> Coordinator {
        Coordinator::new("test", dag, Settings::default(), dir).unwrap()
    }

    fn take_stage(c: &mut Coordinator, executor: ExecutorId, mem: f64) -> StageAssignment {
        match c.request_work(executor, mem, 4) {
            WorkResponse::Stage { assignment } => assignment,
            other => panic!("expected a stage, got {:?}", other),
        }
    }

    #[test]
    fn linear_chain_runs_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator(chain_dag(&["a", "b", "c"], 1.0), dir.path());
        let executor = c.register_executor("node01".to_string(), 4.0, 4);

        let mut order = Vec::new();
        for _ in 0..3 {
            let assignment = take_stage(&mut c, executor, 4.0);
            order.push(assignment.name.clone());
            assert!(c.report(executor, assignment.stage_id, &StageOutcome::Finished));
        }
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(c.status().finished, 3);

        // Drained; the executor is told to leave and the run completes.
        assert!(matches!(
            c.request_work(executor, 4.0, 4),
            WorkResponse::Shutdown
        ));
        assert!(c.is_complete());
        assert!(c.failed_stage_names().is_empty());
    }

    #[test]
    fn completion_is_durable_before_dependents_unblock() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator(chain_dag(&["a", "b"], 1.0), dir.path());
        let executor = c.register_executor("node01".to_string(), 4.0, 4);

        let a = take_stage(&mut c, executor, 4.0);
        let fp_a = c.dag().stage(a.stage_id).unwrap().fingerprint().clone();
        assert!(c.report(executor, a.stage_id, &StageOutcome::Finished));

        // The dependent is runnable, and the fingerprint is already on disk.
        let logged = std::fs::read_to_string(
            crate::backup::backup_dir(dir.path()).join(crate::backup::FINISHED_STAGES_FILE),
        )
        .unwrap();
        assert!(logged.contains(fp_a.as_str()));
        assert!(c.dag().is_runnable(1));
    }

    #[test]
    fn transient_failure_retries_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator(chain_dag(&["a", "b"], 1.0), dir.path());
        let executor = c.register_executor("node01".to_string(), 4.0, 4);

        let a = take_stage(&mut c, executor, 4.0);
        assert!(c.report(executor, a.stage_id, &StageOutcome::Finished));

        // b fails twice, then succeeds on the third attempt.
        for attempt in 1..=2 {
            let b = take_stage(&mut c, executor, 4.0);
            assert_eq!(b.name, "b");
            assert!(c.report(
                executor,
                b.stage_id,
                &StageOutcome::Failed {
                    cause: "exited with status 1".to_string()
                }
            ));
            assert_eq!(c.dag().stage(b.stage_id).unwrap().retries, attempt);
        }
        let b = take_stage(&mut c, executor, 4.0);
        assert!(c.report(executor, b.stage_id, &StageOutcome::Finished));

        let status = c.status();
        assert_eq!(status.finished, 2);
        assert_eq!(status.failed, 0);
        assert_eq!(c.dag().stage(b.stage_id).unwrap().retries, 2);
    }

    #[test]
    fn permanent_failure_spares_independent_subgraphs() {
        let dir = tempfile::tempdir().unwrap();
        let mut dag = StageDag::new();
        let a = dag.add_stage(stage("a", 1.0));
        let b = dag.add_stage(stage("b", 1.0));
        let c_id = dag.add_stage(stage("c", 1.0));
        dag.add_dependency(a, b).unwrap();
        dag.add_dependency(a, c_id).unwrap();

        let mut c = coordinator(dag, dir.path());
        let executor = c.register_executor("node01".to_string(), 4.0, 4);

        let first = take_stage(&mut c, executor, 4.0);
        assert!(c.report(executor, first.stage_id, &StageOutcome::Finished));

        // b fails on all three attempts.
        let mut b_failed = false;
        while !b_failed {
            let assignment = take_stage(&mut c, executor, 4.0);
            if assignment.name == "b" {
                c.report(
                    executor,
                    assignment.stage_id,
                    &StageOutcome::Failed {
                        cause: "segfault".to_string(),
                    },
                );
                b_failed = c.dag().stage(b).unwrap().status == StageStatus::Failed;
            } else {
                c.report(executor, assignment.stage_id, &StageOutcome::Finished);
            }
        }

        // c still completes if it has not already.
        while let WorkResponse::Stage { assignment } = c.request_work(executor, 4.0, 4) {
            c.report(executor, assignment.stage_id, &StageOutcome::Finished);
        }

        let status = c.status();
        assert_eq!(status.finished, 2);
        assert_eq!(status.failed, 1);
        assert_eq!(c.dag().stage(b).unwrap().retries, 3);
        assert_eq!(c.failed_stage_names().len(), 1);
    }

    #[test]
    fn retry_cap_allows_at_most_three_episodes() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator(chain_dag(&["a"], 1.0), dir.path());
        let executor = c.register_executor("node01".to_string(), 4.0, 4);

        let mut episodes = 0;
        while let WorkResponse::Stage { assignment } = c.request_work(executor, 4.0, 4) {
            episodes += 1;
            c.report(
                executor,
                assignment.stage_id,
                &StageOutcome::Failed {
                    cause: "boom".to_string(),
                },
            );
        }
        assert_eq!(episodes, 3);
        assert_eq!(c.status().failed, 1);
    }

    #[test]
    fn lost_executor_stages_requeue_with_retry() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.latency_tolerance = 0;
        let mut dag = StageDag::new();
        dag.add_stage(stage("s1", 1.0));
        dag.add_stage(stage("s2", 1.0));
        let mut c = Coordinator::new("test", dag, settings, dir.path()).unwrap();

        let e1 = c.register_executor("node01".to_string(), 4.0, 4);
        let s1 = take_stage(&mut c, e1, 4.0);
        let s2 = take_stage(&mut c, e1, 3.0);

        std::thread::sleep(std::time::Duration::from_millis(5));
        let reaped = c.reap_lost_executors();
        assert_eq!(reaped, vec![e1]);

        for id in [s1.stage_id, s2.stage_id] {
            let stage = c.dag().stage(id).unwrap();
            assert_eq!(stage.status, StageStatus::Runnable);
            assert_eq!(stage.retries, 1);
        }

        // A late report from the dead executor is ignored but acknowledged.
        assert!(c.report(e1, s1.stage_id, &StageOutcome::Finished));
        assert_eq!(c.dag().stage(s1.stage_id).unwrap().status, StageStatus::Runnable);

        // A fresh executor picks the stages up and completes the run.
        let e2 = c.register_executor("node02".to_string(), 4.0, 4);
        while let WorkResponse::Stage { assignment } = c.request_work(e2, 4.0, 4) {
            assert!(c.report(e2, assignment.stage_id, &StageOutcome::Finished));
        }
        assert_eq!(c.status().finished, 2);
    }

    #[test]
    fn restart_executes_only_unfinished_stages() {
        let dir = tempfile::tempdir().unwrap();

        // First run: finish 2 of 4 stages, then "crash".
        {
            let mut dag = StageDag::new();
            for i in 0..4 {
                dag.add_stage(stage(&format!("s{}", i), 1.0));
            }
            let mut c = coordinator(dag, dir.path());
            let executor = c.register_executor("node01".to_string(), 4.0, 4);
            for _ in 0..2 {
                let assignment = take_stage(&mut c, executor, 4.0);
                c.report(executor, assignment.stage_id, &StageOutcome::Finished);
            }
        }

        // Second run against the same working directory.
        let mut dag = StageDag::new();
        for i in 0..4 {
            dag.add_stage(stage(&format!("s{}", i), 1.0));
        }
        let mut c = coordinator(dag, dir.path());
        assert_eq!(c.status().finished, 2);

        let executor = c.register_executor("node01".to_string(), 4.0, 4);
        let mut executed = 0;
        while let WorkResponse::Stage { assignment } = c.request_work(executor, 4.0, 4) {
            executed += 1;
            c.report(executor, assignment.stage_id, &StageOutcome::Finished);
        }
        assert_eq!(executed, 2);
        assert_eq!(c.status().finished, 4);
    }

    #[test]
    fn fully_resumed_pipeline_is_immediately_complete() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut c = coordinator(chain_dag(&["a"], 1.0), dir.path());
            let executor = c.register_executor("node01".to_string(), 4.0, 4);
            let a = take_stage(&mut c, executor, 4.0);
            c.report(executor, a.stage_id, &StageOutcome::Finished);
        }

        let c = coordinator(chain_dag(&["a"], 1.0), dir.path());
        assert!(c.is_draining());
        assert!(c.is_complete());
        assert_eq!(c.status().finished, 1);
    }

    #[test]
    fn oversized_stage_fails_the_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let mut dag = StageDag::new();
        dag.add_stage(stage("small", 1.0));
        dag.add_stage(stage("huge", 32.0));
        let mut c = coordinator(dag, dir.path());
        let executor = c.register_executor("node01".to_string(), 16.0, 4);

        // The small stage dispatches normally.
        let small = take_stage(&mut c, executor, 16.0);
        assert_eq!(small.name, "small");
        assert!(c.report(executor, small.stage_id, &StageOutcome::Finished));

        // Only the 32 GB stage remains; no executor may ever hold it.
        assert!(matches!(
            c.request_work(executor, 16.0, 4),
            WorkResponse::Shutdown
        ));
        assert!(c.fatal_error().unwrap().contains("insufficient resources"));
        assert!(c.is_complete());
    }

    #[test]
    fn stage_too_big_for_this_executor_waits_for_another() {
        let dir = tempfile::tempdir().unwrap();
        let mut dag = StageDag::new();
        dag.add_stage(stage("big", 12.0));
        let mut c = coordinator(dag, dir.path());

        let small = c.register_executor("node01".to_string(), 4.0, 4);
        let big = c.register_executor("node02".to_string(), 16.0, 4);

        // Fits node02, so node01 is told to wait, not to shut down.
        assert!(matches!(c.request_work(small, 4.0, 4), WorkResponse::Wait));
        let assignment = take_stage(&mut c, big, 16.0);
        assert_eq!(assignment.name, "big");
    }

    #[test]
    fn memory_reservations_respect_declared_total() {
        let dir = tempfile::tempdir().unwrap();
        let mut dag = StageDag::new();
        for i in 0..3 {
            dag.add_stage(stage(&format!("s{}", i), 2.0));
        }
        let mut c = coordinator(dag, dir.path());
        let executor = c.register_executor("node01".to_string(), 4.0, 4);

        // 4 GB holds two 2 GB stages; the third must wait.
        let first = take_stage(&mut c, executor, 4.0);
        let second = take_stage(&mut c, executor, 2.0);
        assert!(matches!(c.request_work(executor, 0.0, 2), WorkResponse::Wait));

        c.report(executor, first.stage_id, &StageOutcome::Finished);
        let third = take_stage(&mut c, executor, 2.0);
        c.report(executor, second.stage_id, &StageOutcome::Finished);
        c.report(executor, third.stage_id, &StageOutcome::Finished);
        assert_eq!(c.status().finished, 3);
    }

    #[test]
    fn out_of_order_heartbeats_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = coordinator(chain_dag(&["a"], 1.0), dir.path());
        let executor = c.register_executor("node01".to_string(), 4.0, 4);

        assert!(c.heartbeat(executor, 5, 1.0));
        assert!(c.heartbeat(executor, 3, 9.0));
        // The stale heartbeat's resident memory was not recorded.
        // (seq 5 carried 1.0)
        assert!(c.heartbeat(executor, 6, 2.0));
        assert!(!c.heartbeat(uuid::Uuid::new_v4(), 1, 0.0));
    }

    #[test]
    fn verification_hook_registers_followup_stage() {
        let dir = tempfile::tempdir().unwrap();
        let mut dag = StageDag::new();
        let tpl = stage("nlin", 1.0)
            .with_outputs(vec!["out.mnc".into()])
            .with_hook(StageAction::EmitVerificationImage {
                tool: "mincpik".to_string(),
                output: "verify/nlin.png".into(),
            });
        dag.add_stage(tpl);
        let mut c = coordinator(dag, dir.path());
        let executor = c.register_executor("node01".to_string(), 4.0, 4);

        let nlin = take_stage(&mut c, executor, 4.0);
        assert!(c.report(executor, nlin.stage_id, &StageOutcome::Finished));

        // The followup exists, is runnable, and runs the snapshot tool.
        assert_eq!(c.status().total, 2);
        let verify = take_stage(&mut c, executor, 4.0);
        assert_eq!(verify.name, "nlin-verify");
        assert_eq!(verify.command[0], "mincpik");
        assert!(c.report(executor, verify.stage_id, &StageOutcome::Finished));
        assert!(c.is_draining());
    }

    #[test]
    fn failing_completion_action_triggers_retry() {
        let dir = tempfile::tempdir().unwrap();
        let mut dag = StageDag::new();
        // No outputs: the verification hook cannot resolve a source image.
        let tpl = stage("nlin", 1.0).with_hook(StageAction::EmitVerificationImage {
            tool: "mincpik".to_string(),
            output: "verify/nlin.png".into(),
        });
        dag.add_stage(tpl);
        let mut c = coordinator(dag, dir.path());
        let executor = c.register_executor("node01".to_string(), 4.0, 4);

        let nlin = take_stage(&mut c, executor, 4.0);
        assert!(c.report(executor, nlin.stage_id, &StageOutcome::Finished));

        let stage = c.dag().stage(nlin.stage_id).unwrap();
        assert_eq!(stage.status, StageStatus::Runnable);
        assert_eq!(stage.retries, 1);
    }

    #[test]
    fn executor_memory_request_tracks_largest_runnable() {
        let dir = tempfile::tempdir().unwrap();
        let mut dag = StageDag::new();
        dag.add_stage(stage("small", 0.5));
        dag.add_stage(stage("medium", 6.0));
        let c = coordinator(dag, dir.path());
        assert!((c.executor_memory_request().unwrap() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn executor_memory_request_rejects_unsatisfiable_stage() {
        let dir = tempfile::tempdir().unwrap();
        let mut dag = StageDag::new();
        dag.add_stage(stage("huge", 64.0));
        let c = coordinator(dag, dir.path());
        assert!(matches!(
            c.executor_memory_request(),
            Err(SchedulerError::InsufficientResources { .. })
        ));
    }
}
