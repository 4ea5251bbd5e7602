//! Stage models for the pipeline DAG.
//!
//! A stage is one external-command execution: a command vector, its input
//! and output files, a memory estimate in gigabytes, and optional hook
//! actions the scheduler evaluates before dispatch and after success.
//! Stages are built once and never structurally mutated afterwards; only
//! the status and retry counter change at runtime.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::fingerprint::{Fingerprint, FingerprintBuilder};

/// Index of a stage inside its DAG.
pub type StageId = u32;

/// How many times a failed stage is put back on the runnable frontier
/// before it is declared permanently failed. Two retries absorb the NFS
/// races seen on cluster filesystems without masking real breakage.
pub const MAX_RETRIES: u32 = 2;

/// Scheduling state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    NotStarted,
    Runnable,
    Running,
    Finished,
    Failed,
    /// In flight on an executor that stopped heartbeating. Transient: the
    /// scheduler immediately requeues or fails the stage.
    Lost,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Runnable => "runnable",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Lost => "lost",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// Why a stage ended up failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// The command exited non-zero or was killed, as reported by the
    /// executor. Carries the captured exit cause.
    Command(String),
    /// A predecessor failed permanently. Never retried.
    DependencyFailed,
    /// The owning executor stopped heartbeating with the stage in flight.
    ExecutorLost,
    /// A completion-time hook action failed.
    Action(String),
}

impl FailureCause {
    pub fn describe(&self) -> String {
        match self {
            Self::Command(cause) => cause.clone(),
            Self::DependencyFailed => "dependency failed".to_string(),
            Self::ExecutorLost => "executor lost".to_string(),
            Self::Action(cause) => format!("completion action failed: {}", cause),
        }
    }
}

/// Hook actions evaluated by the scheduler around a stage's lifecycle.
///
/// These replace arbitrary in-process callbacks with a closed set of
/// behaviors the scheduler knows how to interpret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StageAction {
    /// Before first dispatch: recompute the memory estimate from the
    /// current total size of the stage's input files.
    RecomputeMemory { gb_per_input_gb: f64, base_gb: f64 },
    /// After success: register a followup stage that renders a small
    /// verification image of the stage's first output.
    EmitVerificationImage { tool: String, output: PathBuf },
    /// After success: register an arbitrary followup stage depending on
    /// this one.
    RegisterFollowup { stage: StageTemplate },
}

impl StageAction {
    /// Whether this action runs before dispatch rather than after success.
    pub fn is_runnable_time(&self) -> bool {
        matches!(self, Self::RecomputeMemory { .. })
    }
}

/// Builder-facing description of a stage, before it is inserted into a DAG.
///
/// `depends` names other templates in the same pipeline file; programmatic
/// builders wire dependencies through the DAG API instead and leave it
/// empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTemplate {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
    #[serde(default)]
    pub outputs: Vec<PathBuf>,
    /// Static memory estimate in gigabytes.
    #[serde(default = "default_memory_gb")]
    pub memory: f64,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub hooks: Vec<StageAction>,
}

fn default_memory_gb() -> f64 {
    1.0
}

impl StageTemplate {
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
            inputs: Vec::new(),
            outputs: Vec::new(),
            memory: default_memory_gb(),
            depends: Vec::new(),
            hooks: Vec::new(),
        }
    }

    pub fn with_memory(mut self, gb: f64) -> Self {
        self.memory = gb;
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<PathBuf>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<PathBuf>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_hook(mut self, hook: StageAction) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Compute the stable fingerprint of this template's semantics.
    ///
    /// Hashes the command vector, input and output paths, and the memory
    /// override. The stage name is deliberately excluded: renaming a stage
    /// must not force it to re-run.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut b = FingerprintBuilder::new();
        for arg in &self.command {
            b = b.field("argv", arg);
        }
        for input in &self.inputs {
            b = b.field("input", &input.to_string_lossy());
        }
        for output in &self.outputs {
            b = b.field("output", &output.to_string_lossy());
        }
        b.field("memory", &format!("{:.6}", self.memory)).finish()
    }
}

/// A stage inside a DAG, with its runtime state.
#[derive(Debug, Clone)]
pub struct Stage {
    pub id: StageId,
    pub name: String,
    pub command: Vec<String>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    memory_gb: f64,
    /// Set once the runnable-time hook has been evaluated; the recomputed
    /// estimate is then reused for every later dispatch attempt.
    memory_refreshed: bool,
    pub hooks: Vec<StageAction>,
    pub retries: u32,
    pub status: StageStatus,
    pub failure: Option<FailureCause>,
    fingerprint: Fingerprint,
}

impl Stage {
    pub fn from_template(id: StageId, template: StageTemplate) -> Self {
        let fingerprint = template.fingerprint();
        Self {
            id,
            name: template.name,
            command: template.command,
            inputs: template.inputs,
            outputs: template.outputs,
            memory_gb: template.memory,
            memory_refreshed: false,
            hooks: template.hooks,
            retries: 0,
            status: StageStatus::NotStarted,
            failure: None,
            fingerprint,
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Current memory estimate in gigabytes.
    pub fn memory_gb(&self) -> f64 {
        self.memory_gb
    }

    /// Evaluate the runnable-time memory hook, at most once per stage.
    ///
    /// Inputs that cannot be stat'ed contribute zero bytes; predecessors
    /// have finished by the time this runs, so a missing input means the
    /// command itself is going to fail and report through the normal path.
    pub fn refresh_memory(&mut self) {
        if self.memory_refreshed {
            return;
        }
        self.memory_refreshed = true;

        let hook = self.hooks.iter().find_map(|h| match h {
            StageAction::RecomputeMemory {
                gb_per_input_gb,
                base_gb,
            } => Some((*gb_per_input_gb, *base_gb)),
            _ => None,
        });
        let Some((per_gb, base)) = hook else {
            return;
        };

        let mut input_bytes: u64 = 0;
        for input in &self.inputs {
            match std::fs::metadata(input) {
                Ok(meta) => input_bytes += meta.len(),
                Err(err) => {
                    tracing::debug!("could not stat input {:?}: {}", input, err);
                }
            }
        }
        let input_gb = input_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        self.memory_gb = base + per_gb * input_gb;
        tracing::debug!(
            stage = %self.name,
            memory_gb = self.memory_gb,
            "recomputed memory estimate from input sizes"
        );
    }

    /// Completion-time hook actions, in declaration order.
    pub fn completion_actions(&self) -> impl Iterator<Item = &StageAction> {
        self.hooks.iter().filter(|h| !h.is_runnable_time())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(cmd: &[&str]) -> StageTemplate {
        StageTemplate::new("t", cmd.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn fingerprint_is_stable_across_builds() {
        let a = template(&["mincblur", "-fwhm", "0.5", "in.mnc"]).fingerprint();
        let b = template(&["mincblur", "-fwhm", "0.5", "in.mnc"]).fingerprint();
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_tracks_semantic_inputs() {
        let base = template(&["minctracc", "in.mnc"]);
        let fp = base.fingerprint();

        let mut gradient = base.clone();
        gradient.command.push("-gradient".to_string());
        assert_ne!(fp, gradient.fingerprint());

        let mem_override = base.clone().with_memory(8.0);
        assert_ne!(fp, mem_override.fingerprint());
    }

    #[test]
    fn fingerprint_ignores_name() {
        let a = template(&["true"]);
        let mut b = a.clone();
        b.name = "renamed".to_string();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn refresh_memory_uses_input_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("atlas.mnc");
        std::fs::write(&input, vec![0u8; 1024 * 1024]).unwrap();

        let tpl = template(&["mincANTS"])
            .with_inputs(vec![input])
            .with_memory(1.0)
            .with_hook(StageAction::RecomputeMemory {
                gb_per_input_gb: 1024.0,
                base_gb: 0.5,
            });
        let mut stage = Stage::from_template(0, tpl);
        stage.refresh_memory();

        // 1 MiB of input at 1024 GB per GB of input is 1 GB, plus the base.
        assert!((stage.memory_gb() - 1.5).abs() < 1e-9);

        // A second refresh must not re-evaluate.
        let first = stage.memory_gb();
        stage.refresh_memory();
        assert_eq!(first, stage.memory_gb());
    }

    #[test]
    fn refresh_memory_without_hook_keeps_static_estimate() {
        let mut stage = Stage::from_template(0, template(&["true"]).with_memory(2.5));
        stage.refresh_memory();
        assert!((stage.memory_gb() - 2.5).abs() < 1e-9);
    }
}
