//! Launching executors on the supported compute substrates.
//!
//! The scheduler can run its own executors: as local child processes, or
//! as SGE/PBS batch jobs. The submission contract is the same everywhere:
//! the job's memory request comes from the largest runnable stage, the
//! resource variable name and parallel environment are site-configurable,
//! and the launched process is just `pydpiper executor` pointed at the
//! server URI. Site-specific wrapper scripts stay outside this crate.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::config::{QueueType, Settings};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("could not locate {binary} on PATH: {source}")]
    MissingBinary {
        binary: &'static str,
        source: which::Error,
    },
    #[error("could not resolve own executable path: {0}")]
    OwnExecutable(std::io::Error),
    #[error("could not spawn {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("{binary} rejected the submission: {stderr}")]
    Rejected { binary: &'static str, stderr: String },
}

/// Everything needed to start one executor.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub uri: Url,
    /// Memory request in gigabytes, derived from the runnable frontier.
    pub memory_gb: f64,
    pub cores: u32,
    pub greedy: bool,
    pub work_dir: PathBuf,
    pub pipeline_name: String,
    /// Minutes the executor waits before first contact. Zero for local
    /// executors, which start after the server is already accepting.
    pub start_delay_mins: u64,
    /// Ordinal of this executor within the run, for job and log names.
    pub index: u32,
}

impl LaunchSpec {
    /// Arguments for the `pydpiper executor` subcommand.
    fn executor_args(&self) -> Vec<String> {
        let mut args = vec![
            "executor".to_string(),
            "--uri".to_string(),
            self.uri.to_string(),
            "--mem".to_string(),
            format!("{}", self.memory_gb),
            "--cores".to_string(),
            self.cores.to_string(),
            "--work-dir".to_string(),
            self.work_dir.display().to_string(),
        ];
        if self.greedy {
            args.push("--greedy".to_string());
        }
        if self.start_delay_mins > 0 {
            args.push("--start-delay".to_string());
            args.push(self.start_delay_mins.to_string());
        }
        args
    }

    fn job_name(&self) -> String {
        format!("{}-executor-{}", self.pipeline_name, self.index)
    }

    fn job_log(&self) -> PathBuf {
        self.work_dir.join(format!("{}.out", self.job_name()))
    }
}

/// The start delay an executor launcher must honor: batch substrates
/// stagger startup so executors do not race a server that is still
/// loading its DAG; local executors are launched by the live server.
pub fn start_delay_for(queue: QueueType, configured_mins: u64) -> u64 {
    match queue {
        QueueType::Local => 0,
        QueueType::Sge | QueueType::Pbs => configured_mins,
    }
}

#[async_trait]
pub trait ExecutorLauncher: Send + Sync {
    fn substrate(&self) -> &'static str;
    async fn launch(&self, spec: &LaunchSpec) -> Result<(), SubmitError>;
}

pub fn launcher_for(queue: QueueType, settings: &Settings) -> Box<dyn ExecutorLauncher> {
    match queue {
        QueueType::Local => Box::new(LocalLauncher),
        QueueType::Sge => Box::new(SgeLauncher {
            mem_request_variable: settings.mem_request_variable.clone(),
            pe: settings.pe.clone(),
        }),
        QueueType::Pbs => Box::new(PbsLauncher {
            mem_request_variable: settings.mem_request_variable.clone(),
        }),
    }
}

/// Spawns executors as detached child processes on this host.
pub struct LocalLauncher;

#[async_trait]
impl ExecutorLauncher for LocalLauncher {
    fn substrate(&self) -> &'static str {
        "local"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<(), SubmitError> {
        let exe = std::env::current_exe().map_err(SubmitError::OwnExecutable)?;
        let log = std::fs::File::create(spec.job_log()).map_err(|source| SubmitError::Spawn {
            command: exe.display().to_string(),
            source,
        })?;
        let stderr = log.try_clone().map_err(|source| SubmitError::Spawn {
            command: exe.display().to_string(),
            source,
        })?;

        let child = tokio::process::Command::new(&exe)
            .args(spec.executor_args())
            .current_dir(&spec.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|source| SubmitError::Spawn {
                command: exe.display().to_string(),
                source,
            })?;
        tracing::info!(
            executor = spec.index,
            pid = child.id(),
            "launched local executor"
        );
        // Detached: the child outlives this handle and exits on its own
        // when the server drains it.
        Ok(())
    }
}

/// Submits executors through SGE's `qsub -b y`.
pub struct SgeLauncher {
    pub mem_request_variable: String,
    pub pe: Option<String>,
}

impl SgeLauncher {
    /// The qsub argument vector, up to but not including the executor
    /// command itself.
    fn qsub_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "-b".to_string(),
            "y".to_string(),
            "-cwd".to_string(),
            "-j".to_string(),
            "y".to_string(),
            "-N".to_string(),
            spec.job_name(),
            "-o".to_string(),
            spec.job_log().display().to_string(),
            "-l".to_string(),
            format!("{}={:.0}G", self.mem_request_variable, spec.memory_gb.ceil()),
        ];
        if let Some(pe) = &self.pe {
            args.push("-pe".to_string());
            args.push(pe.clone());
            args.push(spec.cores.to_string());
        }
        args
    }
}

#[async_trait]
impl ExecutorLauncher for SgeLauncher {
    fn substrate(&self) -> &'static str {
        "sge"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<(), SubmitError> {
        let qsub = which::which("qsub").map_err(|source| SubmitError::MissingBinary {
            binary: "qsub",
            source,
        })?;
        let exe = std::env::current_exe().map_err(SubmitError::OwnExecutable)?;

        let mut args = self.qsub_args(spec);
        args.push(exe.display().to_string());
        args.extend(spec.executor_args());

        let output = tokio::process::Command::new(&qsub)
            .args(&args)
            .current_dir(&spec.work_dir)
            .output()
            .await
            .map_err(|source| SubmitError::Spawn {
                command: qsub.display().to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(SubmitError::Rejected {
                binary: "qsub",
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        tracing::info!(executor = spec.index, "submitted SGE executor job");
        Ok(())
    }
}

/// Submits executors through PBS/Torque. PBS has no binary-submission
/// mode, so the job script arrives on qsub's stdin.
pub struct PbsLauncher {
    pub mem_request_variable: String,
}

impl PbsLauncher {
    fn qsub_args(&self, spec: &LaunchSpec) -> Vec<String> {
        vec![
            "-N".to_string(),
            spec.job_name(),
            "-j".to_string(),
            "oe".to_string(),
            "-o".to_string(),
            spec.job_log().display().to_string(),
            "-l".to_string(),
            format!(
                "nodes=1:ppn={},{}={:.0}gb",
                spec.cores,
                self.mem_request_variable,
                spec.memory_gb.ceil()
            ),
        ]
    }

    fn job_script(&self, spec: &LaunchSpec) -> Result<String, SubmitError> {
        let exe = std::env::current_exe().map_err(SubmitError::OwnExecutable)?;
        let mut command = vec![exe.display().to_string()];
        command.extend(spec.executor_args());
        Ok(format!(
            "cd {} && exec {}\n",
            spec.work_dir.display(),
            command.join(" ")
        ))
    }
}

#[async_trait]
impl ExecutorLauncher for PbsLauncher {
    fn substrate(&self) -> &'static str {
        "pbs"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<(), SubmitError> {
        let qsub = which::which("qsub").map_err(|source| SubmitError::MissingBinary {
            binary: "qsub",
            source,
        })?;
        let script = self.job_script(spec)?;

        let mut child = tokio::process::Command::new(&qsub)
            .args(self.qsub_args(spec))
            .current_dir(&spec.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SubmitError::Spawn {
                command: qsub.display().to_string(),
                source,
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(|source| SubmitError::Spawn {
                    command: qsub.display().to_string(),
                    source,
                })?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|source| SubmitError::Spawn {
                command: qsub.display().to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(SubmitError::Rejected {
                binary: "qsub",
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        tracing::info!(executor = spec.index, "submitted PBS executor job");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            uri: Url::parse("http://node01:8012/").unwrap(),
            memory_gb: 6.5,
            cores: 4,
            greedy: false,
            work_dir: PathBuf::from("/scratch/run"),
            pipeline_name: "mbm-nlin".to_string(),
            start_delay_mins: 10,
            index: 2,
        }
    }

    #[test]
    fn executor_args_carry_the_contract() {
        let args = spec().executor_args();
        assert_eq!(args[0], "executor");
        assert!(args.contains(&"--uri".to_string()));
        assert!(args.contains(&"http://node01:8012/".to_string()));
        assert!(args.contains(&"--mem".to_string()));
        assert!(args.contains(&"6.5".to_string()));
        assert!(args.contains(&"--start-delay".to_string()));
        assert!(!args.contains(&"--greedy".to_string()));

        let mut greedy = spec();
        greedy.greedy = true;
        greedy.start_delay_mins = 0;
        let args = greedy.executor_args();
        assert!(args.contains(&"--greedy".to_string()));
        assert!(!args.contains(&"--start-delay".to_string()));
    }

    #[test]
    fn sge_request_uses_configured_variable_and_pe() {
        let launcher = SgeLauncher {
            mem_request_variable: "vmem".to_string(),
            pe: Some("smp".to_string()),
        };
        let args = launcher.qsub_args(&spec());
        assert!(args.contains(&"vmem=7G".to_string()));
        let pe_pos = args.iter().position(|a| a == "-pe").unwrap();
        assert_eq!(args[pe_pos + 1], "smp");
        assert_eq!(args[pe_pos + 2], "4");
        assert!(args.contains(&"mbm-nlin-executor-2".to_string()));
    }

    #[test]
    fn sge_omits_pe_when_unconfigured() {
        let launcher = SgeLauncher {
            mem_request_variable: "mem".to_string(),
            pe: None,
        };
        let args = launcher.qsub_args(&spec());
        assert!(!args.contains(&"-pe".to_string()));
        assert!(args.contains(&"mem=7G".to_string()));
    }

    #[test]
    fn pbs_resource_list_is_single_flag() {
        let launcher = PbsLauncher {
            mem_request_variable: "vmem".to_string(),
        };
        let args = launcher.qsub_args(&spec());
        assert!(args.contains(&"nodes=1:ppn=4,vmem=7gb".to_string()));
    }

    #[test]
    fn local_executors_skip_the_start_delay() {
        assert_eq!(start_delay_for(QueueType::Local, 10), 0);
        assert_eq!(start_delay_for(QueueType::Sge, 10), 10);
        assert_eq!(start_delay_for(QueueType::Pbs, 7), 7);
    }
}
