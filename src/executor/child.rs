//! Child process management for stage execution.
//!
//! Each stage runs as a real OS process with stdout and stderr redirected
//! to a per-stage log file. The file starts with the command line and a
//! timestamp so a failed registration can be rerun by hand straight from
//! the log.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::Utc;
use tokio::process::Command;

use crate::rpc::{StageAssignment, StageOutcome};
use crate::utils::sanitize_filename;

/// Log file for one stage inside the executor's log directory.
pub fn stage_log_path(log_dir: &Path, assignment: &StageAssignment) -> PathBuf {
    log_dir.join(format!(
        "{}-{}.log",
        assignment.stage_id,
        sanitize_filename(&assignment.name)
    ))
}

/// Run one stage command to completion.
///
/// Never returns an error: every way the execution can go wrong becomes a
/// `Failed` outcome with the captured cause, reported to the scheduler
/// like any other stage failure.
pub async fn run_stage(assignment: &StageAssignment, log_dir: &Path) -> StageOutcome {
    let Some((program, args)) = assignment.command.split_first() else {
        return StageOutcome::Failed {
            cause: "empty command".to_string(),
        };
    };

    let log_path = stage_log_path(log_dir, assignment);
    let log = match open_log(&log_path, assignment) {
        Ok(file) => file,
        Err(err) => {
            return StageOutcome::Failed {
                cause: format!("could not open stage log {}: {}", log_path.display(), err),
            }
        }
    };
    let stderr_log = match log.try_clone() {
        Ok(file) => file,
        Err(err) => {
            return StageOutcome::Failed {
                cause: format!("could not clone stage log handle: {}", err),
            }
        }
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr_log))
        // If the executor is interrupted, the stage process dies with it.
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            return StageOutcome::Failed {
                cause: format!("could not spawn {}: {}", program, err),
            }
        }
    };

    match child.wait().await {
        Ok(status) if status.success() => StageOutcome::Finished,
        Ok(status) => StageOutcome::Failed {
            cause: describe_exit(status),
        },
        Err(err) => StageOutcome::Failed {
            cause: format!("could not wait for {}: {}", program, err),
        },
    }
}

fn open_log(path: &Path, assignment: &StageAssignment) -> std::io::Result<std::fs::File> {
    use std::io::Write;
    let mut file = std::fs::File::create(path)?;
    writeln!(file, "# stage: {}", assignment.name)?;
    writeln!(file, "# command: {}", assignment.command.join(" "))?;
    writeln!(file, "# started: {}", Utc::now().to_rfc3339())?;
    file.flush()?;
    Ok(file)
}

fn describe_exit(status: std::process::ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with status {}", code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("killed by signal {}", signal);
        }
    }
    "terminated abnormally".to_string()
}
