//! Executor agent: the worker process that runs stages.
//!
//! The agent is deliberately thin. It registers, keeps a heartbeat task
//! alive, and loops over request-work / run / report, holding up to its
//! core count of concurrent stage processes whose memory estimates sum
//! against its declared total. All policy lives on the server; the only
//! decisions made here are "do I have capacity" and "is it time to die".

mod child;

pub use child::{run_stage, stage_log_path};

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use url::Url;

use crate::models::{ExecutorId, StageId};
use crate::rpc::{
    HeartbeatRequest, RegisterRequest, ReportRequest, RpcError, SchedulerClient, StageOutcome,
    WorkRequest, WorkResponse,
};
use crate::utils;

/// Delay between work requests while the server has nothing that fits.
const WORK_POLL: Duration = Duration::from_secs(5);

/// Delay between report attempts after a rejected or failed report.
const REPORT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Consecutive transport failures before the executor concludes the
/// server is gone and exits. Idling forever on a dead server would hold a
/// batch slot for the full walltime.
const MAX_TRANSPORT_FAILURES: u32 = 5;

/// Safety margin subtracted from the walltime: stop taking work this long
/// before the batch system would kill us mid-stage.
const WALLTIME_MARGIN: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("executor i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lost contact with the pipeline server")]
    ServerUnreachable,
}

/// Configuration for one executor process.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub uri: Url,
    /// Memory allotment in gigabytes declared to the scheduler.
    pub total_memory_gb: f64,
    /// Maximum concurrent stage processes.
    pub cores: u32,
    /// Run one stage at a time using the full allotment.
    pub greedy: bool,
    /// Drain after this long without receiving any work.
    pub idle_timeout: Duration,
    /// Wait before first contact; batch substrates stagger startup.
    pub start_delay: Duration,
    /// Batch walltime, if running under one; triggers a proactive drain.
    pub walltime: Option<Duration>,
    pub work_dir: PathBuf,
}

/// Run the executor agent until drained, interrupted, or orphaned.
pub async fn run(options: ExecutorOptions) -> Result<(), ExecutorError> {
    if !options.start_delay.is_zero() {
        tracing::info!(
            delay_secs = options.start_delay.as_secs(),
            "waiting out the start delay before contacting the server"
        );
        tokio::time::sleep(options.start_delay).await;
    }

    let client = SchedulerClient::new(options.uri.clone())?;
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());

    let registration = client
        .register_with_retry(&RegisterRequest {
            host,
            total_memory_gb: options.total_memory_gb,
            cores: options.cores,
        })
        .await?;
    let executor_id = registration.executor_id;
    tracing::info!(
        executor = %executor_id,
        pipeline = %registration.pipeline_name,
        memory_gb = options.total_memory_gb,
        cores = options.cores,
        "registered with pipeline server"
    );

    let log_dir = options
        .work_dir
        .join(format!("{}-executor-logs", registration.pipeline_name));
    std::fs::create_dir_all(&log_dir)?;

    let (drain_tx, drain_rx) = watch::channel(false);
    let heartbeat = tokio::spawn(heartbeat_loop(
        client.clone(),
        executor_id,
        Duration::from_secs(registration.heartbeat_interval_secs.max(1)),
        drain_tx,
    ));

    let result = work_loop(&client, executor_id, &options, &log_dir, drain_rx).await;
    heartbeat.abort();
    result
}

/// Periodic heartbeat carrying resident memory. Signals a drain when the
/// server stops recognizing us or stops answering.
async fn heartbeat_loop(
    client: SchedulerClient,
    executor_id: ExecutorId,
    interval: Duration,
    drain_tx: watch::Sender<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut seq = 0u64;
    let mut failures = 0u32;
    loop {
        ticker.tick().await;
        seq += 1;
        let request = HeartbeatRequest {
            executor_id,
            seq,
            resident_memory_gb: utils::resident_memory_gb(),
        };
        match client.heartbeat(&request).await {
            Ok(resp) if resp.known => {
                failures = 0;
            }
            Ok(_) => {
                tracing::warn!("server no longer tracks this executor, draining");
                let _ = drain_tx.send(true);
                return;
            }
            Err(err) => {
                failures += 1;
                tracing::warn!(failures, "heartbeat failed: {}", err);
                if failures >= MAX_TRANSPORT_FAILURES {
                    let _ = drain_tx.send(true);
                    return;
                }
            }
        }
    }
}

/// Free resources to offer the scheduler, given current commitments.
fn free_capacity(
    greedy: bool,
    total_memory_gb: f64,
    cores: u32,
    running: usize,
    reserved_gb: f64,
) -> (f64, u32) {
    if greedy {
        if running == 0 {
            (total_memory_gb, cores.max(1))
        } else {
            (0.0, 0)
        }
    } else {
        let free_cores = cores.saturating_sub(running as u32);
        ((total_memory_gb - reserved_gb).max(0.0), free_cores)
    }
}

async fn work_loop(
    client: &SchedulerClient,
    executor_id: ExecutorId,
    options: &ExecutorOptions,
    log_dir: &std::path::Path,
    mut drain_rx: watch::Receiver<bool>,
) -> Result<(), ExecutorError> {
    let mut children: JoinSet<(StageId, f64, StageOutcome)> = JoinSet::new();
    let mut reserved_gb = 0.0f64;
    let started = Instant::now();
    let mut idle_since = Instant::now();
    let mut draining = false;
    let mut transport_failures = 0u32;

    loop {
        if !draining {
            if *drain_rx.borrow() {
                draining = true;
            } else if let Some(walltime) = options.walltime {
                if started.elapsed() + WALLTIME_MARGIN >= walltime {
                    tracing::info!("walltime nearly exhausted, draining");
                    draining = true;
                }
            }
        }
        if !draining && children.is_empty() && idle_since.elapsed() >= options.idle_timeout {
            tracing::info!(
                idle_secs = options.idle_timeout.as_secs(),
                "no work received within the idle timeout, draining"
            );
            draining = true;
        }

        if draining && children.is_empty() {
            break;
        }

        if !draining {
            let (free_gb, free_cores) = free_capacity(
                options.greedy,
                options.total_memory_gb,
                options.cores,
                children.len(),
                reserved_gb,
            );
            if free_cores > 0 && free_gb > 0.0 {
                match client
                    .request_work(&WorkRequest {
                        executor_id,
                        free_memory_gb: free_gb,
                        free_cores,
                    })
                    .await
                {
                    Ok(WorkResponse::Stage { assignment }) => {
                        transport_failures = 0;
                        idle_since = Instant::now();
                        reserved_gb += assignment.memory_gb;
                        tracing::info!(
                            stage = %assignment.name,
                            memory_gb = assignment.memory_gb,
                            "running stage"
                        );
                        let dir = log_dir.to_path_buf();
                        children.spawn(async move {
                            let stage_id = assignment.stage_id;
                            let memory_gb = assignment.memory_gb;
                            let outcome = child::run_stage(&assignment, &dir).await;
                            (stage_id, memory_gb, outcome)
                        });
                        // Try to fill remaining capacity immediately.
                        continue;
                    }
                    Ok(WorkResponse::Wait) => {
                        transport_failures = 0;
                    }
                    Ok(WorkResponse::Shutdown) => {
                        tracing::info!("server requested shutdown");
                        draining = true;
                        continue;
                    }
                    Err(err) => {
                        transport_failures += 1;
                        tracing::warn!(transport_failures, "work request failed: {}", err);
                        if transport_failures >= MAX_TRANSPORT_FAILURES {
                            children.shutdown().await;
                            return Err(ExecutorError::ServerUnreachable);
                        }
                    }
                }
            }
        }

        tokio::select! {
            Some(joined) = children.join_next(), if !children.is_empty() => {
                match joined {
                    Ok((stage_id, memory_gb, outcome)) => {
                        reserved_gb = (reserved_gb - memory_gb).max(0.0);
                        idle_since = Instant::now();
                        if let StageOutcome::Failed { cause } = &outcome {
                            tracing::warn!(stage_id, %cause, "stage failed");
                        }
                        report_outcome(client, executor_id, stage_id, outcome).await?;
                    }
                    Err(err) => {
                        tracing::error!("stage task aborted: {}", err);
                    }
                }
            }
            _ = tokio::time::sleep(WORK_POLL) => {}
            _ = drain_rx.changed() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupted: killing stage processes");
                children.shutdown().await;
                return Ok(());
            }
        }
    }

    tracing::info!("executor drained, exiting");
    Ok(())
}

/// Deliver one stage outcome at least once.
///
/// A rejected report means the scheduler could not persist the completion;
/// the stage is still RUNNING on its books and this executor keeps
/// re-reporting until the write goes through. Transport failures are
/// bounded: a dead server ends the executor, and the scheduler's liveness
/// reaping requeues the work elsewhere.
async fn report_outcome(
    client: &SchedulerClient,
    executor_id: ExecutorId,
    stage_id: StageId,
    outcome: StageOutcome,
) -> Result<(), ExecutorError> {
    let request = ReportRequest {
        executor_id,
        stage_id,
        outcome,
    };
    let mut transport_failures = 0u32;
    loop {
        match client.report(&request).await {
            Ok(resp) if resp.accepted => return Ok(()),
            Ok(_) => {
                tracing::warn!(stage_id, "server could not persist completion, re-reporting");
                tokio::time::sleep(REPORT_RETRY_DELAY).await;
            }
            Err(err) => {
                transport_failures += 1;
                tracing::warn!(transport_failures, "report failed: {}", err);
                if transport_failures >= MAX_TRANSPORT_FAILURES {
                    return Err(ExecutorError::ServerUnreachable);
                }
                tokio::time::sleep(REPORT_RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_sums_memory_against_the_allotment() {
        let (gb, cores) = free_capacity(false, 8.0, 4, 2, 5.0);
        assert!((gb - 3.0).abs() < 1e-9);
        assert_eq!(cores, 2);

        let (gb, cores) = free_capacity(false, 8.0, 4, 4, 8.0);
        assert!((gb - 0.0).abs() < 1e-9);
        assert_eq!(cores, 0);
    }

    #[test]
    fn greedy_offers_everything_or_nothing() {
        let (gb, cores) = free_capacity(true, 8.0, 4, 0, 0.0);
        assert!((gb - 8.0).abs() < 1e-9);
        assert_eq!(cores, 4);

        let (gb, cores) = free_capacity(true, 8.0, 4, 1, 8.0);
        assert!((gb - 0.0).abs() < 1e-9);
        assert_eq!(cores, 0);
    }
}
