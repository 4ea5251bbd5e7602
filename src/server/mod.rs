//! The pipeline server: RPC surface plus the run lifecycle around the
//! coordinator.
//!
//! The server binds one listener and serves every executor from that
//! single acceptor. Background tasks handle liveness reaping and the
//! periodic status line; the main loop watches for completion and for an
//! interrupt, both of which end in the same drain.

mod handlers;
mod routes;

pub use routes::create_router;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::backup;
use crate::rpc::StatusResponse;
use crate::scheduler::Coordinator;
use crate::submit::{self, LaunchSpec};

/// How often the main loop polls for completion.
const COMPLETION_POLL: Duration = Duration::from_millis(500);

/// How often the periodic status line is logged.
const STATUS_LINE_INTERVAL: Duration = Duration::from_secs(60);

/// Shared state behind every RPC handler.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Mutex<Coordinator>>,
}

/// Options for one server run.
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    /// Port to listen on; 0 picks an ephemeral port.
    pub port: u16,
    /// Executors to launch on the configured substrate after startup.
    pub num_executors: u32,
}

/// Final result of a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub status: StatusResponse,
    pub failed_stages: Vec<String>,
    pub fatal: Option<String>,
}

impl PipelineOutcome {
    pub fn succeeded(&self) -> bool {
        self.failed_stages.is_empty() && self.fatal.is_none()
    }
}

/// Run the pipeline server until the DAG drains and every executor is
/// gone.
pub async fn serve(coordinator: Coordinator, options: ServeOptions) -> anyhow::Result<PipelineOutcome> {
    let settings = coordinator.settings().clone();
    let work_dir = coordinator.work_dir().to_path_buf();
    let pipeline_name = coordinator.pipeline_name().to_string();
    let already_complete = coordinator.is_complete();

    let coordinator = Arc::new(Mutex::new(coordinator));
    let app = create_router(AppState {
        coordinator: coordinator.clone(),
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", options.port)).await?;
    let port = listener.local_addr()?.port();
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    let uri = url::Url::parse(&format!("http://{}:{}/", host, port))?;

    let backups = backup::backup_dir(&work_dir);
    std::fs::create_dir_all(&backups)?;
    std::fs::write(backup::uri_file(&work_dir), format!("{}\n", uri))?;
    tracing::info!(pipeline = %pipeline_name, %uri, "pipeline server listening");

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            })
            .await
    });

    // Liveness reaper: executors silent past the latency tolerance lose
    // their record and their in-flight stages go back on the frontier.
    let reaper = {
        let coordinator = coordinator.clone();
        let period = reap_period(settings.latency_tolerance());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                coordinator.lock().await.reap_lost_executors();
            }
        })
    };

    let status_task = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_LINE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip the immediate first tick; startup already logs.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let status = coordinator.lock().await.status();
                tracing::info!("{}", status);
            }
        })
    };

    // Launch executors once the server is accepting, unless the run was
    // fully resumed from the completion log and there is nothing to do.
    if options.num_executors > 0 && !already_complete {
        let request = {
            let c = coordinator.lock().await;
            c.executor_memory_request()
        };
        match request {
            Ok(memory_gb) => {
                let launcher = submit::launcher_for(settings.queue_type, &settings);
                let cores = effective_cores(settings.cores);
                for index in 0..options.num_executors {
                    let spec = LaunchSpec {
                        uri: uri.clone(),
                        memory_gb,
                        cores,
                        greedy: settings.greedy,
                        work_dir: work_dir.clone(),
                        pipeline_name: pipeline_name.clone(),
                        start_delay_mins: submit::start_delay_for(
                            settings.queue_type,
                            settings.executor_start_delay,
                        ),
                        index,
                    };
                    if let Err(err) = launcher.launch(&spec).await {
                        tracing::error!("could not launch executor {}: {}", index, err);
                        coordinator
                            .lock()
                            .await
                            .initiate_drain("executor launch failure");
                        break;
                    }
                }
            }
            Err(err) => {
                let mut c = coordinator.lock().await;
                c.set_fatal(err.to_string());
            }
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                coordinator.lock().await.initiate_drain("interrupt");
            }
            _ = tokio::time::sleep(COMPLETION_POLL) => {
                if coordinator.lock().await.is_complete() {
                    break;
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    reaper.abort();
    status_task.abort();
    if let Err(err) = server.await {
        if !err.is_cancelled() {
            tracing::error!("server task ended abnormally: {}", err);
        }
    }

    let c = coordinator.lock().await;
    let outcome = PipelineOutcome {
        status: c.status(),
        failed_stages: c.failed_stage_names(),
        fatal: c.fatal_error().map(String::from),
    };
    tracing::info!("{}", outcome.status);
    if let Some(fatal) = &outcome.fatal {
        tracing::error!("pipeline aborted: {}", fatal);
    } else if !outcome.failed_stages.is_empty() {
        tracing::error!(
            "{} stages failed: {}",
            outcome.failed_stages.len(),
            outcome.failed_stages.join(", ")
        );
    }
    Ok(outcome)
}

/// Reap at a quarter of the tolerance so a lost executor is noticed well
/// within one tolerance window, with a floor for test-sized tolerances.
fn reap_period(tolerance: Duration) -> Duration {
    (tolerance / 4).max(Duration::from_secs(1))
}

fn effective_cores(configured: u32) -> u32 {
    if configured > 0 {
        configured
    } else {
        crate::utils::detect_cores()
    }
}
