//! `pydpiper serve`: build the DAG, start the server, run to completion.

use std::path::PathBuf;

use crate::config::{self, SettingsOverrides};
use crate::dag::StageDag;
use crate::models::PipelineFile;
use crate::scheduler::Coordinator;
use crate::server::{self, ServeOptions};

pub async fn execute(
    pipeline: PathBuf,
    work_dir: PathBuf,
    port: u16,
    num_executors: u32,
    overrides: SettingsOverrides,
) -> anyhow::Result<()> {
    let settings = config::load_settings(overrides)?;
    let file = PipelineFile::load(&pipeline)?;
    let dag = StageDag::from_templates(&file.stages)?;
    tracing::info!(
        pipeline = %file.name,
        stages = dag.len(),
        queue = settings.queue_type.as_str(),
        "built pipeline DAG"
    );

    std::fs::create_dir_all(&work_dir)?;
    let coordinator = Coordinator::new(file.name, dag, settings, &work_dir)?;
    let outcome = server::serve(coordinator, ServeOptions { port, num_executors }).await?;

    println!("{}", outcome.status);
    if let Some(fatal) = &outcome.fatal {
        anyhow::bail!("pipeline aborted: {}", fatal);
    }
    if !outcome.failed_stages.is_empty() {
        for name in &outcome.failed_stages {
            println!("failed: {}", name);
        }
        anyhow::bail!(
            "{} of {} stages failed",
            outcome.failed_stages.len(),
            outcome.status.total
        );
    }
    Ok(())
}
