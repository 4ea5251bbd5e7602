//! `pydpiper executor`: run a worker agent against a pipeline server.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::config::{self, SettingsOverrides};
use crate::executor::{self, ExecutorOptions};
use crate::rpc;
use crate::utils;

#[allow(clippy::too_many_arguments)]
pub async fn execute(
    uri: Option<String>,
    work_dir: PathBuf,
    mem: Option<f64>,
    cores: Option<u32>,
    greedy: bool,
    start_delay: u64,
    idle_timeout: Option<u64>,
    walltime: Option<u64>,
) -> anyhow::Result<()> {
    let settings = config::load_settings(SettingsOverrides::default())?;

    let uri = match uri {
        Some(raw) => Url::parse(&raw)?,
        None => rpc::read_uri_file(&work_dir)?,
    };

    let cores = cores
        .or((settings.cores > 0).then_some(settings.cores))
        .unwrap_or_else(utils::detect_cores);

    // Never declare more memory than the host physically has, even if the
    // site config allows it.
    let options = ExecutorOptions {
        uri,
        total_memory_gb: mem.unwrap_or_else(|| settings.mem.min(utils::total_memory_gb())),
        cores,
        greedy: greedy || settings.greedy,
        idle_timeout: idle_timeout
            .map(|mins| Duration::from_secs(mins * 60))
            .unwrap_or_else(|| settings.idle_timeout()),
        start_delay: Duration::from_secs(start_delay * 60),
        walltime: walltime.map(|mins| Duration::from_secs(mins * 60)),
        work_dir,
    };
    executor::run(options).await?;
    Ok(())
}
