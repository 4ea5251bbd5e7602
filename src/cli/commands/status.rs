//! `pydpiper status`: query a running pipeline server.

use std::path::PathBuf;

use url::Url;

use crate::rpc::{self, SchedulerClient};

pub async fn execute(uri: Option<String>, work_dir: PathBuf) -> anyhow::Result<()> {
    let uri = match uri {
        Some(raw) => Url::parse(&raw)?,
        None => rpc::read_uri_file(&work_dir)?,
    };
    let client = SchedulerClient::new(uri)?;
    let status = client.status().await?;

    println!("{}", status);
    println!("  total:    {}", status.total);
    println!("  finished: {}", status.finished);
    println!("  failed:   {}", status.failed);
    println!("  running:  {}", status.running);
    println!("  runnable: {}", status.runnable);
    Ok(())
}
