//! HTTP client used by executors and the status command.
//!
//! Every call carries a timeout; an executor must never hang forever on a
//! dead server. Registration is the one call that retries internally,
//! because a batch-launched executor routinely comes up before the server
//! finishes loading a large DAG.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use super::{
    HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse, ReportRequest,
    ReportResponse, RpcError, StatusResponse, WorkRequest, WorkResponse,
};
use crate::backup;

/// Per-call timeout. Dispatch can sit behind a completion-log fsync, so
/// this is generous; liveness is the heartbeat's job, not the transport's.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long initial registration keeps retrying before the executor gives
/// up and exits.
pub const REGISTRATION_WINDOW: Duration = Duration::from_secs(180);

const REGISTRATION_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Read the server URI advertised under a working directory.
pub fn read_uri_file(work_dir: &Path) -> Result<Url, RpcError> {
    let path = backup::uri_file(work_dir);
    let text = std::fs::read_to_string(&path).map_err(|source| RpcError::UriFile {
        path: path.display().to_string(),
        source,
    })?;
    Ok(Url::parse(text.trim())?)
}

/// Client for the scheduler's RPC surface.
#[derive(Debug, Clone)]
pub struct SchedulerClient {
    http: reqwest::Client,
    base: Url,
}

impl SchedulerClient {
    pub fn new(base: Url) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { http, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    async fn post<Req, Resp>(&self, path: &str, req: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let url = self.base.join(path)?;
        let resp = self
            .http
            .post(url)
            .json(req)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse, RpcError> {
        self.post("register", req).await
    }

    /// Register, retrying on transport errors for up to
    /// [`REGISTRATION_WINDOW`]. The server being slow to accept is normal
    /// at startup; anything beyond the window means the run is not
    /// happening and the executor exits rather than idle forever.
    pub async fn register_with_retry(
        &self,
        req: &RegisterRequest,
    ) -> Result<RegisterResponse, RpcError> {
        let deadline = tokio::time::Instant::now() + REGISTRATION_WINDOW;
        loop {
            match self.register(req).await {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    if tokio::time::Instant::now() + REGISTRATION_RETRY_DELAY >= deadline {
                        tracing::error!("giving up on registration: {}", err);
                        return Err(RpcError::RegistrationTimeout(REGISTRATION_WINDOW.as_secs()));
                    }
                    tracing::debug!("registration attempt failed, retrying: {}", err);
                    tokio::time::sleep(REGISTRATION_RETRY_DELAY).await;
                }
            }
        }
    }

    pub async fn request_work(&self, req: &WorkRequest) -> Result<WorkResponse, RpcError> {
        self.post("request-work", req).await
    }

    pub async fn report(&self, req: &ReportRequest) -> Result<ReportResponse, RpcError> {
        self.post("report", req).await
    }

    pub async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatResponse, RpcError> {
        self.post("heartbeat", req).await
    }

    pub async fn status(&self) -> Result<StatusResponse, RpcError> {
        let url = self.base.join("status")?;
        let resp = self.http.get(url).send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let backups = backup::backup_dir(dir.path());
        std::fs::create_dir_all(&backups).unwrap();
        std::fs::write(backups.join(backup::URI_FILE), "http://node3:8012/\n").unwrap();

        let url = read_uri_file(dir.path()).unwrap();
        assert_eq!(url.as_str(), "http://node3:8012/");
    }

    #[test]
    fn missing_uri_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_uri_file(dir.path()),
            Err(RpcError::UriFile { .. })
        ));
    }
}
