use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{RelayError, Result};
use crate::worker::chunk::{ChunkReport, ChunkRequest, ChunkWorker};

/// Something that can run one chunk of a job, locally or remotely.
#[async_trait]
pub trait ChunkInvoker: Send + Sync {
    async fn invoke(&self, request: ChunkRequest) -> Result<ChunkReport>;
}

#[async_trait]
impl ChunkInvoker for ChunkWorker {
    async fn invoke(&self, request: ChunkRequest) -> Result<ChunkReport> {
        self.run_tracked(request).await
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Invokes the chunk endpoint of a `chunk-relay` instance over HTTP.
///
/// The target must serve the same job records as the caller, which in
/// practice means the caller's own address: stores are not shared between
/// processes. `serve` resumes through its in-process worker and does not
/// use this invoker.
#[derive(Debug, Clone)]
pub struct RemoteInvoker {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteInvoker {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ChunkInvoker for RemoteInvoker {
    async fn invoke(&self, request: ChunkRequest) -> Result<ChunkReport> {
        let url = format!("{}/api/jobs/{}/chunks", self.base_url, request.job_id);
        tracing::debug!(url = %url, job_id = %request.job_id, "Invoking remote chunk");

        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<ChunkReport>().await?);
        }

        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        Err(RelayError::Remote(format!("{}: {}", status, message)))
    }
}
