use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{RelayError, Result};
use crate::job::{Job, JobSpec, JobStatus};
use crate::store::{JobChange, JobFilter, JobStore, MemoryJobStore, ProgressUpdate};

#[derive(Serialize, Deserialize)]
struct StoreFile {
    jobs: Vec<Job>,
}

/// Job store that survives restarts.
///
/// Jobs are served from memory and the whole set is written to a JSON file
/// after every mutation, through a temporary file and a rename. Writes are
/// serialized, so the file always holds the latest committed state. A
/// mutation whose write fails returns the error but stays applied in memory.
pub struct FileJobStore {
    inner: MemoryJobStore,
    path: PathBuf,
    write: Mutex<()>,
}

impl FileJobStore {
    /// Load the jobs stored at `path`. A missing file starts an empty store.
    pub async fn open(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = path.into();
        let jobs = match tokio::fs::read_to_string(&path).await {
            Ok(data) => {
                serde_json::from_str::<StoreFile>(&data)
                    .map_err(|e| RelayError::Store(format!("{}: {}", path.display(), e)))?
                    .jobs
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(path = %path.display(), jobs = jobs.len(), "Job store loaded");

        Ok(Self {
            inner: MemoryJobStore::with_clock(clock).with_jobs(jobs),
            path,
            write: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> usize {
        self.inner.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.is_empty().await
    }

    /// Drop terminal jobs that finished before `before`.
    pub async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize> {
        let removed = self.inner.purge_finished(before).await;
        if removed > 0 {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn persist(&self) -> Result<()> {
        let _write = self.write.lock().await;
        let file = StoreFile {
            jobs: self.inner.snapshot().await,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(&file)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn persisted(&self, result: Result<Job>) -> Result<Job> {
        let job = result?;
        if let Err(e) = self.persist().await {
            tracing::error!(
                job_id = %job.id,
                path = %self.path.display(),
                error = %e,
                "Failed to persist job store"
            );
            return Err(e);
        }
        Ok(job)
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn create(&self, spec: JobSpec) -> Result<Job> {
        self.persisted(self.inner.create(spec).await).await
    }

    async fn get(&self, id: Uuid) -> Result<Job> {
        self.inner.get(id).await
    }

    async fn list(&self, filter: &JobFilter) -> Vec<Job> {
        self.inner.list(filter).await
    }

    async fn update_progress(&self, id: Uuid, update: ProgressUpdate) -> Result<Job> {
        self.persisted(self.inner.update_progress(id, update).await)
            .await
    }

    async fn set_total(&self, id: Uuid, total_units: u64) -> Result<Job> {
        self.persisted(self.inner.set_total(id, total_units).await)
            .await
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<Job> {
        self.persisted(self.inner.set_status(id, status, error_message).await)
            .await
    }

    async fn request_cancel(&self, id: Uuid) -> Result<Job> {
        self.persisted(self.inner.request_cancel(id).await).await
    }

    async fn claim(&self, id: Uuid, holder: &str, ttl: Duration) -> Result<Job> {
        self.persisted(self.inner.claim(id, holder, ttl).await).await
    }

    async fn release(&self, id: Uuid, holder: &str) -> Result<Job> {
        self.persisted(self.inner.release(id, holder).await).await
    }

    async fn restart(&self, id: Uuid) -> Result<Job> {
        self.persisted(self.inner.restart(id).await).await
    }

    async fn active_count(&self) -> usize {
        self.inner.active_count().await
    }

    fn subscribe(&self) -> broadcast::Receiver<JobChange> {
        self.inner.subscribe()
    }
}
