use crate::error::ArtifactError;
use crate::utils::compact_timestamp;

use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_EXTENSION: &str = "mp3";

/// A recording to fetch once, after the per-call lock that produced it was released.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordingJob {
    pub call_id: Uuid,
    pub external_call_id: String,
    pub url: String,
}

/// Where the engine hands off recording jobs.
pub trait RecordingSink: Send + Sync {
    fn enqueue(&self, job: RecordingJob);
}

impl RecordingSink for mpsc::UnboundedSender<RecordingJob> {
    fn enqueue(&self, job: RecordingJob) {
        let call_id = job.external_call_id.clone();
        if self.send(job).is_err() {
            warn!(call_id = %call_id, "recording worker gone, download dropped");
        }
    }
}

#[derive(Clone, Debug)]
pub struct Downloader {
    http: reqwest::Client,
    dir: PathBuf,
}

impl Downloader {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Result<Self, ArtifactError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            dir: dir.into(),
        })
    }

    /// Fetch the recording and write it under the recordings dir; returns the local path.
    pub async fn download(
        &self,
        job: &RecordingJob,
        now: OffsetDateTime,
    ) -> Result<PathBuf, ArtifactError> {
        let response = self.http.get(&job.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ArtifactError::Status(status.as_u16()));
        }
        let bytes = response.bytes().await?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!(
            "call_{}_{}.{}",
            job.call_id,
            compact_timestamp(now),
            extension(&job.url)
        ));
        tokio::fs::write(&path, &bytes).await?;
        info!(
            call_id = %job.external_call_id,
            path = %path.display(),
            bytes = bytes.len(),
            "recording saved"
        );
        Ok(path)
    }
}

/// File extension of the URL path, ignoring the query string.
fn extension(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|url| {
            Path::new(url.path())
                .extension()
                .and_then(|ext| ext.to_str())
                .filter(|ext| {
                    !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric())
                })
                .map(str::to_ascii_lowercase)
        })
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}
