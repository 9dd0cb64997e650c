//! Resumable, verifiable file downloads with progress reporting.
//!
//! Each job streams into a `.part` file next to the target and resumes from
//! it via HTTP `Range`. Cancel and pause are level-triggered flags polled
//! between chunks. Job state is persisted as JSON so interrupted jobs can be
//! listed and resumed after restart.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::RegistryError;

/// Poll interval while a job is paused.
const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Download lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

/// Persistable state of one download job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJobState {
    pub job_id: String,
    pub status: DownloadStatus,
    pub target_url: String,
    pub target_path: PathBuf,
    pub partial_path: PathBuf,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl DownloadJobState {
    pub fn new(target_url: impl Into<String>, target_path: PathBuf) -> Self {
        let now = chrono::Utc::now();
        let partial_path = PathBuf::from(format!("{}.part", target_path.display()));
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            status: DownloadStatus::Pending,
            target_url: target_url.into(),
            target_path,
            partial_path,
            total_bytes: 0,
            downloaded_bytes: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Persists the job state as JSON under `jobs_dir/<job_id>.json`.
    pub fn save(&self, jobs_dir: &Path) -> Result<(), RegistryError> {
        std::fs::create_dir_all(jobs_dir)?;
        let path = jobs_dir.join(format!("{}.json", self.job_id));
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Loads a persisted job state.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Progress event emitted to subscribers between chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub job_id: String,
    pub status: DownloadStatus,
    /// 0.0 - 1.0; 0 when total is unknown.
    pub progress: f32,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub speed_bps: f64,
    pub eta_seconds: f64,
}

/// Level-triggered cancel/pause control shared with the download loop.
#[derive(Debug, Clone, Default)]
pub struct DownloadControl {
    cancel: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
}

impl DownloadControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }
}

/// Streams files to disk with resume, verification and progress.
///
/// **Interaction**: Driven by the model download flow after
/// `evaluate_download_policy` allows the fetch; sha256 mismatches delete the
/// downloaded file.
pub struct Downloader {
    http: reqwest::Client,
    jobs_dir: PathBuf,
}

impl Downloader {
    pub fn new(jobs_dir: PathBuf) -> Self {
        Self {
            http: reqwest::Client::new(),
            jobs_dir,
        }
    }

    /// Runs one download job to completion.
    ///
    /// Resumes from `job.partial_path` when it exists. Emits progress to
    /// `progress_tx` between chunks and persists job state transitions.
    pub async fn run(
        &self,
        job: &mut DownloadJobState,
        expected_sha256: Option<&str>,
        progress_tx: Option<mpsc::Sender<ProgressEvent>>,
        control: &DownloadControl,
    ) -> Result<(), RegistryError> {
        if let Some(parent) = job.target_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let resume_from = std::fs::metadata(&job.partial_path)
            .map(|m| m.len())
            .unwrap_or(0);
        if resume_from > 0 {
            info!(job_id = %job.job_id, resume_from, "resuming download from partial file");
        }

        let mut request = self.http.get(&job.target_url);
        if resume_from > 0 {
            request = request.header("Range", format!("bytes={resume_from}-"));
        }
        let response = request
            .send()
            .await
            .map_err(|e| RegistryError::Download(e.to_string()))?;
        if !response.status().is_success() {
            job.status = DownloadStatus::Failed;
            job.error = Some(format!("HTTP {}", response.status()));
            job.updated_at = chrono::Utc::now();
            job.save(&self.jobs_dir)?;
            return Err(RegistryError::Download(format!(
                "HTTP {} from {}",
                response.status(),
                job.target_url
            )));
        }

        // 206 means the server honored the range; anything else restarts.
        let resumed = response.status() == reqwest::StatusCode::PARTIAL_CONTENT;
        let mut downloaded = if resumed { resume_from } else { 0 };
        job.total_bytes = downloaded + response.content_length().unwrap_or(0);
        job.status = DownloadStatus::Downloading;
        job.downloaded_bytes = downloaded;
        job.updated_at = chrono::Utc::now();
        job.save(&self.jobs_dir)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(resumed)
            .write(true)
            .truncate(!resumed)
            .open(&job.partial_path)
            .await
            .map_err(RegistryError::Io)?;

        let started = Instant::now();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            if control.is_cancelled() {
                info!(job_id = %job.job_id, "download cancelled");
                job.status = DownloadStatus::Cancelled;
                job.updated_at = chrono::Utc::now();
                job.save(&self.jobs_dir)?;
                return Err(RegistryError::Cancelled);
            }
            while control.is_paused() {
                if job.status != DownloadStatus::Paused {
                    job.status = DownloadStatus::Paused;
                    job.updated_at = chrono::Utc::now();
                    job.save(&self.jobs_dir)?;
                }
                if control.is_cancelled() {
                    job.status = DownloadStatus::Cancelled;
                    job.save(&self.jobs_dir)?;
                    return Err(RegistryError::Cancelled);
                }
                tokio::time::sleep(PAUSE_POLL).await;
            }
            if job.status == DownloadStatus::Paused {
                job.status = DownloadStatus::Downloading;
            }

            let chunk = chunk.map_err(|e| RegistryError::Download(e.to_string()))?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            job.downloaded_bytes = downloaded;

            if let Some(tx) = &progress_tx {
                let elapsed = started.elapsed().as_secs_f64().max(0.001);
                let speed = (downloaded.saturating_sub(resume_from)) as f64 / elapsed;
                let remaining = job.total_bytes.saturating_sub(downloaded);
                let _ = tx.try_send(ProgressEvent {
                    job_id: job.job_id.clone(),
                    status: job.status,
                    progress: if job.total_bytes > 0 {
                        downloaded as f32 / job.total_bytes as f32
                    } else {
                        0.0
                    },
                    downloaded_bytes: downloaded,
                    total_bytes: job.total_bytes,
                    speed_bps: speed,
                    eta_seconds: if speed > 0.0 {
                        remaining as f64 / speed
                    } else {
                        0.0
                    },
                });
            }
        }
        file.flush().await?;
        drop(file);

        if let Some(expected) = expected_sha256 {
            job.status = DownloadStatus::Verifying;
            job.updated_at = chrono::Utc::now();
            job.save(&self.jobs_dir)?;
            let actual = sha256_file(&job.partial_path)?;
            if !actual.eq_ignore_ascii_case(expected) {
                warn!(job_id = %job.job_id, expected, %actual, "checksum mismatch; deleting download");
                std::fs::remove_file(&job.partial_path).ok();
                job.status = DownloadStatus::Failed;
                job.error = Some("sha256 mismatch".into());
                job.save(&self.jobs_dir)?;
                return Err(RegistryError::ChecksumMismatch {
                    path: job.target_path.clone(),
                    expected: expected.to_string(),
                    actual,
                });
            }
            debug!(job_id = %job.job_id, "checksum verified");
        }

        std::fs::rename(&job.partial_path, &job.target_path)?;
        job.status = DownloadStatus::Completed;
        job.updated_at = chrono::Utc::now();
        job.save(&self.jobs_dir)?;
        info!(job_id = %job.job_id, path = %job.target_path.display(), bytes = downloaded, "download complete");
        Ok(())
    }
}

fn sha256_file(path: &Path) -> Result<String, RegistryError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}
