//! Persistent model catalog, download policy and downloads.
//!
//! The catalog is a JSON document (`models.json`) mapping model records to
//! pools and roles; it is written only through explicit CRUD operations.
//! Downloads are policy-gated: [`evaluate_download_policy`] runs before any
//! file fetch, and a consent requirement is a structured result rather than
//! an error.

mod catalog;
mod download;
mod policy;

pub use catalog::{ModelCatalog, ModelInfo, ModelPool, RegistryDoc, RoleAssignments};
pub use download::{
    DownloadControl, DownloadJobState, DownloadStatus, Downloader, ProgressEvent,
};
pub use policy::{evaluate_download_policy, PolicyDecision};

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use env_config::{DownloadPolicyConfig, ModelSettings};

/// Errors from catalog persistence and downloads.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry io: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("model not found: {0}")]
    NotFound(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("download cancelled")]
    Cancelled,
}

/// Outcome of a policy-gated download request.
///
/// `ConsentRequired` is returned to the caller as data; the caller re-issues
/// the request with consent supplied to proceed.
#[derive(Debug)]
pub enum DownloadOutcome {
    /// Policy requires explicit user consent before fetching.
    ConsentRequired { warnings: Vec<String> },
    /// Policy denied the download outright.
    Denied { warnings: Vec<String> },
    /// Download completed and the model was registered.
    Added(ModelInfo),
}

/// Policy-gated model downloads into the catalog.
///
/// Policy evaluation always precedes the fetch; a consent requirement is a
/// structured outcome, not an error. Verified downloads land in the managed
/// models directory and are registered with their pinned revision/sha256.
pub struct DownloadService {
    catalog: Arc<ModelCatalog>,
    downloader: Downloader,
    policy: DownloadPolicyConfig,
}

impl DownloadService {
    pub fn new(catalog: Arc<ModelCatalog>, jobs_dir: PathBuf, policy: DownloadPolicyConfig) -> Self {
        Self {
            catalog,
            downloader: Downloader::new(jobs_dir),
            policy,
        }
    }

    fn repo_file_url(repo_id: &str, revision: Option<&str>, filename: &str) -> String {
        format!(
            "https://huggingface.co/{repo_id}/resolve/{}/{filename}",
            revision.unwrap_or("main")
        )
    }

    /// Downloads `filename` from `repo_id` and registers it under `pool`.
    ///
    /// Runs the policy first: a denial or an unsatisfied consent requirement
    /// comes back as [`DownloadOutcome`] without any network traffic.
    /// Progress events flow to `progress_tx`; `control` carries the
    /// level-triggered pause/cancel flags.
    #[allow(clippy::too_many_arguments)]
    pub async fn download_from_repo(
        &self,
        repo_id: &str,
        filename: &str,
        pool: ModelPool,
        display_name: Option<&str>,
        consent_provided: bool,
        progress_tx: Option<tokio::sync::mpsc::Sender<ProgressEvent>>,
        control: &DownloadControl,
    ) -> Result<DownloadOutcome, RegistryError> {
        let decision = evaluate_download_policy(&self.policy, repo_id, filename);
        if !decision.allowed {
            return Ok(DownloadOutcome::Denied {
                warnings: decision.warnings,
            });
        }
        if decision.requires_consent && !consent_provided {
            return Ok(DownloadOutcome::ConsentRequired {
                warnings: decision.warnings,
            });
        }

        let target_path = self.catalog.models_dir().join(filename);
        let url = Self::repo_file_url(repo_id, decision.revision.as_deref(), filename);
        info!(repo_id, filename, %url, "starting model download");

        let mut job = DownloadJobState::new(url, target_path.clone());
        self.downloader
            .run(
                &mut job,
                decision.expected_sha256.as_deref(),
                progress_tx,
                control,
            )
            .await?;

        let size_bytes = std::fs::metadata(&target_path).map(|m| m.len()).unwrap_or(0);
        let info = ModelInfo {
            id: uuid::Uuid::new_v4().to_string(),
            display_name: display_name.unwrap_or(filename).to_string(),
            pool,
            path: target_path,
            size_bytes,
            source: "download".into(),
            repo_id: Some(repo_id.to_string()),
            revision: decision.revision,
            sha256: decision.expected_sha256,
            active: false,
            settings: ModelSettings::default(),
        };
        self.catalog.add_model(info.clone())?;
        Ok(DownloadOutcome::Added(info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use env_config::AllowedModelEntry;

    fn service(dir: &std::path::Path, policy: DownloadPolicyConfig) -> DownloadService {
        let catalog = Arc::new(
            ModelCatalog::open(dir.join("models.json"), dir.join("models")).unwrap(),
        );
        DownloadService::new(catalog, dir.join("jobs"), policy)
    }

    /// **Scenario**: a consent-requiring repo returns ConsentRequired
    /// without touching the network.
    #[tokio::test]
    async fn consent_required_returned_without_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let policy = DownloadPolicyConfig {
            allow_repo_owners: vec!["owner".into()],
            ..Default::default()
        };
        let service = service(dir.path(), policy);
        let outcome = service
            .download_from_repo(
                "owner/some-model",
                "model.gguf",
                ModelPool::Text,
                None,
                false,
                None,
                &DownloadControl::new(),
            )
            .await
            .unwrap();
        match outcome {
            DownloadOutcome::ConsentRequired { warnings } => {
                assert!(!warnings.is_empty());
            }
            other => panic!("expected ConsentRequired, got {other:?}"),
        }
    }

    /// **Scenario**: a policy denial comes back as Denied, not an error.
    #[tokio::test]
    async fn denial_is_structured() {
        let dir = tempfile::tempdir().unwrap();
        let policy = DownloadPolicyConfig {
            require_allowlist: true,
            ..Default::default()
        };
        let service = service(dir.path(), policy);
        let outcome = service
            .download_from_repo(
                "stranger/model",
                "model.gguf",
                ModelPool::Text,
                None,
                true,
                None,
                &DownloadControl::new(),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, DownloadOutcome::Denied { .. }));
    }

    /// **Scenario**: the resolve URL pins the allowlisted revision.
    #[test]
    fn repo_file_url_pins_revision() {
        assert_eq!(
            DownloadService::repo_file_url("org/model", Some("abc123"), "m.gguf"),
            "https://huggingface.co/org/model/resolve/abc123/m.gguf"
        );
        assert_eq!(
            DownloadService::repo_file_url("org/model", None, "m.gguf"),
            "https://huggingface.co/org/model/resolve/main/m.gguf"
        );
        let _ = AllowedModelEntry::default();
    }
}
