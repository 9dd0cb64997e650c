//! Download policy evaluation.
//!
//! Runs before any file fetch. A model is either allowlisted (proceed with
//! pinned revision/sha256), owner-approved (proceed with consent), or
//! unlisted (consent or denial per the policy flags). Policy denial is a
//! surfaced condition, not a retryable error.

use tracing::info;

use env_config::DownloadPolicyConfig;

/// Decision returned by [`evaluate_download_policy`].
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub requires_consent: bool,
    pub warnings: Vec<String>,
    pub revision: Option<String>,
    pub expected_sha256: Option<String>,
}

impl PolicyDecision {
    fn denied(message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            requires_consent: false,
            warnings: vec![message.into()],
            revision: None,
            expected_sha256: None,
        }
    }
}

fn repo_owner(repo_id: &str) -> Option<&str> {
    let owner = repo_id.split('/').next()?;
    if owner.is_empty() {
        None
    } else {
        Some(owner)
    }
}

/// Evaluates the download policy for `repo_id`/`filename`.
///
/// Allowlisted entries carry their pinned `revision`/`sha256` into the
/// decision; when `require_sha256` (globally or because the entry pins one)
/// cannot be satisfied, the download is blocked rather than fetched
/// unverified.
pub fn evaluate_download_policy(
    config: &DownloadPolicyConfig,
    repo_id: &str,
    filename: &str,
) -> PolicyDecision {
    let entry = config.allowed.iter().find(|e| {
        e.repo_id == repo_id && e.filename.as_deref().map_or(true, |f| f == filename)
    });

    if let Some(entry) = entry {
        let verify_sha256 = config.require_sha256 || entry.sha256.is_some();
        if config.require_revision && entry.revision.is_none() {
            return PolicyDecision::denied(
                "Model download blocked: revision is required but missing.",
            );
        }
        if verify_sha256 && entry.sha256.is_none() {
            return PolicyDecision::denied(
                "Model download blocked: sha256 is required but missing.",
            );
        }
        info!(repo_id, filename, "download allowlisted");
        return PolicyDecision {
            allowed: true,
            requires_consent: false,
            warnings: Vec::new(),
            revision: entry.revision.clone(),
            expected_sha256: entry.sha256.clone(),
        };
    }

    let owner_allowed = repo_owner(repo_id).is_some_and(|owner| {
        config
            .allow_repo_owners
            .iter()
            .any(|o| o.eq_ignore_ascii_case(owner))
    });

    let mut warnings = Vec::new();
    let requires_consent = if owner_allowed {
        warnings.push(format!(
            "Model is not allowlisted. Owner '{}' is allowed; user consent required.",
            repo_owner(repo_id).unwrap_or_default()
        ));
        true
    } else {
        if config.require_allowlist {
            return PolicyDecision::denied("Model download blocked: model is not allowlisted.");
        }
        if config.warn_on_unlisted {
            warnings
                .push("Model is not allowlisted or owner-approved; user consent required.".into());
        }
        config.warn_on_unlisted
    };

    // Unlisted entries have no pinned metadata; when the policy demands it
    // the download cannot be verified and is blocked.
    if config.require_revision {
        return PolicyDecision::denied("Model download blocked: unable to resolve revision.");
    }
    if config.require_sha256 {
        return PolicyDecision::denied("Model download blocked: unable to resolve sha256.");
    }

    PolicyDecision {
        allowed: true,
        requires_consent,
        warnings,
        revision: None,
        expected_sha256: None,
    }
}
