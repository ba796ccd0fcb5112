//! Checkpoint downloads from the HuggingFace Hub.
//!
//! Asset cards that name a `repo` have their checkpoint fetched into the
//! HuggingFace cache on first use. Enable with the `hub` feature.

use anyhow::{Context, Result};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use std::path::PathBuf;

/// Download `filename` from the model repository `repo` and return its local path.
///
/// Without a `revision` the repository's default branch is used.
pub fn download_checkpoint(repo: &str, filename: &str, revision: Option<&str>) -> Result<PathBuf> {
    let api = Api::new().context("Failed to create HuggingFace API")?;

    let repo_handle = match revision {
        Some(rev) => api.repo(Repo::with_revision(
            repo.to_string(),
            RepoType::Model,
            rev.to_string(),
        )),
        None => api.model(repo.to_string()),
    };

    tracing::info!(
        "Fetching {} from {}{}",
        filename,
        repo,
        revision.map(|r| format!(" @ {r}")).unwrap_or_default()
    );
    repo_handle
        .get(filename)
        .with_context(|| format!("Failed to download {filename} from {repo}"))
}
