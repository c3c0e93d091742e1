//! Source-control context consumed by stage preconditions.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::git::{capture_branch_name, capture_head_sha, is_git_repo};

const UNKNOWN: &str = "unknown";

/// Branch name and revision of the checkout being built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BranchContext {
    pub branch: String,
    pub revision: String,
}

impl BranchContext {
    /// Build a context, normalising CI-style branch refs such as
    /// `origin/main` or `refs/heads/main` down to `main`.
    pub fn new(branch: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            branch: normalize_branch(&branch.into()),
            revision: revision.into(),
        }
    }

    /// Resolve the context: explicit values first, then git in `workspace`,
    /// then `"unknown"`.
    pub fn detect(workspace: &Path, branch: Option<&str>, revision: Option<&str>) -> Self {
        let in_repo = (branch.is_none() || revision.is_none()) && is_git_repo(workspace);
        let branch = branch
            .map(str::to_string)
            .or_else(|| in_repo.then(|| capture_branch_name(workspace).ok()).flatten())
            .unwrap_or_else(|| UNKNOWN.to_string());
        let revision = revision
            .map(str::to_string)
            .or_else(|| in_repo.then(|| capture_head_sha(workspace).ok()).flatten())
            .unwrap_or_else(|| UNKNOWN.to_string());
        Self::new(branch, revision)
    }

    /// First 12 characters of the revision.
    pub fn short_revision(&self) -> &str {
        let end = self
            .revision
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.revision.len());
        &self.revision[..end]
    }
}

fn normalize_branch(raw: &str) -> String {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix("refs/heads/")
        .or_else(|| trimmed.strip_prefix("refs/remotes/origin/"))
        .or_else(|| trimmed.strip_prefix("origin/"))
        .unwrap_or(trimmed);
    if stripped.is_empty() {
        UNKNOWN.to_string()
    } else {
        stripped.to_string()
    }
}
