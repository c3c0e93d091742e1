//! Git integration for resolving the branch context of a build.

use std::path::Path;
use std::process::Command;

use crate::domain::error::{GantryError, Result};

fn git_output(repo_dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .map_err(|e| GantryError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GantryError::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if value.is_empty() {
        return Err(GantryError::Git(format!(
            "git {} returned empty output",
            args.join(" ")
        )));
    }
    Ok(value)
}

/// Capture the HEAD commit SHA of the repository containing `repo_dir`.
pub fn capture_head_sha(repo_dir: &Path) -> Result<String> {
    git_output(repo_dir, &["rev-parse", "HEAD"])
}

/// Capture the checked-out branch name. A detached HEAD is an error since
/// there is no branch to report.
pub fn capture_branch_name(repo_dir: &Path) -> Result<String> {
    let name = git_output(repo_dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    if name == "HEAD" {
        return Err(GantryError::Git("detached HEAD has no branch".to_string()));
    }
    Ok(name)
}

/// Check whether a directory is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn run_git(repo_dir: &Path, args: &[&str]) {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(repo_dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn make_git_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run_git(dir.path(), &["init"]);
        run_git(dir.path(), &["config", "user.name", "test-user"]);
        run_git(dir.path(), &["config", "user.email", "test@example.com"]);
        run_git(dir.path(), &["commit", "--allow-empty", "-m", "initial"]);
        dir
    }

    #[test]
    fn capture_head_sha_returns_40_hex_chars() {
        let repo = make_git_repo();
        let sha = capture_head_sha(repo.path()).unwrap();
        assert_eq!(sha.len(), 40, "SHA should be 40 hex chars, got: {sha}");
        assert!(sha.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn capture_branch_name_follows_checkout() {
        let repo = make_git_repo();
        run_git(repo.path(), &["checkout", "-b", "feature/x"]);
        assert_eq!(capture_branch_name(repo.path()).unwrap(), "feature/x");
    }

    #[test]
    fn capture_branch_name_rejects_detached_head() {
        let repo = make_git_repo();
        let sha = capture_head_sha(repo.path()).unwrap();
        run_git(repo.path(), &["checkout", "--detach", &sha]);
        assert!(capture_branch_name(repo.path()).is_err());
    }

    #[test]
    fn is_git_repo_detects_repos() {
        let repo = make_git_repo();
        assert!(is_git_repo(repo.path()));
        let plain = tempfile::tempdir().unwrap();
        assert!(!is_git_repo(plain.path()));
    }
}
