//! Git collaborators for the analyzer and evidence gates.
//!
//! Thin wrappers over the `git` binary. The diff ladder matches what the
//! rest of the system expects: changes against `HEAD` first, then unstaged,
//! then staged. Untracked files never count.

use std::path::Path;
use std::process::Command;

use crate::error::{SupervisionError, SupervisionResult};

/// Whether `dir` is inside a git work tree.
pub fn is_git_tree(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Distinct changed paths, via the HEAD → unstaged → staged fallback ladder.
pub fn changed_files(dir: &Path) -> SupervisionResult<Vec<String>> {
    for args in [
        &["diff", "--name-only", "HEAD"][..],
        &["diff", "--name-only"][..],
        &["diff", "--cached", "--name-only"][..],
    ] {
        if let Ok(stdout) = run_git(dir, args) {
            let mut files: Vec<String> = stdout
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(String::from)
                .collect();
            files.dedup();
            return Ok(files);
        }
    }
    Err(SupervisionError::git(
        "diff",
        "all diff forms failed (not a git repository?)",
    ))
}

/// Number of commits on HEAD since an ISO timestamp.
pub fn commit_count_since(dir: &Path, since_iso: &str) -> SupervisionResult<u32> {
    let stdout = run_git(dir, &["rev-list", "--count", &format!("--since={since_iso}"), "HEAD"])?;
    stdout
        .trim()
        .parse()
        .map_err(|e| SupervisionError::git("rev-list", format!("unparseable count: {e}")))
}

/// Relationship of the local branch to its upstream. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    /// No upstream configured for the current branch.
    NoUpstream,
    /// Everything on the branch has been pushed.
    UpToDate,
    /// Commits exist locally that the upstream does not have.
    Ahead(u32),
}

/// Probe how far the local branch is ahead of its upstream.
pub fn upstream_push_state(dir: &Path) -> PushState {
    match run_git(dir, &["rev-list", "--count", "@{u}..HEAD"]) {
        Ok(stdout) => match stdout.trim().parse::<u32>() {
            Ok(0) => PushState::UpToDate,
            Ok(n) => PushState::Ahead(n),
            Err(_) => PushState::NoUpstream,
        },
        Err(_) => PushState::NoUpstream,
    }
}

fn run_git(dir: &Path, args: &[&str]) -> SupervisionResult<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| SupervisionError::git(args.join(" "), e.to_string()))?;

    if !output.status.success() {
        return Err(SupervisionError::git(
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn git(dir: &Path, args: &[&str]) {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(out.status.success(), "git {args:?} failed");
    }

    fn init_repo(dir: &Path) {
        git(dir, &["init"]);
        git(dir, &["config", "user.email", "test@test.com"]);
        git(dir, &["config", "user.name", "Test"]);
        fs::write(dir.join("README.md"), "# fixture\n").unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-m", "init"]);
    }

    #[test]
    fn test_is_git_tree() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_git_tree(dir.path()));
        init_repo(dir.path());
        assert!(is_git_tree(dir.path()));
    }

    #[test]
    fn test_changed_files_against_head() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        assert!(changed_files(dir.path()).unwrap().is_empty());

        fs::write(dir.path().join("README.md"), "# changed\n").unwrap();
        let changed = changed_files(dir.path()).unwrap();
        assert_eq!(changed, vec!["README.md"]);

        // Untracked files are not counted
        fs::write(dir.path().join("scratch.txt"), "x\n").unwrap();
        let changed = changed_files(dir.path()).unwrap();
        assert_eq!(changed, vec!["README.md"]);
    }

    #[test]
    fn test_commit_count_since() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        let all = commit_count_since(dir.path(), "1970-01-01T00:00:00Z").unwrap();
        assert_eq!(all, 1);

        let none = commit_count_since(dir.path(), "2030-01-01T00:00:00Z").unwrap();
        assert_eq!(none, 0);
    }

    #[test]
    fn test_push_state_without_upstream() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        assert_eq!(upstream_push_state(dir.path()), PushState::NoUpstream);
    }
}
