//! Git adapter for committing journal records.
//!
//! Every appended record can be committed on its own, so the repository
//! history doubles as the replication log. The wrapper stays small and
//! explicit around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True when the working directory is inside a git work tree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Stage exactly the given paths.
    pub fn add_paths(&self, paths: &[&Path]) -> Result<()> {
        let mut args = vec!["add".to_string(), "--".to_string()];
        for path in paths {
            let relative = path.strip_prefix(&self.workdir).unwrap_or(path);
            args.push(relative.to_string_lossy().into_owned());
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(&args)?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "--quiet", "-m", message])?;
        Ok(true)
    }

    /// Stage `paths` and commit them as one record.
    #[instrument(skip_all, fields(count = paths.len()))]
    pub fn commit_paths(&self, paths: &[&Path], message: &str) -> Result<bool> {
        self.add_paths(paths)?;
        self.commit_staged(message)
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "--quiet"],
            vec!["config", "user.email", "ledger@example.com"],
            vec!["config", "user.name", "ledger"],
        ] {
            let status = Command::new("git")
                .args(&args)
                .current_dir(dir)
                .status()
                .expect("git");
            assert!(status.success(), "git {args:?}");
        }
    }

    #[test]
    fn non_repo_is_detected() {
        if !git_available() {
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(!Git::new(temp.path()).is_repo());
    }

    #[test]
    fn commit_paths_commits_only_listed_files() {
        if !git_available() {
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir");
        init_repo(temp.path());
        let git = Git::new(temp.path());
        assert!(git.is_repo());

        let record = temp.path().join("record.json");
        let other = temp.path().join("scratch.txt");
        fs::write(&record, "{}\n").expect("write");
        fs::write(&other, "x\n").expect("write");

        assert!(git.commit_paths(&[&record], "append record").expect("commit"));
        assert!(!git.has_staged_changes().expect("staged"));
        // Nothing new staged: second commit is a no-op.
        assert!(!git.commit_staged("again").expect("commit"));
    }
}
