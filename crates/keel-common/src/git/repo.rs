use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::{GitError, GitResult};
use crate::util::fs_utils;

const FIELD_SEPARATOR: char = '\u{1f}';
const RECORD_SEPARATOR: char = '\u{1e}';
const COMMIT_LOG_FORMAT: &str = "%H%x1f%P%x1f%an%x1f%cn%x1f%ct%x1f%s%x1f%b%x1e";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    pub parent_hash: String,
    pub author: String,
    pub committer: String,
    pub body: String,
    /// The subject line.
    pub message: String,
    pub created_at: i64,
}

fn parse_commits(out: &str) -> GitResult<Vec<Commit>> {
    out.split(RECORD_SEPARATOR)
        .map(|r| r.trim_start_matches('\n'))
        .filter(|r| !r.trim().is_empty())
        .map(|record| {
            let fields: Vec<&str> = record.splitn(7, FIELD_SEPARATOR).collect();
            if fields.len() != 7 {
                return Err(GitError::Other(format!(
                    "unexpected commit log record {:?}",
                    record
                )));
            }
            let created_at = fields[4].trim().parse::<i64>().map_err(|e| {
                GitError::Other(format!("invalid commit timestamp {:?}: {}", fields[4], e))
            })?;
            Ok(Commit {
                hash: fields[0].to_string(),
                parent_hash: fields[1].to_string(),
                author: fields[2].to_string(),
                committer: fields[3].to_string(),
                created_at,
                message: fields[5].to_string(),
                body: fields[6].trim_end().to_string(),
            })
        })
        .collect()
}

/// Appends `key: value` trailers, sorted by key, after a blank line.
pub(crate) fn message_with_trailers(message: &str, trailers: &HashMap<String, String>) -> String {
    if trailers.is_empty() {
        return message.to_string();
    }
    let mut keys: Vec<&String> = trailers.keys().collect();
    keys.sort();
    let mut out = message.trim_end().to_string();
    out.push_str("\n\n");
    let lines: Vec<String> = keys
        .into_iter()
        .map(|k| format!("{}: {}", k, trailers[k]))
        .collect();
    out.push_str(&lines.join("\n"));
    out
}

/// A working copy cloned from the local mirror cache.
#[derive(Debug, Clone)]
pub struct Repo {
    dir: PathBuf,
    git_path: String,
    remote: String,
    cloned_branch: String,
    envs: Vec<(String, String)>,
}

impl Repo {
    pub(crate) fn new(
        dir: PathBuf,
        git_path: String,
        remote: String,
        cloned_branch: String,
        envs: Vec<(String, String)>,
    ) -> Self {
        Self {
            dir,
            git_path,
            remote,
            cloned_branch,
            envs,
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn cloned_branch(&self) -> &str {
        &self.cloned_branch
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub async fn list_commits(&self, revision_range: &str) -> GitResult<Vec<Commit>> {
        let format = format!("--pretty=format:{}", COMMIT_LOG_FORMAT);
        let mut args = vec!["log", "--no-decorate", format.as_str()];
        if !revision_range.is_empty() {
            args.push(revision_range);
        }
        let out = self.run(&args).await?;
        parse_commits(&out)
    }

    pub async fn get_latest_commit(&self) -> GitResult<Commit> {
        let mut commits = self.list_commits("-1").await?;
        if commits.len() != 1 {
            return Err(GitError::Other(format!(
                "commits must contain one item, got: {}",
                commits.len()
            )));
        }
        Ok(commits.remove(0))
    }

    pub async fn get_commit_for_rev(&self, rev: &str) -> GitResult<Commit> {
        let format = format!("--pretty=format:{}", COMMIT_LOG_FORMAT);
        let out = self
            .run(&["log", "--no-decorate", format.as_str(), "-1", rev])
            .await?;
        parse_commits(&out)?
            .pop()
            .ok_or_else(|| GitError::Other(format!("no commit found for rev {}", rev)))
    }

    pub async fn get_commit_hash_for_rev(&self, rev: &str) -> GitResult<String> {
        let out = self.run(&["rev-parse", rev]).await?;
        Ok(out.trim().to_string())
    }

    /// Files changed between two commits, as repository relative paths.
    pub async fn changed_files(&self, from: &str, to: &str) -> GitResult<Vec<String>> {
        let out = self.run(&["diff", "--name-only", from, to]).await?;
        Ok(out
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub async fn checkout(&self, commitish: &str) -> GitResult {
        self.run(&["checkout", commitish]).await.map(|_| ())
    }

    pub async fn checkout_pull_request(&self, number: u64, branch: &str) -> GitResult {
        let target = format!("pull/{}/head:{}", number, branch);
        self.run(&["fetch", "origin", &target]).await?;
        self.checkout(branch).await
    }

    pub async fn pull(&self, branch: &str) -> GitResult {
        self.run(&["pull", "--no-rebase", "origin", branch])
            .await
            .map(|_| ())
    }

    pub async fn push(&self, branch: &str) -> GitResult {
        match self.run(&["push", "origin", branch]).await {
            Err(GitError::CommandFailed { output, .. })
                if output.contains("failed to push some refs to") =>
            {
                Err(GitError::BranchNotFresh)
            }
            other => other.map(|_| ()),
        }
    }

    /// Discards local commits and changes of the current branch, matching the
    /// last fetched state of the remote `branch`.
    pub async fn reset_to_remote(&self, branch: &str) -> GitResult {
        let target = format!("origin/{}", branch);
        self.run(&["reset", "--hard", &target]).await.map(|_| ())
    }

    /// Merges `commit` of the remote `branch` into the current branch, always creating a merge commit.
    pub async fn merge_remote_branch(&self, branch: &str, commit: &str, message: &str) -> GitResult {
        self.run(&["fetch", "origin", branch]).await?;
        self.run(&["merge", "-q", "--no-ff", "-m", message, commit])
            .await
            .map(|_| ())
    }

    /// Writes `changes` on `branch` and commits them.
    ///
    /// Returns [`GitError::NoChange`] when the tree is unchanged afterwards.
    pub async fn commit_changes(
        &self,
        branch: &str,
        message: &str,
        new_branch: bool,
        changes: &HashMap<String, Vec<u8>>,
        trailers: &HashMap<String, String>,
    ) -> GitResult {
        if new_branch {
            self.run(&["checkout", "-b", branch]).await?;
        } else {
            self.checkout(branch).await?;
        }

        for (path, content) in changes {
            let file = self.dir.join(path);
            if let Some(parent) = file.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&file, content)?;
        }

        self.run(&["add", "."]).await?;
        let message = message_with_trailers(message, trailers);
        match self.run(&["commit", "-m", &message]).await {
            Err(GitError::CommandFailed { output, .. })
                if output.contains("nothing to commit, working tree clean") =>
            {
                Err(GitError::NoChange)
            }
            other => other.map(|_| ()),
        }
    }

    /// Copies the working copy into `dest` so it can be modified in isolation.
    pub fn copy(&self, dest: &Path) -> GitResult<Repo> {
        fs_utils::copy_dir(&self.dir, dest).map_err(|e| GitError::Other(e.to_string()))?;
        Ok(Repo {
            dir: dest.to_path_buf(),
            ..self.clone()
        })
    }

    /// Removes the working copy. The mirror cache is untouched.
    pub fn clean(&self) -> GitResult {
        match fs::remove_dir_all(&self.dir) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    pub(crate) async fn set_user(&self, username: &str, email: &str) -> GitResult {
        self.run(&["config", "user.name", username]).await?;
        self.run(&["config", "user.email", email]).await?;
        Ok(())
    }

    pub(crate) async fn set_gc_auto_detach(&self, auto_detach: bool) -> GitResult {
        let value = if auto_detach { "true" } else { "false" };
        self.run(&["config", "gc.autoDetach", value]).await.map(|_| ())
    }

    pub(crate) async fn set_remote(&self, remote: &str) -> GitResult {
        self.run(&["remote", "set-url", "origin", remote])
            .await
            .map(|_| ())
    }

    async fn run(&self, args: &[&str]) -> GitResult<String> {
        run_git(&self.git_path, Some(&self.dir), &self.envs, args).await
    }
}

/// Runs git, returning stdout on success and the combined output on failure.
pub(crate) async fn run_git(
    git_path: &str,
    dir: Option<&Path>,
    envs: &[(String, String)],
    args: &[&str],
) -> GitResult<String> {
    let mut cmd = Command::new(git_path);
    cmd.args(args).env("LC_ALL", "C").kill_on_drop(true);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    for (k, v) in envs {
        cmd.env(k, v);
    }
    let output = cmd.output().await?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return Ok(stdout);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let command = args.first().copied().unwrap_or_default().to_string();
    tracing::debug!(command = %command, stderr = %stderr, "git command failed");
    Err(GitError::CommandFailed {
        command,
        underlying: output.status.to_string(),
        output: format!("{}{}", stderr, stdout),
    })
}
