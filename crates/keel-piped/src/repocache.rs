//! Long lived working copies of the configured repositories.
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use dashmap::DashMap;
use keel_common::{
    config::{PipedRepositoryConfig, PipedSpec},
    git::{Client, Commit, Repo},
};
use tokio::sync::Mutex;

use crate::error::{KeelPipedError, KeelPipedResult};

/// Clones each repository once under `workspace` and pulls it on demand.
pub struct RepoCache {
    git: Arc<Client>,
    repositories: HashMap<String, PipedRepositoryConfig>,
    workspace: PathBuf,
    repos: DashMap<String, Arc<Mutex<Option<Repo>>>>,
}

impl RepoCache {
    pub fn new(git: Arc<Client>, spec: &PipedSpec, workspace: &Path) -> Self {
        Self {
            git,
            repositories: spec
                .repositories
                .iter()
                .map(|r| (r.repo_id.clone(), r.clone()))
                .collect(),
            workspace: workspace.to_path_buf(),
            repos: DashMap::new(),
        }
    }

    /// Brings the working copy of `repo_id` to the tip of its branch and
    /// returns it with the head commit.
    pub async fn fresh(&self, repo_id: &str) -> KeelPipedResult<(Repo, Commit)> {
        let slot = self.repos.entry(repo_id.to_string()).or_default().clone();
        let mut slot = slot.lock().await;
        let repo = match slot.as_ref() {
            Some(repo) => repo.clone(),
            None => {
                let repo = self.clone_repo(repo_id).await?;
                *slot = Some(repo.clone());
                repo
            }
        };
        repo.pull(repo.cloned_branch()).await?;
        let head = repo.get_latest_commit().await?;
        Ok((repo, head))
    }

    async fn clone_repo(&self, repo_id: &str) -> KeelPipedResult<Repo> {
        let cfg = self.repositories.get(repo_id).ok_or_else(|| {
            KeelPipedError::InvalidConfig(format!(
                "repository {} was not found in the piped configuration",
                repo_id
            ))
        })?;
        let dest = self.workspace.join(repo_id);
        match std::fs::remove_dir_all(&dest) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        Ok(self
            .git
            .clone_repo(repo_id, &cfg.remote, &cfg.branch, Some(&dest))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use keel_common::git::ClientOptions;

    use super::*;
    use crate::testing::{piped_spec, TestRepo, REPO_ID};

    #[tokio::test]
    async fn follows_the_remote_branch() {
        let remote = TestRepo::new();
        let git = Arc::new(
            Client::new(ClientOptions {
                cache_dir: Some(remote.scratch("cache")),
                ..Default::default()
            })
            .unwrap(),
        );
        let cache = RepoCache::new(git, &piped_spec(&remote.remote()), &remote.scratch("ws"));

        let (repo, first) = cache.fresh(REPO_ID).await.unwrap();
        assert_eq!(repo.cloned_branch(), "main");
        remote.write("a.txt", "a");
        let next = remote.commit("add a");
        let (_, head) = cache.fresh(REPO_ID).await.unwrap();
        assert_ne!(first.hash, head.hash);
        assert_eq!(head.hash, next);

        let err = cache.fresh("unknown").await.unwrap_err();
        assert!(err.to_string().contains("unknown was not found"));
    }
}
