//! Checked out application sources at a given revision.
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use keel_common::{
    config::{load_application, GenericApplicationSpec},
    git::{Client, Repo},
    model::{ApplicationGitPath, ApplicationKind},
};
use tokio::sync::OnceCell;
use tracing::info;

use crate::error::KeelPipedResult;

/// An application directory checked out at `revision` with its parsed config.
#[derive(Debug)]
pub struct DeploySource {
    pub repo_dir: PathBuf,
    pub app_dir: PathBuf,
    pub revision: String,
    pub config_filename: String,
    pub app_config: GenericApplicationSpec,
    pub repo: Repo,
}

/// Lazily clones a revision the first time it is needed.
pub struct Provider {
    work_dir: PathBuf,
    git: Arc<Client>,
    git_path: ApplicationGitPath,
    kind: ApplicationKind,
    revision: String,
    source: OnceCell<Arc<DeploySource>>,
}

impl Provider {
    pub fn new(
        work_dir: &Path,
        git: Arc<Client>,
        git_path: ApplicationGitPath,
        kind: ApplicationKind,
        revision: &str,
    ) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            git,
            git_path,
            kind,
            revision: revision.to_string(),
            source: OnceCell::new(),
        }
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub async fn get(&self) -> KeelPipedResult<Arc<DeploySource>> {
        self.source
            .get_or_try_init(|| async { self.prepare().await.map(Arc::new) })
            .await
            .cloned()
    }

    async fn prepare(&self) -> KeelPipedResult<DeploySource> {
        let dest = self.work_dir.join(format!("repo-{}", short(&self.revision)));
        let repo = self
            .git
            .clone_repo(
                &self.git_path.repo.id,
                &self.git_path.repo.remote,
                &self.git_path.repo.branch,
                Some(&dest),
            )
            .await?;
        repo.checkout(&self.revision).await?;
        info!(
            repo_id = %self.git_path.repo.id,
            revision = %self.revision,
            "checked out deploy source"
        );

        let app_config = load_application(repo.path(), &self.git_path.config_path(), self.kind)?;
        let repo_dir = repo.path().to_path_buf();
        let app_dir = repo_dir.join(&self.git_path.path);
        Ok(DeploySource {
            repo_dir,
            app_dir,
            revision: self.revision.clone(),
            config_filename: self.git_path.config_filename().to_string(),
            app_config,
            repo,
        })
    }
}

fn short(revision: &str) -> &str {
    revision.get(..12).unwrap_or(revision)
}

#[cfg(test)]
mod tests {
    use keel_common::git::ClientOptions;

    use super::*;
    use crate::testing::TestRepo;

    const APP: &str = "apiVersion: keel.dev/v1beta1\nkind: KubernetesApp\nspec:\n  name: hello\n";

    #[tokio::test]
    async fn loads_the_config_of_the_requested_revision() {
        let repo = TestRepo::new();
        repo.write("apps/hello/app.keel.yaml", APP);
        let first = repo.commit("add app");
        repo.write("apps/hello/app.keel.yaml", &APP.replace("hello", "world"));
        repo.commit("rename app");

        let git = Arc::new(
            Client::new(ClientOptions {
                cache_dir: Some(repo.scratch("cache")),
                ..Default::default()
            })
            .unwrap(),
        );
        let git_path = ApplicationGitPath {
            repo: keel_common::model::ApplicationGitRepository {
                id: "repo-1".to_string(),
                remote: repo.remote(),
                branch: "main".to_string(),
            },
            path: "apps/hello".to_string(),
            ..Default::default()
        };
        let provider = Provider::new(
            &repo.scratch("work"),
            git,
            git_path,
            ApplicationKind::Kubernetes,
            &first,
        );
        let source = provider.get().await.unwrap();
        assert_eq!(source.app_config.name, "hello");
        assert!(source.app_dir.ends_with("apps/hello"));
        let again = provider.get().await.unwrap();
        assert!(Arc::ptr_eq(&source, &again));
    }
}
