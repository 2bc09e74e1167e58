//! Propagates event values into Git.
//!
//! Every repository is checked on its own ticker. Watched events come from
//! the `EventWatcher` files under `.pipe/` and from the `eventWatcher`
//! section of the application configs in the repository. For each of them
//! only the newest not handled event is applied; the older ones are
//! reported as outdated.
pub mod replacement;

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use dashmap::{DashMap, DashSet};
use keel_common::{
    backoff::RetryPolicy,
    config::{
        load_application, load_event_watcher, EventWatcherReplacement, PipedEventWatcher,
        PipedEventWatcherGitRepo, PipedSpec, EVENT_WATCHER_HANDLER_GIT_UPDATE,
    },
    git::{Client, GitError, Repo},
    model::{Event, EventStatus},
    rpc::{EventStatusReport, GetLatestEventRequest, PipedService, ReportEventStatusesRequest},
    template::render_or_literal,
    time::now_unix,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    apiclient::{rpc_retry, with_retry},
    apistore::{ApplicationStore, EventStore},
    error::{KeelPipedError, KeelPipedResult},
    repocache::RepoCache,
};

const MAX_EVENTS_PER_CHECK: usize = 10;
const EVENT_TTL_SECS: i64 = 60 * 60;
const PUSH_ATTEMPTS: u32 = 3;
const PUSH_INTERVAL: Duration = Duration::from_secs(5);
const NO_CHANGES: &str = "No changes to commit";

/// One watched event and what to do with its value.
#[derive(Debug, Clone)]
struct Watch {
    name: String,
    labels: HashMap<String, String>,
    replacements: Vec<EventWatcherReplacement>,
    // Replacement files are relative to this repository directory.
    base_dir: String,
    commit_message: String,
    make_pull_request: bool,
}

impl Watch {
    fn file(&self, r: &EventWatcherReplacement) -> String {
        let base = self.base_dir.trim_end_matches('/');
        if base.is_empty() || base == "." {
            r.file.clone()
        } else {
            format!("{}/{}", base, r.file)
        }
    }

    fn commit_message(&self, event: &Event) -> String {
        if self.commit_message.is_empty() {
            return format!(
                "Replace values with \"{}\" set by Event \"{}\"",
                event.data, event.name
            );
        }
        let values = HashMap::from([
            ("Value", event.data.clone()),
            ("EventName", event.name.clone()),
        ]);
        render_or_literal(&self.commit_message, &values)
    }
}

pub struct EventWatcher {
    client: Arc<dyn PipedService>,
    apps: Arc<ApplicationStore>,
    events: Arc<EventStore>,
    repos: RepoCache,
    cfg: PipedEventWatcher,
    repo_ids: Vec<String>,
    workspace: PathBuf,
    // Created time of the newest event handled per repository.
    milestones: DashMap<String, i64>,
    // Event keys already compared against the control plane.
    checked_keys: DashSet<String>,
}

impl EventWatcher {
    pub fn new(
        client: Arc<dyn PipedService>,
        git: Arc<Client>,
        apps: Arc<ApplicationStore>,
        events: Arc<EventStore>,
        spec: &PipedSpec,
        workspace: &Path,
    ) -> Self {
        Self {
            client,
            apps,
            events,
            repos: RepoCache::new(git, spec, workspace),
            cfg: spec.event_watcher.clone(),
            repo_ids: spec.repositories.iter().map(|r| r.repo_id.clone()).collect(),
            workspace: workspace.to_path_buf(),
            milestones: DashMap::new(),
            checked_keys: DashSet::new(),
        }
    }

    pub async fn run(&self, token: CancellationToken) -> KeelPipedResult {
        info!(repositories = self.repo_ids.len(), "event watcher has been started");
        let loops = self
            .repo_ids
            .iter()
            .map(|id| self.run_repository(id, token.clone()));
        futures::future::join_all(loops).await;
        info!("event watcher has been stopped");
        Ok(())
    }

    async fn run_repository(&self, repo_id: &str, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.cfg.check_interval.as_std());
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.check_repository(repo_id).await {
                        warn!(repo_id, "failed to handle events: {}", e);
                    }
                }
            }
        }
    }

    pub async fn check_repository(&self, repo_id: &str) -> KeelPipedResult {
        let (repo, _) = self.repos.fresh(repo_id).await?;
        self.handle(repo_id, &repo).await
    }

    /// Applies the pending events to a copy of `repo` and reports them.
    async fn handle(&self, repo_id: &str, repo: &Repo) -> KeelPipedResult {
        let watches = self.watches(repo_id, repo);
        if watches.is_empty() {
            return Ok(());
        }
        let tmp = tempfile::Builder::new()
            .prefix("event-watcher-")
            .tempdir_in(&self.workspace)?;
        let work = repo.copy(&tmp.path().join(repo_id))?;
        let since = self.milestones.get(repo_id).map_or(0, |m| *m);

        let mut reports: BTreeMap<String, (EventStatusReport, i64)> = BTreeMap::new();
        for watch in &watches {
            let events = self
                .events
                .list_not_handled(&watch.name, &watch.labels, since, MAX_EVENTS_PER_CHECK);
            let Some((latest, older)) = events.split_last() else {
                continue;
            };
            for e in older {
                let desc = format!("The new event {} has been created", latest.id);
                record(&mut reports, e, EventStatus::Outdated, desc);
            }
            if let Some(newer) = self.newer_on_control_plane(latest).await {
                let desc = format!("The new event {} has been created", newer.id);
                record(&mut reports, latest, EventStatus::Outdated, desc);
                continue;
            }
            if now_unix() - latest.created_at > EVENT_TTL_SECS {
                let desc = "The event was created more than an hour ago".to_string();
                record(&mut reports, latest, EventStatus::Outdated, desc);
                continue;
            }
            match self.apply(repo_id, &work, watch, latest).await {
                Ok(desc) => record(&mut reports, latest, EventStatus::Success, desc),
                Err(KeelPipedError::Git(GitError::BranchNotFresh)) => {
                    info!(repo_id, event = %latest.name, "remote branch has moved, retrying on the next check");
                    return self.report(repo_id, reports, Some(latest.created_at)).await;
                }
                Err(e) => {
                    warn!(repo_id, event = %latest.name, "failed to handle event: {}", e);
                    record(&mut reports, latest, EventStatus::Failure, e.to_string());
                }
            }
        }
        self.report(repo_id, reports, None).await
    }

    fn watches(&self, repo_id: &str, repo: &Repo) -> Vec<Watch> {
        let default = PipedEventWatcherGitRepo::default();
        let repo_cfg = self
            .cfg
            .git_repos
            .iter()
            .find(|r| r.repo_id == repo_id)
            .unwrap_or(&default);
        let mut watches = Vec::new();
        match load_event_watcher(repo.path(), &repo_cfg.includes, &repo_cfg.excludes) {
            Ok(spec) => watches.extend(spec.events.into_iter().map(|e| Watch {
                name: e.name,
                labels: e.labels,
                replacements: e.replacements,
                base_dir: String::new(),
                commit_message: repo_cfg.commit_message.clone(),
                make_pull_request: false,
            })),
            Err(e) => warn!(repo_id, "failed to load event watcher configs: {}", e),
        }
        for app in self.apps.list_by_repo(repo_id) {
            let cfg = match load_application(repo.path(), &app.git_path.config_path(), app.kind) {
                Ok(cfg) => cfg,
                Err(e) => {
                    debug!(application_id = %app.id, "skipping event watcher of application: {}", e);
                    continue;
                }
            };
            for ew in cfg.event_watcher {
                if ew.handler.r#type != EVENT_WATCHER_HANDLER_GIT_UPDATE {
                    continue;
                }
                watches.push(Watch {
                    name: ew.matcher.name,
                    labels: ew.matcher.labels,
                    replacements: ew.handler.config.replacements,
                    base_dir: app.git_path.path.clone(),
                    commit_message: ew.handler.config.commit_message,
                    make_pull_request: ew.handler.config.make_pull_request,
                });
            }
        }
        watches
    }

    /// The first time an event key is seen, asks the control plane whether a
    /// newer event exists than the ones listed locally.
    async fn newer_on_control_plane(&self, latest: &Event) -> Option<Event> {
        if !self.checked_keys.insert(latest.event_key.clone()) {
            return None;
        }
        let req = GetLatestEventRequest {
            name: latest.name.clone(),
            labels: latest.labels.clone(),
        };
        match with_retry(&rpc_retry(), |_| self.client.get_latest_event(req.clone())).await {
            Ok(resp) if resp.event.supersedes(latest) => Some(resp.event),
            Ok(_) => None,
            Err(e) => {
                warn!(event = %latest.name, "failed to get the latest event: {}", e);
                None
            }
        }
    }

    /// Rewrites the watched files with the event value, then commits and
    /// pushes them. Returns the status description.
    async fn apply(
        &self,
        repo_id: &str,
        work: &Repo,
        watch: &Watch,
        event: &Event,
    ) -> KeelPipedResult<String> {
        let mut changes: HashMap<String, Vec<u8>> = HashMap::new();
        for r in &watch.replacements {
            let file = watch.file(r);
            let content = match changes.get(&file) {
                Some(content) => content.clone(),
                None => tokio::fs::read(work.path().join(&file)).await?,
            };
            let updated = if !r.yaml_field.is_empty() {
                replacement::yaml(&content, &r.yaml_field, &event.data)
            } else if !r.regex.is_empty() {
                replacement::text(&content, &r.regex, &event.data)
            } else {
                debug!(file = %file, "json and hcl fields are not updated yet");
                Ok(None)
            }
            .map_err(|e| KeelPipedError::runtime(format!("failed to update {}: {}", file, e)))?;
            if let Some(content) = updated {
                changes.insert(file, content);
            }
        }
        if changes.is_empty() {
            return Ok(NO_CHANGES.to_string());
        }

        let message = watch.commit_message(event);
        let branch = if watch.make_pull_request {
            format!("{}-{}", event.name, uuid::Uuid::new_v4())
        } else {
            work.cloned_branch().to_string()
        };
        let outcome = match work
            .commit_changes(&branch, &message, watch.make_pull_request, &changes, &event.contexts)
            .await
        {
            Ok(()) => {
                RetryPolicy::constant(PUSH_ATTEMPTS, PUSH_INTERVAL)
                    .run(
                        |_| work.push(&branch),
                        |e: &GitError| !matches!(e, GitError::BranchNotFresh),
                    )
                    .await
            }
            Err(e) => Err(e),
        };
        if watch.make_pull_request {
            work.checkout(work.cloned_branch()).await?;
        }
        match outcome {
            Ok(()) => {}
            Err(GitError::NoChange) => return Ok(NO_CHANGES.to_string()),
            Err(e) => {
                // Later watches of this check must not build on the unpushed commit.
                work.reset_to_remote(work.cloned_branch()).await?;
                return Err(e.into());
            }
        }
        info!(repo_id, event = %event.name, branch = %branch, "pushed the values of event");
        Ok(format!(
            "Successfully updated {} files in the {} repository",
            changes.len(),
            repo_id
        ))
    }

    /// Sends the outcomes to the control plane. Failed events, and the one
    /// created at `retry_from` when given, stay pending locally and the
    /// milestone of the repository never moves past them.
    async fn report(
        &self,
        repo_id: &str,
        reports: BTreeMap<String, (EventStatusReport, i64)>,
        retry_from: Option<i64>,
    ) -> KeelPipedResult {
        if reports.is_empty() {
            return Ok(());
        }
        let settled = |r: &EventStatusReport| r.status != EventStatus::Failure;
        let newest = reports
            .values()
            .filter(|(r, _)| settled(r))
            .map(|(_, at)| *at)
            .max();
        let retry_from = reports
            .values()
            .filter(|(r, _)| !settled(r))
            .map(|(_, at)| *at)
            .chain(retry_from)
            .min();
        let req = ReportEventStatusesRequest {
            events: reports.into_values().map(|(r, _)| r).collect(),
        };
        with_retry(&rpc_retry(), |_| self.client.report_event_statuses(req.clone())).await?;
        for r in &req.events {
            metrics::counter!("keel_piped_events_handled_total", "status" => format!("{:?}", r.status))
                .increment(1);
        }
        let ids: Vec<&str> = req
            .events
            .iter()
            .filter(|r| settled(r))
            .map(|r| r.id.as_str())
            .collect();
        self.events.mark_handled(&ids);
        let mut milestone = self.milestones.entry(repo_id.to_string()).or_default();
        if let Some(newest) = newest {
            *milestone = (*milestone).max(newest);
        }
        if let Some(retry_from) = retry_from {
            *milestone = (*milestone).min(retry_from);
        }
        Ok(())
    }
}

// The same event may be watched several times; a success never hides
// another outcome.
fn record(
    reports: &mut BTreeMap<String, (EventStatusReport, i64)>,
    event: &Event,
    status: EventStatus,
    description: String,
) {
    if let Some((existing, _)) = reports.get(&event.id) {
        if existing.status != EventStatus::Success {
            return;
        }
    }
    reports.insert(
        event.id.clone(),
        (
            EventStatusReport {
                id: event.id.clone(),
                status,
                status_description: description,
            },
            event.created_at,
        ),
    );
}

#[cfg(test)]
mod tests {
    use keel_common::git::ClientOptions;

    use super::*;
    use crate::testing::{app, event, piped_spec, ControlPlane, TestRepo, REPO_ID};

    const WATCHER: &str = r#"apiVersion: keel.dev/v1beta1
kind: EventWatcher
spec:
  events:
    - name: image-tag
      labels:
        env: dev
      replacements:
        - file: values.yaml
          yamlField: $.image.tag
"#;

    struct Fixture {
        cp: ControlPlane,
        repo: TestRepo,
        watcher: EventWatcher,
        events: Arc<EventStore>,
    }

    async fn fixture(files: &[(&str, &str)]) -> Fixture {
        let cp = ControlPlane::new().await;
        let repo = TestRepo::new();
        for (path, content) in files {
            repo.write(path, content);
        }
        repo.commit("add configs");

        let client = cp.client();
        let git = Arc::new(
            Client::new(ClientOptions {
                cache_dir: Some(repo.scratch("git-cache")),
                ..Default::default()
            })
            .unwrap(),
        );
        let apps = Arc::new(ApplicationStore::new(client.clone(), HashMap::new()));
        let events = Arc::new(EventStore::new(client.clone()));
        let watcher = EventWatcher::new(
            client,
            git,
            apps,
            events.clone(),
            &piped_spec(&repo.remote()),
            &repo.scratch("ws"),
        );
        Fixture {
            cp,
            repo,
            watcher,
            events,
        }
    }

    impl Fixture {
        async fn add_event(&self, id: &str, created_at: i64) {
            self.add_named_event(id, "image-tag", created_at).await;
        }

        async fn add_named_event(&self, id: &str, name: &str, created_at: i64) {
            self.cp
                .stores()
                .events
                .add(&event(id, name, "dev", created_at))
                .await
                .unwrap();
            self.events.sync().await.unwrap();
        }

        async fn status(&self, id: &str) -> (EventStatus, String) {
            let e = self.cp.stores().events.get(id).await.unwrap();
            (e.status, e.status_description)
        }
    }

    #[tokio::test]
    async fn events_rewrite_yaml_values() {
        let f = fixture(&[
            (".pipe/watcher.yaml", WATCHER),
            ("values.yaml", "image:\n  tag: v1\n"),
        ])
        .await;
        f.add_event("e1", now_unix()).await;

        f.watcher.check_repository(REPO_ID).await.unwrap();

        let values: serde_yaml::Value =
            serde_yaml::from_str(&f.repo.read_remote("values.yaml")).unwrap();
        assert_eq!(values["image"]["tag"], serde_yaml::Value::from("v2"));
        assert_eq!(
            f.repo.head_message().trim(),
            "Replace values with \"v2\" set by Event \"image-tag\""
        );
        assert_eq!(f.status("e1").await.0, EventStatus::Success);
        assert!(f.events.is_empty());
    }

    #[tokio::test]
    async fn up_to_date_values_are_not_committed() {
        let f = fixture(&[
            (".pipe/watcher.yaml", WATCHER),
            ("values.yaml", "image:\n  tag: v2\n"),
        ])
        .await;
        f.add_event("e1", now_unix()).await;

        f.watcher.check_repository(REPO_ID).await.unwrap();
        assert_eq!(f.repo.head_message().trim(), "add configs");
        assert_eq!(
            f.status("e1").await,
            (EventStatus::Success, NO_CHANGES.to_string())
        );
    }

    #[tokio::test]
    async fn older_and_stale_events_are_outdated() {
        let f = fixture(&[
            (".pipe/watcher.yaml", WATCHER),
            ("values.yaml", "image:\n  tag: v1\n"),
        ])
        .await;
        let now = now_unix();
        f.add_event("e1", now - 2 * EVENT_TTL_SECS).await;
        f.add_event("e2", now - EVENT_TTL_SECS - 10).await;

        f.watcher.check_repository(REPO_ID).await.unwrap();
        assert_eq!(
            f.status("e1").await,
            (
                EventStatus::Outdated,
                "The new event e2 has been created".to_string()
            )
        );
        assert_eq!(f.status("e2").await.0, EventStatus::Outdated);
        assert_eq!(f.repo.head_message().trim(), "add configs");
    }

    #[tokio::test]
    async fn a_moved_branch_skips_the_check() {
        let f = fixture(&[
            (".pipe/watcher.yaml", WATCHER),
            ("values.yaml", "image:\n  tag: v1\n"),
        ])
        .await;
        f.add_event("e1", now_unix()).await;

        let (repo, _) = f.watcher.repos.fresh(REPO_ID).await.unwrap();
        f.repo.write("other.txt", "race");
        f.repo.commit("concurrent change");
        f.watcher.handle(REPO_ID, &repo).await.unwrap();
        assert_eq!(f.status("e1").await.0, EventStatus::NotHandled);
        assert_eq!(f.events.len(), 1);

        f.watcher.check_repository(REPO_ID).await.unwrap();
        assert_eq!(f.status("e1").await.0, EventStatus::Success);
        f.repo.sync();
        assert_eq!(f.repo.read_remote("other.txt"), "race");
    }

    #[tokio::test]
    async fn application_watchers_use_the_app_directory() {
        let app_config = r#"apiVersion: keel.dev/v1beta1
kind: KubernetesApp
spec:
  name: A
  eventWatcher:
    - matcher:
        name: image-tag
        labels:
          env: dev
      handler:
        type: GIT_UPDATE
        config:
          commitMessage: "Bump {{ .EventName }} to {{ .Value }}"
          replacements:
            - file: deployment.yaml
              regex: "image: app:(v[0-9]+)"
"#;
        let f = fixture(&[
            ("app/A/app.keel.yaml", app_config),
            ("app/A/deployment.yaml", "image: app:v1\n"),
        ])
        .await;
        f.cp.add_app(&app("a1", "app/A", &f.repo.remote())).await;
        f.watcher.apps.sync().await.unwrap();
        f.add_event("e1", now_unix()).await;

        f.watcher.check_repository(REPO_ID).await.unwrap();
        assert_eq!(f.repo.read_remote("app/A/deployment.yaml"), "image: app:v2\n");
        assert_eq!(f.repo.head_message().trim(), "Bump image-tag to v2");
    }

    #[tokio::test]
    async fn broken_replacements_fail_the_event() {
        let f = fixture(&[
            (".pipe/watcher.yaml", WATCHER),
            ("values.yaml", "image: v1\n"),
        ])
        .await;
        f.add_event("e1", now_unix()).await;

        f.watcher.check_repository(REPO_ID).await.unwrap();
        let (status, desc) = f.status("e1").await;
        assert_eq!(status, EventStatus::Failure);
        assert!(desc.contains("failed to update values.yaml"), "{}", desc);
    }

    #[tokio::test]
    async fn failed_events_are_retried_on_the_next_check() {
        let f = fixture(&[
            (".pipe/watcher.yaml", WATCHER),
            ("values.yaml", "image: v1\n"),
        ])
        .await;
        f.add_event("e1", now_unix()).await;

        f.watcher.check_repository(REPO_ID).await.unwrap();
        assert_eq!(f.status("e1").await.0, EventStatus::Failure);
        assert_eq!(f.events.len(), 1);

        f.repo.write("values.yaml", "image:\n  tag: v1\n");
        f.repo.commit("fix values");
        f.watcher.check_repository(REPO_ID).await.unwrap();
        assert_eq!(f.status("e1").await.0, EventStatus::Success);
        assert!(f.events.is_empty());
        let values: serde_yaml::Value =
            serde_yaml::from_str(&f.repo.read_remote("values.yaml")).unwrap();
        assert_eq!(values["image"]["tag"], serde_yaml::Value::from("v2"));
    }

    #[tokio::test]
    async fn a_moved_branch_still_reports_earlier_outcomes() {
        let watcher = r#"apiVersion: keel.dev/v1beta1
kind: EventWatcher
spec:
  events:
    - name: image-tag
      labels:
        env: dev
      replacements:
        - file: values.yaml
          yamlField: $.image.tag
    - name: chart-tag
      labels:
        env: dev
      replacements:
        - file: values.yaml
          yamlField: $.chart.tag
"#;
        let f = fixture(&[
            (".pipe/watcher.yaml", watcher),
            ("values.yaml", "image:\n  tag: v2\nchart:\n  tag: v1\n"),
        ])
        .await;
        let now = now_unix();
        f.add_named_event("e1", "image-tag", now).await;
        f.add_named_event("e2", "chart-tag", now - 10).await;

        let (repo, _) = f.watcher.repos.fresh(REPO_ID).await.unwrap();
        f.repo.write("other.txt", "race");
        f.repo.commit("concurrent change");
        f.watcher.handle(REPO_ID, &repo).await.unwrap();
        assert_eq!(
            f.status("e1").await,
            (EventStatus::Success, NO_CHANGES.to_string())
        );
        assert_eq!(f.status("e2").await.0, EventStatus::NotHandled);
        assert_eq!(f.events.len(), 1);

        // The newer outcome of e1 must not hide e2 from the next check.
        f.watcher.check_repository(REPO_ID).await.unwrap();
        assert_eq!(f.status("e2").await.0, EventStatus::Success);
        let values: serde_yaml::Value =
            serde_yaml::from_str(&f.repo.read_remote("values.yaml")).unwrap();
        assert_eq!(values["chart"]["tag"], serde_yaml::Value::from("v2"));
    }

    #[test]
    fn duplicate_outcomes_keep_the_failure() {
        let e = event("e1", "image-tag", "dev", 1);
        let mut reports = BTreeMap::new();
        record(&mut reports, &e, EventStatus::Success, "ok".into());
        record(&mut reports, &e, EventStatus::Failure, "boom".into());
        record(&mut reports, &e, EventStatus::Success, "ok".into());
        assert_eq!(reports["e1"].0.status, EventStatus::Failure);
    }
}
