//! Per trigger kind decisions on whether an application needs a new deployment.
use keel_common::{
    config::GenericApplicationSpec, git::Repo, model::Application,
    util::path_matcher::PathMatcher,
};
use tracing::info;

use crate::error::KeelPipedResult;

pub fn on_command(cfg: &GenericApplicationSpec) -> bool {
    !cfg.trigger.on_command.disabled
}

pub fn on_chain(cfg: &GenericApplicationSpec) -> bool {
    !cfg.trigger.on_chain.disabled
}

/// Out of sync applications are redeployed once nothing is in flight and
/// `minWindow` has passed since the last deployment was triggered or
/// completed successfully, whichever is later.
pub fn on_out_of_sync(
    cfg: &GenericApplicationSpec,
    app: &Application,
    in_flight: bool,
    now: i64,
) -> bool {
    let opts = &cfg.trigger.on_out_of_sync;
    if opts.disabled || in_flight {
        return false;
    }
    let last_triggered = app
        .most_recently_triggered_deployment
        .as_ref()
        .map_or(0, |d| d.started_at);
    let last_success = app
        .most_recently_successful_deployment
        .as_ref()
        .map_or(0, |d| d.completed_at);
    let last = last_triggered.max(last_success);
    if last <= 0 {
        return true;
    }
    let window = opts.min_window.as_std().as_secs() as i64;
    now - last >= window
}

/// A new head triggers the application when the files changed since
/// `last_commit` touch it. An empty `last_commit` always triggers.
pub async fn on_commit(
    cfg: &GenericApplicationSpec,
    app: &Application,
    repo: &Repo,
    last_commit: &str,
    head: &str,
) -> KeelPipedResult<bool> {
    let opts = &cfg.trigger.on_commit;
    if opts.disabled {
        info!(application_id = %app.id, "triggering on commit is disabled");
        return Ok(false);
    }
    if last_commit.is_empty() {
        info!(application_id = %app.id, "no previously triggered deployment was found");
        return Ok(true);
    }
    if last_commit == head {
        return Ok(false);
    }
    let changed = repo.changed_files(last_commit, head).await?;
    let touched = is_touched_by_changed_files(&app.git_path.path, &opts.paths, &opts.ignores, &changed)?;
    if !touched {
        info!(
            application_id = %app.id,
            last_triggered_commit = last_commit,
            head,
            "application was not touched by the new commits"
        );
    }
    Ok(touched)
}

/// Excludes win over includes, and includes over the application directory.
pub fn is_touched_by_changed_files(
    app_dir: &str,
    includes: &[String],
    excludes: &[String],
    changed: &[String],
) -> KeelPipedResult<bool> {
    let excludes = PathMatcher::new(&non_empty(excludes))?;
    if excludes.matches_any(changed) {
        return Ok(false);
    }
    let includes = PathMatcher::new(&non_empty(includes))?;
    if includes.matches_any(changed) {
        return Ok(true);
    }
    let dir = app_dir.trim_start_matches("./").trim_end_matches('/');
    if dir.is_empty() || dir == "." {
        return Ok(!changed.is_empty());
    }
    let prefix = format!("{}/", dir);
    Ok(changed.iter().any(|f| f.starts_with(&prefix)))
}

// An empty pattern would match everything.
fn non_empty(patterns: &[String]) -> Vec<&str> {
    patterns
        .iter()
        .map(String::as_str)
        .filter(|p| !p.is_empty())
        .collect()
}
