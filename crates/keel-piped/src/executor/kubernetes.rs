use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use keel_common::model::StageStatus;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{Executor, ExecutorInput, StopSignal};
use crate::{
    error::KeelPipedResult,
    kubernetes::{
        manifests_of, Applier, ApplierRegistry, Manifest, ResourceKey, LABEL_VARIANT,
        VARIANT_CANARY, VARIANT_PRIMARY,
    },
};

const CANARY_SUFFIX: &str = "-canary";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KubernetesAction {
    Sync,
    PrimaryRollout,
    CanaryRollout,
    CanaryClean,
    Rollback,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncOptions {
    #[serde(default = "default_true")]
    prune: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self { prune: true }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrimaryRolloutOptions {
    #[serde(default)]
    prune: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CanaryRolloutOptions {
    #[serde(default = "default_replicas")]
    replicas: u32,
}

impl Default for CanaryRolloutOptions {
    fn default() -> Self {
        Self { replicas: 1 }
    }
}

fn default_true() -> bool {
    true
}

fn default_replicas() -> u32 {
    1
}

/// Kubernetes stages: sync, primary/canary rollouts and rollback.
pub struct KubernetesExecutor {
    appliers: Arc<ApplierRegistry>,
    action: KubernetesAction,
}

impl KubernetesExecutor {
    pub fn new(appliers: Arc<ApplierRegistry>, action: KubernetesAction) -> Self {
        Self { appliers, action }
    }

    async fn run(&self, input: &ExecutorInput, applier: &dyn Applier, sig: &StopSignal) -> KeelPipedResult<StageStatus> {
        let app_id = input.deployment.application_id.as_str();
        match self.action {
            KubernetesAction::Sync => {
                let opts: SyncOptions = input.stage_config.options()?;
                let target = self.target(input, VARIANT_PRIMARY).await?;
                apply_all(input, applier, &target, sig).await?;
                if opts.prune {
                    let stale = self.stale_keys(input, &target).await?;
                    delete_all(input, applier, &stale, sig).await?;
                }
            }
            KubernetesAction::PrimaryRollout => {
                let opts: PrimaryRolloutOptions = input.stage_config.options()?;
                let target = self.target(input, VARIANT_PRIMARY).await?;
                apply_all(input, applier, &target, sig).await?;
                if opts.prune {
                    let stale = self.stale_keys(input, &target).await?;
                    delete_all(input, applier, &stale, sig).await?;
                }
            }
            KubernetesAction::CanaryRollout => {
                let opts: CanaryRolloutOptions = input.stage_config.options()?;
                let target = self.target(input, VARIANT_CANARY).await?;
                let canaries = canary_manifests(&target, opts.replicas);
                if canaries.is_empty() {
                    input.log.info("There is no workload to create a canary for");
                }
                apply_all(input, applier, &canaries, sig).await?;
            }
            KubernetesAction::CanaryClean => {
                let target = manifests_of(&input.target_source).await?;
                let keys: Vec<ResourceKey> = canary_manifests(&target, 0)
                    .into_iter()
                    .map(|m| m.key)
                    .collect();
                delete_all(input, applier, &keys, sig).await?;
            }
            KubernetesAction::Rollback => {
                let Some(running) = &input.running_source else {
                    input.log.error(
                        "Unable to determine the last deployed commit to rollback. It seems this is the first deployment.",
                    );
                    return Ok(StageStatus::Failure);
                };
                let mut previous = manifests_of(running).await?;
                for m in previous.iter_mut() {
                    m.add_builtin_metadata(app_id, &running.revision, VARIANT_PRIMARY);
                }
                apply_all(input, applier, &previous, sig).await?;

                let target = manifests_of(&input.target_source).await?;
                let previous_keys: BTreeSet<&ResourceKey> = previous.iter().map(|m| &m.key).collect();
                let mut extra: Vec<ResourceKey> = canary_manifests(&target, 0)
                    .into_iter()
                    .map(|m| m.key)
                    .collect();
                extra.extend(
                    target
                        .iter()
                        .filter(|m| !previous_keys.contains(&m.key))
                        .map(|m| m.key.clone()),
                );
                delete_all(input, applier, &extra, sig).await?;
            }
        }
        Ok(match sig.signal() {
            Some(s) => s.stage_status(),
            None => StageStatus::Success,
        })
    }

    async fn target(&self, input: &ExecutorInput, variant: &str) -> KeelPipedResult<Vec<Manifest>> {
        let mut manifests = manifests_of(&input.target_source).await?;
        for m in manifests.iter_mut() {
            m.add_builtin_metadata(
                &input.deployment.application_id,
                &input.target_source.revision,
                variant,
            );
        }
        input.log.info(format!(
            "Loaded {} manifests at commit {}",
            manifests.len(),
            input.target_source.revision
        ));
        Ok(manifests)
    }

    /// Resources of the running commit that the target no longer has.
    async fn stale_keys(&self, input: &ExecutorInput, target: &[Manifest]) -> KeelPipedResult<Vec<ResourceKey>> {
        let Some(running) = &input.running_source else {
            return Ok(Vec::new());
        };
        let keys: BTreeSet<&ResourceKey> = target.iter().map(|m| &m.key).collect();
        Ok(manifests_of(running)
            .await?
            .into_iter()
            .filter(|m| !keys.contains(&m.key))
            .map(|m| m.key)
            .collect())
    }
}

async fn apply_all(
    input: &ExecutorInput,
    applier: &dyn Applier,
    manifests: &[Manifest],
    sig: &StopSignal,
) -> KeelPipedResult {
    for m in manifests {
        if sig.is_stopped() {
            return Ok(());
        }
        applier.apply(m).await?;
        input.log.info(format!("Applied {}", m.key));
    }
    Ok(())
}

async fn delete_all(
    input: &ExecutorInput,
    applier: &dyn Applier,
    keys: &[ResourceKey],
    sig: &StopSignal,
) -> KeelPipedResult {
    for key in keys {
        if sig.is_stopped() {
            return Ok(());
        }
        applier.delete(key).await?;
        input.log.info(format!("Deleted {}", key));
    }
    Ok(())
}

/// Copies of the workloads renamed with the canary suffix and selecting
/// only canary pods. A zero `replicas` keeps the original count.
fn canary_manifests(manifests: &[Manifest], replicas: u32) -> Vec<Manifest> {
    manifests
        .iter()
        .filter(|m| m.is_workload())
        .map(|m| {
            let mut canary = m.clone();
            canary.set_name(&format!("{}{}", m.key.name, CANARY_SUFFIX));
            canary.add_labels([(LABEL_VARIANT, VARIANT_CANARY)]);
            if let Some(spec) = canary.body.get_mut("spec").and_then(Value::as_object_mut) {
                if replicas > 0 {
                    spec.insert("replicas".into(), Value::from(replicas));
                }
                set_variant(spec, &["selector", "matchLabels"]);
                set_variant(spec, &["template", "metadata", "labels"]);
            }
            canary
        })
        .collect()
}

fn set_variant(spec: &mut Map<String, Value>, path: &[&str]) {
    let mut map = spec;
    for p in path {
        let next = map
            .entry(p.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        match next.as_object_mut() {
            Some(m) => map = m,
            None => return,
        }
    }
    map.insert(LABEL_VARIANT.into(), Value::String(VARIANT_CANARY.into()));
}

#[async_trait]
impl Executor for KubernetesExecutor {
    async fn execute(&self, input: &ExecutorInput, sig: StopSignal) -> StageStatus {
        let provider = &input.deployment.platform_provider;
        let Some(applier) = self.appliers.get(provider) else {
            input.log.error(format!(
                "No Kubernetes platform provider named {} was configured",
                provider
            ));
            return StageStatus::Failure;
        };
        match self.run(input, applier.as_ref(), &sig).await {
            Ok(status) => {
                if status == StageStatus::Success {
                    input.log.success("Successfully applied all manifests");
                }
                status
            }
            Err(e) => {
                input.log.error(format!("Failed to apply manifests: {}", e));
                StageStatus::Failure
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use keel_common::{config::PipelineStageConfig, model::stage};

    use super::*;
    use crate::{
        executor::{new_stop_signal, testing},
        kubernetes::fake::FakeApplier,
        testing::{stage as stage_fixture, ControlPlane, TestRepo, PROVIDER},
    };

    const APP: &str = "apiVersion: keel.dev/v1beta1\nkind: KubernetesApp\nspec: {}\n";

    fn workload(image: &str) -> String {
        format!(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: 3\n  selector:\n    matchLabels:\n      app: web\n  template:\n    metadata:\n      labels:\n        app: web\n    spec:\n      containers:\n        - name: web\n          image: {}\n",
            image
        )
    }

    const SERVICE: &str = "apiVersion: v1\nkind: Service\nmetadata:\n  name: web-svc\n";

    fn registry() -> (Arc<ApplierRegistry>, Arc<FakeApplier>) {
        let fake = Arc::new(FakeApplier::default());
        let registry = Arc::new(ApplierRegistry::new());
        registry.register(PROVIDER, fake.clone());
        (registry, fake)
    }

    fn config(name: &str, with: &str) -> PipelineStageConfig {
        PipelineStageConfig {
            name: name.to_string(),
            with: serde_yaml::from_str(with).unwrap(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn sync_applies_and_prunes() {
        let cp = ControlPlane::new().await;
        let repo = TestRepo::new();
        let running = testing::source(
            &repo,
            &[("app.keel.yaml", APP), ("web.yaml", &workload("web:v1")), ("svc.yaml", SERVICE)],
        )
        .await;
        repo.remove("app/A/svc.yaml");
        let target = testing::source(&repo, &[("web.yaml", &workload("web:v2"))]).await;

        let (registry, fake) = registry();
        let input = testing::input(
            &cp,
            stage_fixture("s1", stage::K8S_SYNC, 0, &[]),
            config(stage::K8S_SYNC, "{}"),
            target.clone(),
            Some(running),
        )
        .await;
        let (sig, _handler) = new_stop_signal();
        let status = KubernetesExecutor::new(registry, KubernetesAction::Sync)
            .execute(&input, sig)
            .await;
        assert_eq!(status, StageStatus::Success);
        assert_eq!(fake.applied_names(), vec!["web".to_string()]);
        let applied = fake.applied.lock().unwrap()[0].clone();
        assert_eq!(applied.label(LABEL_VARIANT), Some(VARIANT_PRIMARY));
        let deleted = fake.deleted.lock().unwrap().clone();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].name, "web-svc");
    }

    #[tokio::test]
    async fn canary_rollout_creates_scaled_copies() {
        let cp = ControlPlane::new().await;
        let repo = TestRepo::new();
        let target = testing::source(
            &repo,
            &[("app.keel.yaml", APP), ("web.yaml", &workload("web:v2")), ("svc.yaml", SERVICE)],
        )
        .await;
        let (registry, fake) = registry();
        let input = testing::input(
            &cp,
            stage_fixture("s1", stage::K8S_CANARY_ROLLOUT, 0, &[]),
            config(stage::K8S_CANARY_ROLLOUT, "replicas: 2"),
            target,
            None,
        )
        .await;
        let (sig, _handler) = new_stop_signal();
        let status = KubernetesExecutor::new(registry, KubernetesAction::CanaryRollout)
            .execute(&input, sig)
            .await;
        assert_eq!(status, StageStatus::Success);
        let applied = fake.applied.lock().unwrap().clone();
        assert_eq!(applied.len(), 1);
        let canary = &applied[0];
        assert_eq!(canary.key.name, "web-canary");
        assert_eq!(canary.body["spec"]["replicas"], 2);
        assert_eq!(
            canary.body["spec"]["selector"]["matchLabels"][LABEL_VARIANT],
            VARIANT_CANARY
        );
        assert_eq!(
            canary.body["spec"]["template"]["metadata"]["labels"][LABEL_VARIANT],
            VARIANT_CANARY
        );
    }

    #[tokio::test]
    async fn rollback_without_a_running_commit_fails() {
        let cp = ControlPlane::new().await;
        let repo = TestRepo::new();
        let target = testing::source(&repo, &[("app.keel.yaml", APP), ("web.yaml", &workload("web:v2"))]).await;
        let (registry, fake) = registry();
        let input = testing::input(
            &cp,
            stage_fixture("rollback", stage::K8S_ROLLBACK, 0, &[]),
            PipelineStageConfig::default(),
            target,
            None,
        )
        .await;
        let (sig, _handler) = new_stop_signal();
        let status = KubernetesExecutor::new(registry, KubernetesAction::Rollback)
            .execute(&input, sig)
            .await;
        assert_eq!(status, StageStatus::Failure);
        assert!(fake.applied_names().is_empty());
    }

    #[tokio::test]
    async fn apply_errors_fail_the_stage() {
        let cp = ControlPlane::new().await;
        let repo = TestRepo::new();
        let target = testing::source(&repo, &[("app.keel.yaml", APP), ("web.yaml", &workload("web:v2"))]).await;
        let (registry, fake) = registry();
        fake.fail_on("web");
        let input = testing::input(
            &cp,
            stage_fixture("s1", stage::K8S_SYNC, 0, &[]),
            PipelineStageConfig::default(),
            target,
            None,
        )
        .await;
        let (sig, _handler) = new_stop_signal();
        let status = KubernetesExecutor::new(registry, KubernetesAction::Sync)
            .execute(&input, sig)
            .await;
        assert_eq!(status, StageStatus::Failure);
    }
}
