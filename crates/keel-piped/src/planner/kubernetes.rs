use async_trait::async_trait;
use keel_common::{config::KubernetesInput, model::ApplicationKind, time::now_unix};

use super::{
    decide_strategy, pipeline_stages, quick_sync_stages, Planner, PlannerInput, PlannerOutput,
    Strategy,
};
use crate::{
    error::KeelPipedResult,
    kubernetes::{find_images, manifests_of, short_image_name, Manifest},
};

/// Rolls out progressively when a workload changes, quick syncs otherwise.
pub struct KubernetesPlanner;

#[async_trait]
impl Planner for KubernetesPlanner {
    async fn plan(&self, input: &PlannerInput) -> KeelPipedResult<PlannerOutput> {
        let cfg = &input.target.app_config;
        let k8s: KubernetesInput = cfg.input()?;
        let target = manifests_of(&input.target).await?;
        let images = find_images(&target);
        let version = if images.is_empty() {
            "unknown".to_string()
        } else {
            images
                .iter()
                .map(|i| short_image_name(i))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let strategy = match decide_strategy(input)? {
            Some(s) => s,
            None => match &input.running {
                Some(running) => {
                    let running = manifests_of(running).await?;
                    determine_strategy(&running, &target)
                }
                None => Strategy::Quick("Quick sync because this is the first deployment".into()),
            },
        };

        let now = now_unix();
        let (stages, summary) = match strategy {
            Strategy::Quick(summary) => (
                quick_sync_stages(ApplicationKind::Kubernetes, k8s.auto_rollback, now),
                summary,
            ),
            Strategy::Pipeline(summary) => (
                pipeline_stages(ApplicationKind::Kubernetes, cfg, k8s.auto_rollback, now),
                summary,
            ),
        };
        Ok(PlannerOutput {
            stages,
            summary,
            version,
        })
    }
}

fn determine_strategy(running: &[Manifest], target: &[Manifest]) -> Strategy {
    let old_images = find_images(running);
    for image in find_images(target) {
        if old_images.contains(&image) {
            continue;
        }
        let name = image_name(&image);
        let summary = match old_images.iter().find(|o| image_name(o) == name) {
            Some(old) => format!(
                "Sync progressively because of updating image {} from {} to {}",
                name,
                image_tag(old),
                image_tag(&image)
            ),
            None => format!("Sync progressively because of adding image {}", image),
        };
        return Strategy::Pipeline(summary);
    }

    for workload in target.iter().filter(|m| m.is_workload()) {
        let changed = running
            .iter()
            .find(|r| r.key == workload.key)
            .map_or(true, |r| r.body != workload.body);
        if changed {
            return Strategy::Pipeline(format!(
                "Sync progressively because of updating workload {}",
                workload.key.name
            ));
        }
    }
    Strategy::Quick(
        "Quick sync by applying all manifests because there are no changes in workloads".into(),
    )
}

fn image_name(image: &str) -> &str {
    match image.rfind(':') {
        Some(i) if !image[i..].contains('/') => &image[..i],
        _ => image,
    }
}

fn image_tag(image: &str) -> &str {
    let name = image_name(image);
    image[name.len()..].trim_start_matches(':')
}
