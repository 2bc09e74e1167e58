//! Names of the built-in pipeline stages.

pub const WAIT: &str = "WAIT";
pub const WAIT_APPROVAL: &str = "WAIT_APPROVAL";
pub const ANALYSIS: &str = "ANALYSIS";
pub const SCRIPT_RUN: &str = "SCRIPT_RUN";
pub const SCRIPT_RUN_ROLLBACK: &str = "SCRIPT_RUN_ROLLBACK";

pub const K8S_SYNC: &str = "K8S_SYNC";
pub const K8S_PRIMARY_ROLLOUT: &str = "K8S_PRIMARY_ROLLOUT";
pub const K8S_CANARY_ROLLOUT: &str = "K8S_CANARY_ROLLOUT";
pub const K8S_CANARY_CLEAN: &str = "K8S_CANARY_CLEAN";
pub const K8S_BASELINE_ROLLOUT: &str = "K8S_BASELINE_ROLLOUT";
pub const K8S_BASELINE_CLEAN: &str = "K8S_BASELINE_CLEAN";
pub const K8S_TRAFFIC_ROUTING: &str = "K8S_TRAFFIC_ROUTING";
pub const K8S_ROLLBACK: &str = "K8S_ROLLBACK";

pub const TERRAFORM_SYNC: &str = "TERRAFORM_SYNC";
pub const TERRAFORM_PLAN: &str = "TERRAFORM_PLAN";
pub const TERRAFORM_APPLY: &str = "TERRAFORM_APPLY";
pub const TERRAFORM_ROLLBACK: &str = "TERRAFORM_ROLLBACK";

pub const CLOUDRUN_SYNC: &str = "CLOUDRUN_SYNC";
pub const CLOUDRUN_PROMOTE: &str = "CLOUDRUN_PROMOTE";
pub const CLOUDRUN_ROLLBACK: &str = "CLOUDRUN_ROLLBACK";

pub const LAMBDA_SYNC: &str = "LAMBDA_SYNC";
pub const LAMBDA_PROMOTE: &str = "LAMBDA_PROMOTE";
pub const LAMBDA_ROLLBACK: &str = "LAMBDA_ROLLBACK";

pub const ECS_SYNC: &str = "ECS_SYNC";
pub const ECS_PRIMARY_ROLLOUT: &str = "ECS_PRIMARY_ROLLOUT";
pub const ECS_CANARY_ROLLOUT: &str = "ECS_CANARY_ROLLOUT";
pub const ECS_ROLLBACK: &str = "ECS_ROLLBACK";

pub const CROSSPLANE_SYNC: &str = "CROSSPLANE_SYNC";
pub const CROSSPLANE_ROLLBACK: &str = "CROSSPLANE_ROLLBACK";

/// Generic rollback stage name used when a kind has no dedicated one.
pub const ROLLBACK: &str = "ROLLBACK";
