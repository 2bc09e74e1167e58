//! Kubernetes manifests: loading from Git, comparing with live objects and
//! applying to clusters.
mod applier;
mod diff;
mod manifest;

#[cfg(test)]
pub(crate) use applier::fake;
pub use applier::{kube_client, Applier, ApplierRegistry, KubeApplier};
pub use diff::{diff_manifests, DiffResult};
pub use manifest::*;
