//! Local caches of control-plane state, each refreshed by its own polling
//! loop and read without touching the network.
use std::{
    future::Future,
    sync::{Arc, RwLock},
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::KeelPipedResult;

pub mod application_store;
pub mod command_store;
pub mod deployment_store;
pub mod event_store;

pub use application_store::ApplicationStore;
pub use command_store::CommandStore;
pub use deployment_store::DeploymentStore;
pub use event_store::EventStore;

/// A list swapped as a whole on every refresh.
pub(crate) struct Snapshot<T> {
    inner: RwLock<Arc<Vec<T>>>,
}

impl<T> Snapshot<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub(crate) fn load(&self) -> Arc<Vec<T>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn store(&self, items: Vec<T>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(items);
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut Vec<T>))
    where
        T: Clone,
    {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(Arc::make_mut(&mut guard));
    }
}

/// Calls `sync` every `interval` until the token is cancelled. Failed
/// refreshes keep the previous snapshot.
pub(crate) async fn poll<F, Fut>(
    name: &str,
    interval: Duration,
    token: CancellationToken,
    mut sync: F,
) -> KeelPipedResult
where
    F: FnMut() -> Fut,
    Fut: Future<Output = KeelPipedResult>,
{
    info!(store = name, "api store has been started");
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = sync().await {
                    warn!(store = name, "failed to refresh from the control plane: {}", e);
                }
            }
        }
    }
    info!(store = name, "api store has been stopped");
    Ok(())
}
