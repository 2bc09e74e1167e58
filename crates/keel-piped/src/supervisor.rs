//! Binds the lifetimes of the agent components.
//!
//! The first component to fail cancels the shared token; the supervisor then
//! waits for every component to return.
use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{KeelPipedError, KeelPipedResult};

pub struct Supervisor {
    token: CancellationToken,
    tasks: JoinSet<(String, KeelPipedResult)>,
}

impl Supervisor {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            tasks: JoinSet::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn spawn<F>(&mut self, name: &str, task: F)
    where
        F: Future<Output = KeelPipedResult> + Send + 'static,
    {
        let name = name.to_string();
        self.tasks.spawn(async move { (name, task.await) });
    }

    /// Waits for every component. Returns the first failure.
    pub async fn wait(mut self) -> KeelPipedResult {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let (name, result) = match joined {
                Ok(done) => done,
                Err(e) => ("unknown".to_string(), Err(KeelPipedError::from(e))),
            };
            match result {
                Ok(()) => info!(component = %name, "component has stopped"),
                Err(e) => {
                    error!(component = %name, "component failed: {}", e);
                    self.token.cancel();
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test]
    async fn a_failure_stops_every_component() {
        let token = CancellationToken::new();
        let mut supervisor = Supervisor::new(token.clone());
        let stopped = Arc::new(AtomicBool::new(false));

        let (t, flag) = (token.clone(), stopped.clone());
        supervisor.spawn("looping", async move {
            t.cancelled().await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        supervisor.spawn("failing", async { Err(KeelPipedError::runtime("boom")) });
        assert_eq!(supervisor.len(), 2);

        let err = supervisor.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "Runtime error: boom");
        assert!(stopped.load(Ordering::SeqCst));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn graceful_shutdown_is_ok() {
        let token = CancellationToken::new();
        let mut supervisor = Supervisor::new(token.clone());
        let t = supervisor.token();
        supervisor.spawn("looping", async move {
            t.cancelled().await;
            Ok(())
        });
        token.cancel();
        supervisor.wait().await.unwrap();
    }
}
