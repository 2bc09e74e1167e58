//! Buffers stage logs and ships them to the control plane.
//!
//! Each `(deployment, stage, retry)` gets its own buffer. Blocks are flushed
//! periodically and sealed with a final checkpoint when the stage completes;
//! a buffer nobody completes is sealed after an hour of inactivity.
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use keel_common::{
    model::{LogBlock, LogSeverity},
    rpc::{
        ApiCode, PipedService, ReportStageLogsFromLastCheckpointRequest, ReportStageLogsRequest,
        RpcError,
    },
    time::{now_unix, now_unix_millis},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::KeelPipedResult;

const FLUSH_INTERVAL: Duration = Duration::from_secs(10);
const STALE_PERIOD: Duration = Duration::from_secs(60 * 60);
const STALE_COMPLETE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StageKey {
    deployment_id: String,
    stage_id: String,
    retried_count: u32,
}

#[derive(Debug)]
struct BufferState {
    blocks: Vec<LogBlock>,
    flushed: usize,
    last_index: i64,
    completed: bool,
    sealed: bool,
    last_activity: Instant,
}

#[derive(Debug)]
struct StageBuffer {
    key: StageKey,
    state: Mutex<BufferState>,
}

impl StageBuffer {
    fn new(key: StageKey) -> Self {
        Self {
            key,
            state: Mutex::new(BufferState {
                blocks: Vec::new(),
                flushed: 0,
                last_index: 0,
                completed: false,
                sealed: false,
                last_activity: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Inner {
    client: Arc<dyn PipedService>,
    stages: DashMap<StageKey, Arc<StageBuffer>>,
    flush_interval: Duration,
    stale_period: Duration,
}

/// Owner of every stage log buffer of this agent.
#[derive(Clone)]
pub struct Persister {
    inner: Arc<Inner>,
}

impl Persister {
    pub fn new(client: Arc<dyn PipedService>) -> Self {
        Self::with_intervals(client, FLUSH_INTERVAL, STALE_PERIOD)
    }

    pub fn with_intervals(
        client: Arc<dyn PipedService>,
        flush_interval: Duration,
        stale_period: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                stages: DashMap::new(),
                flush_interval,
                stale_period,
            }),
        }
    }

    /// Returns the logger of a stage run, creating its buffer on first use.
    pub fn stage_log_persister(
        &self,
        deployment_id: &str,
        stage_id: &str,
        retried_count: u32,
    ) -> StageLogPersister {
        let key = StageKey {
            deployment_id: deployment_id.to_string(),
            stage_id: stage_id.to_string(),
            retried_count,
        };
        let buffer = self
            .inner
            .stages
            .entry(key.clone())
            .or_insert_with(|| Arc::new(StageBuffer::new(key)))
            .clone();
        StageLogPersister {
            inner: self.inner.clone(),
            buffer,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.stages.is_empty()
    }

    pub async fn run(&self, token: CancellationToken) -> KeelPipedResult {
        info!("log persister has been started");
        let mut ticker = tokio::time::interval(self.inner.flush_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.flush_all().await,
            }
        }
        self.flush_all().await;
        info!("log persister has been stopped");
        Ok(())
    }

    /// Flushes every buffer and seals the stale ones.
    pub async fn flush_all(&self) {
        let buffers: Vec<Arc<StageBuffer>> =
            self.inner.stages.iter().map(|e| e.value().clone()).collect();
        for buffer in buffers {
            let stale = buffer.lock().last_activity.elapsed() >= self.inner.stale_period;
            let logger = StageLogPersister {
                inner: self.inner.clone(),
                buffer,
            };
            if stale {
                debug!(
                    deployment_id = %logger.buffer.key.deployment_id,
                    stage_id = %logger.buffer.key.stage_id,
                    "sealing stale stage log"
                );
                if let Err(e) = logger.complete(STALE_COMPLETE_TIMEOUT).await {
                    warn!("failed to seal stale stage log: {}", e);
                }
            } else if let Err(e) = logger.flush().await {
                warn!(
                    deployment_id = %logger.buffer.key.deployment_id,
                    stage_id = %logger.buffer.key.stage_id,
                    "failed to flush stage log: {}", e
                );
            }
        }
    }
}

/// Appends log lines to one stage run.
#[derive(Clone)]
pub struct StageLogPersister {
    inner: Arc<Inner>,
    buffer: Arc<StageBuffer>,
}

impl StageLogPersister {
    pub fn append(&self, log: impl Into<String>, severity: LogSeverity) {
        let mut state = self.buffer.lock();
        if state.completed || state.sealed {
            debug!(
                stage_id = %self.buffer.key.stage_id,
                "dropping log appended after the stage log was completed"
            );
            return;
        }
        let index = now_unix_millis().max(state.last_index + 1);
        state.last_index = index;
        state.last_activity = Instant::now();
        state.blocks.push(LogBlock {
            index,
            log: log.into(),
            severity,
            created_at: now_unix(),
        });
    }

    pub fn info(&self, log: impl Into<String>) {
        self.append(log, LogSeverity::Info)
    }

    pub fn success(&self, log: impl Into<String>) {
        self.append(log, LogSeverity::Success)
    }

    pub fn error(&self, log: impl Into<String>) {
        self.append(log, LogSeverity::Error)
    }

    /// Blocks appended so far, flushed or not.
    pub fn blocks(&self) -> Vec<LogBlock> {
        self.buffer.lock().blocks.clone()
    }

    pub fn is_completed(&self) -> bool {
        let state = self.buffer.lock();
        state.completed || state.sealed
    }

    fn seal(&self) {
        let mut state = self.buffer.lock();
        state.sealed = true;
        state.blocks.clear();
        state.flushed = 0;
        drop(state);
        self.inner.stages.remove(&self.buffer.key);
    }

    async fn flush(&self) -> KeelPipedResult {
        let (blocks, upto) = {
            let state = self.buffer.lock();
            if state.sealed || state.completed || state.flushed >= state.blocks.len() {
                return Ok(());
            }
            (state.blocks[state.flushed..].to_vec(), state.blocks.len())
        };
        let key = &self.buffer.key;
        let req = ReportStageLogsRequest {
            deployment_id: key.deployment_id.clone(),
            stage_id: key.stage_id.clone(),
            retried_count: key.retried_count,
            blocks,
        };
        match self.inner.client.report_stage_logs(req).await {
            Ok(_) => {
                let mut state = self.buffer.lock();
                state.flushed = state.flushed.max(upto);
                Ok(())
            }
            Err(e) if is_already_completed(&e) => {
                info!(
                    deployment_id = %key.deployment_id,
                    stage_id = %key.stage_id,
                    "stage log was already completed on the control plane"
                );
                self.seal();
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Sends every block as the final checkpoint and seals the log.
    pub async fn complete(&self, timeout: Duration) -> KeelPipedResult {
        let blocks = {
            let mut state = self.buffer.lock();
            if state.sealed {
                return Ok(());
            }
            state.completed = true;
            state.blocks.clone()
        };
        let key = &self.buffer.key;
        let req = ReportStageLogsFromLastCheckpointRequest {
            deployment_id: key.deployment_id.clone(),
            stage_id: key.stage_id.clone(),
            retried_count: key.retried_count,
            blocks,
            completed: true,
        };
        let result = tokio::time::timeout(
            timeout,
            self.inner.client.report_stage_logs_from_last_checkpoint(req),
        )
        .await;
        self.seal();
        match result {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) if is_already_completed(&e) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(RpcError::new(
                ApiCode::DeadlineExceeded,
                "timed out completing the stage log",
            )
            .into()),
        }
    }
}

fn is_already_completed(err: &RpcError) -> bool {
    err.code == ApiCode::FailedPrecondition
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ControlPlane;

    #[tokio::test]
    async fn flushes_and_seals_stage_logs() {
        let cp = ControlPlane::new().await;
        cp.add_deployment("d1", &["s1"]).await;
        let persister = Persister::new(cp.client());

        let lp = persister.stage_log_persister("d1", "s1", 0);
        lp.info("starting");
        lp.error("boom");
        persister.flush_all().await;
        let log = cp.stores().stage_logs.fetch("d1", "s1", 0).await.unwrap();
        assert_eq!(log.blocks.len(), 2);
        assert!(!log.completed);

        lp.success("done");
        lp.complete(Duration::from_secs(5)).await.unwrap();
        let log = cp.stores().stage_logs.fetch("d1", "s1", 0).await.unwrap();
        let lines: Vec<&str> = log.blocks.iter().map(|b| b.log.as_str()).collect();
        assert_eq!(lines, vec!["starting", "boom", "done"]);
        assert!(log.completed);
        assert!(persister.is_empty());

        lp.info("late line");
        assert!(lp.blocks().is_empty());
    }

    #[tokio::test]
    async fn drops_buffer_when_the_log_is_already_sealed() {
        let cp = ControlPlane::new().await;
        cp.add_deployment("d1", &["s1"]).await;
        cp.stores()
            .stage_logs
            .put_from_checkpoint("d1", "s1", 0, &[], true)
            .await
            .unwrap();

        let persister = Persister::new(cp.client());
        let lp = persister.stage_log_persister("d1", "s1", 0);
        lp.info("too late");
        persister.flush_all().await;
        assert!(persister.is_empty());
        assert!(lp.is_completed());
    }

    #[tokio::test]
    async fn seals_stale_buffers() {
        let cp = ControlPlane::new().await;
        cp.add_deployment("d1", &["s1"]).await;
        let persister =
            Persister::with_intervals(cp.client(), Duration::from_secs(10), Duration::ZERO);
        let lp = persister.stage_log_persister("d1", "s1", 0);
        lp.info("forgotten");
        persister.flush_all().await;
        let log = cp.stores().stage_logs.fetch("d1", "s1", 0).await.unwrap();
        assert!(log.completed);
        assert_eq!(log.blocks.len(), 1);
    }

    #[tokio::test]
    async fn block_indexes_are_monotonic() {
        let cp = ControlPlane::new().await;
        let persister = Persister::new(cp.client());
        let lp = persister.stage_log_persister("d", "s", 0);
        for i in 0..50 {
            lp.info(format!("line {}", i));
        }
        let blocks = lp.blocks();
        assert_eq!(blocks.len(), 50);
        assert!(blocks.windows(2).all(|w| w[0].index < w[1].index));
    }
}
