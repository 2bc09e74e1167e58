use std::sync::Arc;

use keel_common::model::LogBlock;
use tokio::sync::Mutex;

use crate::{
    error::{KeelDatabaseError, KeelDatabaseResult},
    filestore::FileStore,
};

/// Last line of a sealed stage log.
pub const END_OF_LOG: &str = "EOL";

pub fn stage_log_path(deployment_id: &str, stage_id: &str, retried_count: u32) -> String {
    format!("log/{}/{}/{}.txt", deployment_id, stage_id, retried_count)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageLog {
    pub blocks: Vec<LogBlock>,
    pub completed: bool,
}

impl StageLog {
    fn parse(data: &[u8]) -> KeelDatabaseResult<Self> {
        let text = String::from_utf8_lossy(data);
        let mut log = StageLog::default();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            if line == END_OF_LOG {
                log.completed = true;
                break;
            }
            log.blocks.push(serde_json::from_str(line)?);
        }
        Ok(log)
    }

    fn encode(&self) -> KeelDatabaseResult<Vec<u8>> {
        let mut out = String::new();
        for block in &self.blocks {
            out.push_str(&serde_json::to_string(block)?);
            out.push('\n');
        }
        if self.completed {
            out.push_str(END_OF_LOG);
            out.push('\n');
        }
        Ok(out.into_bytes())
    }

    fn last_index(&self) -> Option<i64> {
        self.blocks.last().map(|b| b.index)
    }
}

/// Stage logs kept as newline delimited JSON blocks in the file store.
#[derive(Clone)]
pub struct StageLogStore {
    fs: Arc<dyn FileStore>,
    write_lock: Arc<Mutex<()>>,
}

impl StageLogStore {
    pub fn new(fs: Arc<dyn FileStore>) -> Self {
        Self {
            fs,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn fetch(
        &self,
        deployment_id: &str,
        stage_id: &str,
        retried_count: u32,
    ) -> KeelDatabaseResult<StageLog> {
        let path = stage_log_path(deployment_id, stage_id, retried_count);
        match self.fs.get(&path).await {
            Ok(data) => StageLog::parse(&data),
            Err(e) if e.is_not_found() => Ok(StageLog::default()),
            Err(e) => Err(e),
        }
    }

    /// Appends blocks in arrival order. Blocks at or below the last stored
    /// index are replays and are skipped.
    pub async fn append(
        &self,
        deployment_id: &str,
        stage_id: &str,
        retried_count: u32,
        blocks: &[LogBlock],
    ) -> KeelDatabaseResult {
        let _guard = self.write_lock.lock().await;
        let mut log = self.fetch(deployment_id, stage_id, retried_count).await?;
        if log.completed {
            return Err(sealed(deployment_id, stage_id));
        }
        let mut last = log.last_index();
        for block in blocks {
            if last.is_some_and(|l| block.index <= l) {
                continue;
            }
            last = Some(block.index);
            log.blocks.push(block.clone());
        }
        let path = stage_log_path(deployment_id, stage_id, retried_count);
        self.fs.put(&path, &log.encode()?).await
    }

    /// Replaces the stored blocks with everything the piped buffered since
    /// its last checkpoint and seals the log when `completed`.
    pub async fn put_from_checkpoint(
        &self,
        deployment_id: &str,
        stage_id: &str,
        retried_count: u32,
        blocks: &[LogBlock],
        completed: bool,
    ) -> KeelDatabaseResult {
        let _guard = self.write_lock.lock().await;
        let current = self.fetch(deployment_id, stage_id, retried_count).await?;
        if current.completed {
            return Err(sealed(deployment_id, stage_id));
        }
        let log = StageLog {
            blocks: blocks.to_vec(),
            completed,
        };
        let path = stage_log_path(deployment_id, stage_id, retried_count);
        self.fs.put(&path, &log.encode()?).await
    }
}

fn sealed(deployment_id: &str, stage_id: &str) -> KeelDatabaseError {
    KeelDatabaseError::FailedPrecondition(format!(
        "log of stage {} in deployment {} is already completed",
        stage_id, deployment_id
    ))
}

#[cfg(test)]
mod tests {
    use keel_common::model::LogSeverity;

    use super::*;
    use crate::repos::testing::stores;

    fn block(index: i64, log: &str) -> LogBlock {
        LogBlock {
            index,
            log: log.to_string(),
            severity: LogSeverity::Info,
            created_at: index,
        }
    }

    #[tokio::test]
    async fn append_skips_replayed_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let s = stores(&dir);
        s.stage_logs
            .append("d1", "s1", 0, &[block(1, "a"), block(2, "b")])
            .await
            .unwrap();
        s.stage_logs
            .append("d1", "s1", 0, &[block(2, "b"), block(3, "c")])
            .await
            .unwrap();
        let log = s.stage_logs.fetch("d1", "s1", 0).await.unwrap();
        let lines: Vec<&str> = log.blocks.iter().map(|b| b.log.as_str()).collect();
        assert_eq!(lines, vec!["a", "b", "c"]);
        assert!(!log.completed);
        assert!(s.stage_logs.fetch("d1", "s1", 1).await.unwrap().blocks.is_empty());
    }

    #[tokio::test]
    async fn sealed_log_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let s = stores(&dir);
        s.stage_logs
            .put_from_checkpoint("d1", "s1", 0, &[block(1, "a")], true)
            .await
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("log/d1/s1/0.txt")).unwrap();
        assert_eq!(raw.lines().last(), Some(END_OF_LOG));

        let err = s
            .stage_logs
            .append("d1", "s1", 0, &[block(2, "b")])
            .await
            .unwrap_err();
        assert!(matches!(err, KeelDatabaseError::FailedPrecondition(_)));
        let err = s
            .stage_logs
            .put_from_checkpoint("d1", "s1", 0, &[], true)
            .await
            .unwrap_err();
        assert!(matches!(err, KeelDatabaseError::FailedPrecondition(_)));

        let log = s.stage_logs.fetch("d1", "s1", 0).await.unwrap();
        assert!(log.completed);
        assert_eq!(log.blocks.len(), 1);
    }
}
