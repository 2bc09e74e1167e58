use std::sync::Arc;

use keel_common::model::AnalysisResult;

use crate::{error::KeelDatabaseResult, filestore::FileStore};

pub fn analysis_result_path(application_id: &str) -> String {
    format!("application-analysis/{}/latest.json", application_id)
}

#[derive(Clone)]
pub struct AnalysisResultStore {
    fs: Arc<dyn FileStore>,
}

impl AnalysisResultStore {
    pub fn new(fs: Arc<dyn FileStore>) -> Self {
        Self { fs }
    }

    pub async fn get_latest(&self, application_id: &str) -> KeelDatabaseResult<AnalysisResult> {
        let data = self.fs.get(&analysis_result_path(application_id)).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub async fn put_latest(
        &self,
        application_id: &str,
        result: &AnalysisResult,
    ) -> KeelDatabaseResult {
        let data = serde_json::to_vec(result)?;
        self.fs.put(&analysis_result_path(application_id), &data).await
    }
}
