use std::sync::Arc;

use keel_common::settings::Settings;

use crate::{error::KeelServerResult, piped_api::PipedApi};

pub type SharedAppState = Arc<AppState>;

pub struct AppState {
    pub api: Arc<PipedApi>,
    pub settings: Settings,
}

impl AppState {
    pub async fn new(settings: Settings) -> KeelServerResult<Self> {
        let stores = keel_database::open_stores(&settings).await?;
        let api = Arc::new(PipedApi::new(stores, settings.web_base_url.clone()));
        Ok(Self { api, settings })
    }

    pub fn with_api(api: Arc<PipedApi>, settings: Settings) -> Self {
        Self { api, settings }
    }
}
