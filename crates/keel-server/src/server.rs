use std::sync::Arc;

use axum::http::{header::CONTENT_TYPE, Method};
use keel_common::settings::Settings;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::{app_state::AppState, error::KeelServerResult, routes};

#[derive(Debug)]
pub struct Server {
    settings: Settings,
}

impl Server {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Serves the piped API until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) -> KeelServerResult<()> {
        let cors = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST])
            .allow_origin(Any)
            .allow_headers([CONTENT_TYPE]);

        let app_state = AppState::new(self.settings.clone()).await?;
        let shared_state = Arc::new(app_state);

        let eviction = tokio::spawn(
            shared_state
                .api
                .clone()
                .run_cache_eviction(token.child_token()),
        );

        let app = routes::routes(shared_state);
        let app = app.layer(cors);

        let addr = format!("{}:{}", self.settings.server.host, self.settings.server.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Control plane started successfully at http://{}", addr);

        let shutdown = token.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        token.cancel();
        let _ = eviction.await;
        info!("Control plane stopped");
        Ok(())
    }
}
