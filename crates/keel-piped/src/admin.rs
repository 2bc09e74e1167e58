//! Admin HTTP endpoints of the agent and the periodic stat report.
use std::{sync::Arc, time::Duration};

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use keel_common::rpc::{PipedService, ReportStatRequest};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    apiclient::{rpc_retry, with_retry},
    error::{KeelPipedError, KeelPipedResult},
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_ADMIN_PORT: u16 = 9085;
const STAT_INTERVAL: Duration = Duration::from_secs(60);

/// Installs the process wide metrics recorder.
pub fn install_metrics() -> KeelPipedResult<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| KeelPipedError::runtime(format!("unable to install metrics recorder: {}", e)))
}

pub fn routes(metrics: PrometheusHandle) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/version", get(version))
        .route("/metrics", get(render_metrics))
        .with_state(metrics)
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn version() -> impl IntoResponse {
    Json(serde_json::json!({ "version": VERSION }))
}

async fn render_metrics(State(metrics): State<PrometheusHandle>) -> impl IntoResponse {
    metrics.render()
}

pub struct AdminServer {
    port: u16,
    metrics: PrometheusHandle,
}

impl AdminServer {
    pub fn new(port: u16, metrics: PrometheusHandle) -> Self {
        Self { port, metrics }
    }

    pub async fn run(&self, token: CancellationToken) -> KeelPipedResult {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("admin server started at http://{}", addr);
        axum::serve(listener, routes(self.metrics.clone()))
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await?;
        info!("admin server has been stopped");
        Ok(())
    }
}

/// Sends the rendered metrics to the control plane every minute.
pub struct StatsReporter {
    client: Arc<dyn PipedService>,
    metrics: PrometheusHandle,
}

impl StatsReporter {
    pub fn new(client: Arc<dyn PipedService>, metrics: PrometheusHandle) -> Self {
        Self { client, metrics }
    }

    pub async fn run(&self, token: CancellationToken) -> KeelPipedResult {
        let mut ticker = tokio::time::interval(STAT_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.report().await {
                        warn!("failed to report piped stats: {}", e);
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn report(&self) -> KeelPipedResult {
        let req = ReportStatRequest {
            piped_stats: self.metrics.render(),
        };
        with_retry(&rpc_retry(), |_| self.client.report_stat(req.clone())).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::testing::{ControlPlane, PIPED};

    fn handle() -> PrometheusHandle {
        PrometheusBuilder::new().build_recorder().handle()
    }

    async fn get_body(path: &str) -> (StatusCode, String) {
        let resp = routes(handle())
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[tokio::test]
    async fn serves_admin_endpoints() {
        let (status, body) = get_body("/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("ok"));

        let (status, body) = get_body("/version").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(VERSION));

        let (status, _) = get_body("/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(get_body("/unknown").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stats_are_reported() {
        let cp = ControlPlane::new().await;
        let reporter = StatsReporter::new(cp.client(), handle());
        reporter.report().await.unwrap();
        assert!(cp.piped_stat(PIPED).is_some());
    }
}
