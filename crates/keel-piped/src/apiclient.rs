//! HTTP client for the control-plane piped API.
//!
//! Every call is a `POST {address}/api/piped/{method}` carrying the piped
//! token. Failures are decoded from the `{code, message}` error body, falling
//! back to the HTTP status when the body is not one.
use std::{future::Future, time::Duration};

use async_trait::async_trait;
use keel_common::{
    rpc::*,
    util::backoff::RetryPolicy,
};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::error::{KeelPipedError, KeelPipedResult};

pub const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;
pub const RPC_RETRY_ATTEMPTS: u32 = 10;
const RPC_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The retry policy used for every report and poll.
pub fn rpc_retry() -> RetryPolicy {
    RetryPolicy::constant(RPC_RETRY_ATTEMPTS, RPC_RETRY_INTERVAL)
}

/// Runs `op` under `policy`, retrying only the transient codes.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op: F) -> RpcResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = RpcResult<T>>,
{
    policy.run(op, RpcError::is_retriable).await
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    http: reqwest::Client,
    base_url: String,
    authorization: HeaderValue,
}

impl HttpClient {
    /// `address` may omit the scheme; plain HTTP is only used with `insecure`.
    pub fn new(address: &str, token: &PipedToken, insecure: bool) -> KeelPipedResult<Self> {
        let base_url = base_url(address, insecure);
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| KeelPipedError::runtime(format!("unable to build http client: {}", e)))?;
        let authorization = HeaderValue::from_str(&token.header_value())
            .map_err(|e| KeelPipedError::InvalidConfig(format!("invalid piped token: {}", e)))?;
        Ok(Self {
            http,
            base_url,
            authorization,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call<Req, Resp>(&self, method: &str, req: &Req) -> RpcResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/api/piped/{}", self.base_url, method);
        debug!(method, "calling control plane");
        let resp = self
            .http
            .post(&url)
            .header(AUTHORIZATION_HEADER, self.authorization.clone())
            .header(CONTENT_TYPE, "application/json")
            .json(req)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if resp
            .content_length()
            .is_some_and(|len| len as usize > MAX_RESPONSE_BYTES)
        {
            return Err(RpcError::internal(format!(
                "response of {} exceeds the maximum size",
                method
            )));
        }
        let body = resp.bytes().await.map_err(transport_error)?;
        if body.len() > MAX_RESPONSE_BYTES {
            return Err(RpcError::internal(format!(
                "response of {} exceeds the maximum size",
                method
            )));
        }

        if !status.is_success() {
            return Err(decode_error(status.as_u16(), &body));
        }
        serde_json::from_slice(&body)
            .map_err(|e| RpcError::internal(format!("malformed response of {}: {}", method, e)))
    }
}

fn base_url(address: &str, insecure: bool) -> String {
    let address = address.trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        return address.to_string();
    }
    let scheme = if insecure { "http" } else { "https" };
    format!("{}://{}", scheme, address)
}

fn transport_error(err: reqwest::Error) -> RpcError {
    if err.is_timeout() {
        RpcError::new(ApiCode::DeadlineExceeded, err.to_string())
    } else {
        RpcError::unavailable(err.to_string())
    }
}

fn decode_error(status: u16, body: &[u8]) -> RpcError {
    serde_json::from_slice::<RpcError>(body).unwrap_or_else(|_| {
        RpcError::new(
            ApiCode::from_http_status(status),
            String::from_utf8_lossy(body).into_owned(),
        )
    })
}

macro_rules! http_methods {
    (no_request: [$($plain:ident => $presp:ty),* $(,)?];
     request: [$($with:ident($req:ty) => $resp:ty),* $(,)?]) => {
        #[async_trait]
        impl PipedService for HttpClient {
            $(
                async fn $plain(&self) -> RpcResult<$presp> {
                    self.call(stringify!($plain), &Empty {}).await
                }
            )*
            $(
                async fn $with(&self, req: $req) -> RpcResult<$resp> {
                    self.call(stringify!($with), &req).await
                }
            )*
        }
    };
}

http_methods! {
    no_request: [
        list_applications => ListApplicationsResponse,
        list_not_completed_deployments => ListNotCompletedDeploymentsResponse,
        list_unhandled_commands => ListUnhandledCommandsResponse,
        get_desired_version => GetDesiredVersionResponse,
    ];
    request: [
        ping(PingRequest) => Empty,
        report_stat(ReportStatRequest) => Empty,
        report_piped_meta(ReportPipedMetaRequest) => ReportPipedMetaResponse,
        get_environment(GetEnvironmentRequest) => GetEnvironmentResponse,
        report_application_sync_state(ReportApplicationSyncStateRequest) => Empty,
        report_application_deploying_status(ReportApplicationDeployingStatusRequest) => Empty,
        report_application_most_recent_deployment(ReportApplicationMostRecentDeploymentRequest) => Empty,
        get_application_most_recent_deployment(GetApplicationMostRecentDeploymentRequest)
            => GetApplicationMostRecentDeploymentResponse,
        update_application_configurations(UpdateApplicationConfigurationsRequest) => Empty,
        get_deployment(GetDeploymentRequest) => GetDeploymentResponse,
        create_deployment(CreateDeploymentRequest) => Empty,
        report_deployment_planned(ReportDeploymentPlannedRequest) => Empty,
        report_deployment_status_changed(ReportDeploymentStatusChangedRequest) => Empty,
        report_deployment_completed(ReportDeploymentCompletedRequest) => Empty,
        save_deployment_metadata(SaveDeploymentMetadataRequest) => Empty,
        save_stage_metadata(SaveStageMetadataRequest) => Empty,
        report_stage_logs(ReportStageLogsRequest) => Empty,
        report_stage_logs_from_last_checkpoint(ReportStageLogsFromLastCheckpointRequest) => Empty,
        report_stage_status_changed(ReportStageStatusChangedRequest) => Empty,
        report_command_handled(ReportCommandHandledRequest) => Empty,
        report_application_live_state(ReportApplicationLiveStateRequest) => Empty,
        report_application_live_state_events(ReportApplicationLiveStateEventsRequest)
            => ReportApplicationLiveStateEventsResponse,
        get_latest_event(GetLatestEventRequest) => GetLatestEventResponse,
        list_events(ListEventsRequest) => ListEventsResponse,
        report_event_statuses(ReportEventStatusesRequest) => Empty,
        get_latest_analysis_result(GetLatestAnalysisResultRequest) => GetLatestAnalysisResultResponse,
        put_latest_analysis_result(PutLatestAnalysisResultRequest) => Empty,
        create_deployment_chain(CreateDeploymentChainRequest) => CreateDeploymentChainResponse,
        in_chain_deployment_plannable(InChainDeploymentPlannableRequest)
            => InChainDeploymentPlannableResponse,
    ]
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use axum::{extract::Path, http::HeaderMap, routing::post, Json, Router};
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn address_scheme_follows_insecure_flag() {
        assert_eq!(base_url("cp.example.com:443", false), "https://cp.example.com:443");
        assert_eq!(base_url("localhost:9080/", true), "http://localhost:9080");
        assert_eq!(base_url("http://localhost:9080", false), "http://localhost:9080");
    }

    #[test]
    fn decodes_error_bodies() {
        let err = decode_error(412, br#"{"code":"FAILED_PRECONDITION","message":"sealed"}"#);
        assert_eq!(err.code, ApiCode::FailedPrecondition);
        assert_eq!(err.message, "sealed");

        let err = decode_error(503, b"upstream down");
        assert_eq!(err.code, ApiCode::Unavailable);
        assert!(err.is_retriable());
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("127.0.0.1:{}", addr.port())
    }

    #[tokio::test]
    async fn sends_token_and_decodes_responses() {
        let router = Router::new().route(
            "/api/piped/:method",
            post(|Path(method): Path<String>, headers: HeaderMap, Json(body): Json<Value>| async move {
                let auth = headers
                    .get(AUTHORIZATION_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                assert_eq!(auth, "Bearer proj:p1:key");
                match method.as_str() {
                    "get_desired_version" => {
                        assert_eq!(body, json!({}));
                        Ok(Json(json!({"version": "v1.2.3"})))
                    }
                    _ => Err((
                        axum::http::StatusCode::NOT_FOUND,
                        Json(json!({"code": "NOT_FOUND", "message": "no such deployment"})),
                    )),
                }
            }),
        );
        let addr = serve(router).await;
        let client = HttpClient::new(&addr, &PipedToken::new("proj", "p1", "key"), true).unwrap();

        let resp = client.get_desired_version().await.unwrap();
        assert_eq!(resp.version, "v1.2.3");

        let err = client
            .get_deployment(GetDeploymentRequest { id: "d".into() })
            .await
            .unwrap_err();
        assert_eq!(err.code, ApiCode::NotFound);
        assert_eq!(err.message, "no such deployment");
    }

    #[tokio::test]
    async fn retries_only_transient_codes() {
        let policy = RetryPolicy::constant(4, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));

        let c = calls.clone();
        let out: RpcResult<u32> = with_retry(&policy, |attempt| {
            c.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(RpcError::unavailable("busy"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(out.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        calls.store(0, Ordering::SeqCst);
        let c = calls.clone();
        let out: RpcResult<()> = with_retry(&policy, |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(RpcError::permission_denied("not yours")) }
        })
        .await;
        assert_eq!(out.unwrap_err().code, ApiCode::PermissionDenied);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
