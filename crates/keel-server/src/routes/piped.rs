//! `POST /api/piped/:method` carries every piped call as a JSON body.
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use keel_common::rpc::{PipedToken, RpcError, RpcResult, AUTHORIZATION_HEADER};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{app_state::SharedAppState, piped_api::Caller, utils::server_utils::handle_error};

pub fn routes(app_state: SharedAppState) -> Router<SharedAppState> {
    Router::new()
        .route("/:method", post(dispatch))
        .with_state(app_state)
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> RpcResult<T> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}".as_slice()
    } else {
        body
    };
    serde_json::from_slice(body)
        .map_err(|e| RpcError::invalid_argument(format!("malformed request body: {}", e)))
}

fn to_json<T: Serialize>(resp: RpcResult<T>) -> RpcResult<Value> {
    resp.and_then(|r| serde_json::to_value(r).map_err(|e| RpcError::internal(e.to_string())))
}

async fn authenticate(state: &SharedAppState, headers: &HeaderMap) -> RpcResult<Caller> {
    let raw = headers
        .get(AUTHORIZATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RpcError::unauthenticated("missing piped token"))?;
    let token = PipedToken::parse(raw)?;
    state.api.authenticate(&token).await
}

/// Routes `method` to the handler of the same name. Calls without a request
/// body only take the caller.
macro_rules! dispatch_method {
    ($api:expr, $caller:expr, $method:expr, $body:expr;
     no_request: [$($plain:ident),* $(,)?];
     request: [$($with:ident),* $(,)?]) => {
        match $method {
            $(stringify!($plain) => to_json($api.$plain($caller).await),)*
            $(stringify!($with) => match parse($body) {
                Ok(req) => to_json($api.$with($caller, req).await),
                Err(e) => Err(e),
            },)*
            other => Err(RpcError::not_found(format!("unknown method {}", other))),
        }
    };
}

async fn dispatch(
    State(state): State<SharedAppState>,
    Path(method): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let caller = authenticate(&state, &headers).await.map_err(handle_error)?;
    debug!(piped_id = %caller.piped_id, method = %method, "handling piped call");
    let api = &state.api;
    let caller = &caller;
    let result = dispatch_method!(api, caller, method.as_str(), &body;
        no_request: [
            list_applications,
            list_not_completed_deployments,
            list_unhandled_commands,
            get_desired_version,
        ];
        request: [
            ping,
            report_stat,
            report_piped_meta,
            get_environment,
            report_application_sync_state,
            report_application_deploying_status,
            report_application_most_recent_deployment,
            get_application_most_recent_deployment,
            update_application_configurations,
            get_deployment,
            create_deployment,
            report_deployment_planned,
            report_deployment_status_changed,
            report_deployment_completed,
            save_deployment_metadata,
            save_stage_metadata,
            report_stage_logs,
            report_stage_logs_from_last_checkpoint,
            report_stage_status_changed,
            report_command_handled,
            report_application_live_state,
            report_application_live_state_events,
            get_latest_event,
            list_events,
            report_event_statuses,
            get_latest_analysis_result,
            put_latest_analysis_result,
            create_deployment_chain,
            in_chain_deployment_plannable,
        ]
    );
    result.map(Json).map_err(handle_error)
}
