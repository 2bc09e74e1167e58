use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use crate::app_state::SharedAppState;

pub fn routes(app_state: SharedAppState) -> Router<SharedAppState> {
    Router::new()
        .route("/healthz", get(health_check_handler))
        .with_state(app_state)
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    datastore: keel_common::settings::DataStoreType,
}

/// Unauthenticated liveness probe of the control plane.
async fn health_check_handler(State(state): State<SharedAppState>) -> impl IntoResponse {
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        datastore: state.settings.datastore.r#type,
    })
}
