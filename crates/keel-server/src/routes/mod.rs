pub mod healthcheck;
pub mod piped;

use axum::Router;

use super::app_state::SharedAppState;

pub fn routes(app_state: SharedAppState) -> Router {
    Router::new()
        .nest("/api/piped", piped::routes(app_state.clone()))
        .merge(healthcheck::routes(app_state.clone()))
        .with_state(app_state)
}
