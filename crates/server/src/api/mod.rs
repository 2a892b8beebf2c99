//! HTTP API v2.

pub mod error;
pub mod sessions;
pub mod system;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::runners::ws::runner_ws;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/v2/sessions",
            post(sessions::create).get(sessions::list),
        )
        .route("/v2/sessions/:id", get(sessions::get_session))
        .route("/v2/sessions/:id/prompt", post(sessions::prompt))
        .route("/v2/sessions/:id/stop", post(sessions::stop))
        .route("/v2/sessions/:id/model", post(sessions::set_model))
        .route("/v2/sessions/:id/follow", get(sessions::follow))
        .route("/v2/runners", get(system::list_runners))
        .route("/v2/runners/ws", get(runner_ws))
        .route("/v2/environments", get(system::list_environments))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
