//! Runner and environment listing endpoints.

use axum::extract::State;
use axum::response::Json;

use crate::environment;
use crate::runners::RunnerInfo;
use crate::state::AppState;

pub async fn list_runners(State(state): State<AppState>) -> Json<Vec<RunnerInfo>> {
    Json(state.runners.list())
}

pub async fn list_environments(
    State(state): State<AppState>,
) -> Json<Vec<environment::EnvironmentInfo>> {
    Json(environment::list(&state.config))
}
