use axum::{
    Json,
    extract::{Request, State},
};

use super::{ApiError, AppState};
use crate::state::CallRecord;

const OK_BODY: &str = "OK";
const CONFIG_ROUTE: &str = "POST /__config";

/// `POST /__config`: replaces the test config; an empty body clears it.
pub(super) async fn update_config(
    State(state): State<AppState>,
    request: Request,
) -> Result<&'static str, ApiError> {
    let body = axum::body::to_bytes(request.into_body(), state.max_body_bytes)
        .await
        .map_err(|error| ApiError::BodyRead {
            route: CONFIG_ROUTE.to_string(),
            message: error.to_string(),
        })?;
    match state.store.set_config(&body)? {
        Some(config) => tracing::info!(keys = config.len(), "test config updated"),
        None => tracing::info!("test config cleared"),
    }
    Ok(OK_BODY)
}

/// `POST /__reset_calls`
pub(super) async fn reset_calls(State(state): State<AppState>) -> &'static str {
    state.store.reset_calls();
    tracing::info!("call log reset");
    OK_BODY
}

/// `GET /__calls`
pub(super) async fn list_calls(State(state): State<AppState>) -> Json<Vec<CallRecord>> {
    Json(state.store.calls())
}
