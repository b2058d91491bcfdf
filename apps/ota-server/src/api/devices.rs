use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::{responses, AppState};

/// Fleet snapshot straight from the durable records.
pub async fn devices_list(State(state): State<AppState>) -> impl IntoResponse {
    match state.kernel().list_devices_async().await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => responses::internal_error(e),
    }
}

/// Drops every device record and the live-connection bookkeeping. Open
/// channels are left alone; devices re-register on their next handshake.
pub async fn devices_clear(State(state): State<AppState>) -> impl IntoResponse {
    let removed = match state.kernel().clear_devices_async().await {
        Ok(n) => n,
        Err(e) => return responses::internal_error(e),
    };
    state.registry().clear().await;
    Json(json!({"removed": removed})).into_response()
}
