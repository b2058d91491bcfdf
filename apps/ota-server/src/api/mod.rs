use axum::{response::IntoResponse, Json};
use serde_json::json;

pub mod devices;
pub mod firmwares;

pub async fn healthz() -> impl IntoResponse {
    Json(json!({"ok": true}))
}
