use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// Problem-details style error body shared by the admin API handlers.
pub fn problem(status: StatusCode, title: &str, detail: impl Into<String>) -> axum::response::Response {
    (
        status,
        Json(json!({
            "type": "about:blank",
            "title": title,
            "status": status.as_u16(),
            "detail": detail.into(),
        })),
    )
        .into_response()
}

pub fn internal_error(err: impl std::fmt::Display) -> axum::response::Response {
    problem(StatusCode::INTERNAL_SERVER_ERROR, "Error", err.to_string())
}

pub fn not_found(detail: impl Into<String>) -> axum::response::Response {
    problem(StatusCode::NOT_FOUND, "Not Found", detail)
}

pub fn bad_request(detail: impl Into<String>) -> axum::response::Response {
    problem(StatusCode::BAD_REQUEST, "Bad Request", detail)
}

pub fn conflict(detail: impl Into<String>) -> axum::response::Response {
    problem(StatusCode::CONFLICT, "Conflict", detail)
}
