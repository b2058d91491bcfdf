use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use ota_kernel::CatalogError;
use ota_topics as topics;
use serde::Deserialize;
use serde_json::json;
use sha2::Digest as _;
use tracing::{info, warn};

use crate::{responses, AppState};

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub version: String,
    pub file_name: String,
}

pub async fn firmwares_list(State(state): State<AppState>) -> impl IntoResponse {
    match state.kernel().list_firmwares_async().await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => responses::internal_error(e),
    }
}

/// Registers an artifact: raw bytes in the body, identity in the query.
/// The catalog row lands before the bytes so a duplicate is rejected
/// without touching the blob store; dispatch happens via the bus, never
/// inline on this request.
pub async fn firmwares_upload(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> impl IntoResponse {
    let version = params.version.trim();
    let file_name = params.file_name.trim();
    if version.is_empty() {
        return responses::bad_request("version must not be empty");
    }
    if file_name.is_empty() {
        return responses::bad_request("file_name must not be empty");
    }
    if body.is_empty() {
        return responses::bad_request("firmware body must not be empty");
    }

    let mut h = sha2::Sha256::new();
    h.update(&body);
    let hash = hex::encode(h.finalize());
    let size = body.len() as i64;

    let row = match state
        .kernel()
        .insert_firmware_async(file_name, version, &hash, size)
        .await
    {
        Ok(row) => row,
        Err(CatalogError::Duplicate) => {
            return responses::conflict(format!(
                "firmware {} version {} already registered",
                file_name, version
            ));
        }
        Err(CatalogError::Other(e)) => return responses::internal_error(e),
    };

    if let Err(e) = state.kernel().blob_put(&body).await {
        // Roll the row back so the catalog never advertises missing bytes.
        if let Err(del) = state.kernel().delete_firmware_async(row.id).await {
            warn!(id = row.id, error = %del, "rollback of failed upload did not complete");
        }
        return responses::internal_error(e);
    }

    info!(
        id = row.id,
        file = %row.file_name,
        version = %row.version,
        size = row.size,
        "firmware registered"
    );
    state.bus().publish(topics::TOPIC_FIRMWARE_ADDED, &json!(row));
    (StatusCode::CREATED, Json(row)).into_response()
}

pub async fn firmwares_get(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.kernel().get_firmware_async(id).await {
        Ok(Some(row)) => Json(row).into_response(),
        Ok(None) => responses::not_found(format!("no firmware with id {}", id)),
        Err(e) => responses::internal_error(e),
    }
}

/// Removes one catalog row; the blob goes too once nothing references it.
pub async fn firmwares_delete(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.kernel().delete_firmware_async(id).await {
        Ok(Some((row, remaining))) => {
            if remaining == 0 {
                if let Err(e) = state.kernel().blob_remove(&row.hash).await {
                    warn!(hash = %row.hash, error = %e, "blob removal failed");
                }
            }
            state
                .bus()
                .publish(topics::TOPIC_FIRMWARE_REMOVED, &json!(row));
            Json(row).into_response()
        }
        Ok(None) => responses::not_found(format!("no firmware with id {}", id)),
        Err(e) => responses::internal_error(e),
    }
}

/// Empties the catalog and its blob directory.
pub async fn firmwares_clear(State(state): State<AppState>) -> impl IntoResponse {
    let removed = match state.kernel().clear_firmwares_async().await {
        Ok(rows) => rows,
        Err(e) => return responses::internal_error(e),
    };
    let mut hashes: Vec<&str> = removed.iter().map(|r| r.hash.as_str()).collect();
    hashes.sort_unstable();
    hashes.dedup();
    for hash in hashes {
        if let Err(e) = state.kernel().blob_remove(hash).await {
            warn!(hash = %hash, error = %e, "blob removal failed");
        }
    }
    state.bus().publish(
        topics::TOPIC_FIRMWARE_REMOVED,
        &json!({"cleared": removed.len()}),
    );
    Json(json!({"removed": removed.len()})).into_response()
}
