use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::{api, gateway, AppState};

/// Operator-facing surface. Concurrency limits are layered on by the
/// caller so tests can drive the bare router.
pub fn admin_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route(
            "/devices",
            get(api::devices::devices_list).delete(api::devices::devices_clear),
        )
        .route(
            "/firmwares",
            get(api::firmwares::firmwares_list)
                .post(api::firmwares::firmwares_upload)
                .delete(api::firmwares::firmwares_clear),
        )
        .route(
            "/firmwares/{id}",
            get(api::firmwares::firmwares_get).delete(api::firmwares::firmwares_delete),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Device-facing surface, served on its own port.
pub fn device_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(gateway::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use ota_events::Bus;
    use ota_kernel::Kernel;
    use ota_protocol::DeviceStatus;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn fixture() -> (tempfile::TempDir, AppState, Router) {
        let dir = tempdir().expect("tempdir");
        let kernel = Kernel::open(dir.path()).expect("kernel");
        let state = AppState::new(Bus::new(64), kernel);
        let router = admin_router(state.clone());
        (dir, state, router)
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.expect("body").to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let (_dir, _state, router) = fixture();
        let resp = router
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn firmware_lifecycle_upload_list_delete() {
        let (_dir, _state, router) = fixture();

        let resp = router
            .clone()
            .oneshot(
                Request::post("/firmwares?version=1.1.0&file_name=app.suit")
                    .body(Body::from(vec![0xAA; 6000]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        assert_eq!(created["version"], "1.1.0");
        assert_eq!(created["size"], 6000);
        let id = created["id"].as_i64().unwrap();

        // Same identity again is a conflict, regardless of the bytes.
        let resp = router
            .clone()
            .oneshot(
                Request::post("/firmwares?version=1.1.0&file_name=app.suit")
                    .body(Body::from(vec![0xBB; 10]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = router
            .clone()
            .oneshot(Request::get("/firmwares").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let listed = body_json(resp).await;
        assert_eq!(listed.as_array().map(|a| a.len()), Some(1));

        let resp = router
            .clone()
            .oneshot(
                Request::get(format!("/firmwares/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["file_name"], "app.suit");

        let resp = router
            .clone()
            .oneshot(
                Request::delete(format!("/firmwares/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = router
            .oneshot(
                Request::delete(format!("/firmwares/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upload_rejects_missing_identity_and_empty_body() {
        let (_dir, _state, router) = fixture();

        let resp = router
            .clone()
            .oneshot(
                Request::post("/firmwares?version=1.1.0")
                    .body(Body::from("abc"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = router
            .oneshot(
                Request::post("/firmwares?version=1.1.0&file_name=app.suit")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn device_snapshot_and_fleet_reset() {
        let (_dir, state, router) = fixture();
        state
            .kernel()
            .upsert_device("AA:BB:CC", Some("10.0.0.9"), Some("1.0.0"), &DeviceStatus::Connected)
            .unwrap();

        let resp = router
            .clone()
            .oneshot(Request::get("/devices").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let listed = body_json(resp).await;
        assert_eq!(listed[0]["device_id"], "AA:BB:CC");
        assert_eq!(listed[0]["status"], "connected");

        let resp = router
            .clone()
            .oneshot(Request::delete("/devices").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(resp).await, serde_json::json!({"removed": 1}));

        let resp = router
            .oneshot(Request::get("/devices").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(resp).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn clearing_firmwares_removes_blobs() {
        let (_dir, state, router) = fixture();

        let resp = router
            .clone()
            .oneshot(
                Request::post("/firmwares?version=2.0.0&file_name=app.suit")
                    .body(Body::from("payload"))
                    .unwrap(),
            )
            .await
            .unwrap();
        let created = body_json(resp).await;
        let hash = created["hash"].as_str().unwrap().to_string();
        assert!(state.kernel().blob_path(&hash).exists());

        let resp = router
            .oneshot(Request::delete("/firmwares").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["removed"], 1);
        assert!(!state.kernel().blob_path(&hash).exists());
    }
}
