use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use ota_protocol::{DeviceStatus, Handshake, StatusReport};
use ota_topics as topics;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{registry::ConnHandle, AppState};

/// Queue depth between a connection's writer task and its WebSocket sink.
const WRITE_QUEUE: usize = 32;

/// Close code for a handshake that violates the protocol.
const POLICY_VIOLATION: u16 = 1008;

pub async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_device(state, socket, addr))
}

fn valid_handshake(text: &str) -> Option<Handshake> {
    serde_json::from_str::<Handshake>(text)
        .ok()
        .filter(|h| !h.device_id.trim().is_empty())
}

/// Owns one device channel end to end: handshake, registration, dispatch
/// trigger, inbound status loop, teardown.
async fn handle_device(state: AppState, socket: WebSocket, addr: SocketAddr) {
    let (mut sink, mut stream) = socket.split();

    // First data frame must identify the device. A violation closes this
    // channel and affects nothing else.
    let handshake = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => break valid_handshake(text.as_str()),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            _ => break None,
        }
    };
    let Some(handshake) = handshake else {
        warn!(peer = %addr, "handshake rejected: device id required");
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: POLICY_VIOLATION,
                reason: "device id is required".into(),
            })))
            .await;
        return;
    };

    let device_id = handshake.device_id.clone();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Message>(WRITE_QUEUE);
    let handle = ConnHandle::new(tx);
    let conn_id = handle.id();

    // The writer task owns the sink. It ends when every sender is gone or
    // the peer stops accepting frames, which is also how in-flight
    // transfer sessions observe a disconnect.
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Registration goes first so it is visible before dispatch runs.
    state.registry().insert(&device_id, handle).await;
    if let Err(err) = state
        .kernel()
        .upsert_device_async(
            &device_id,
            Some(&addr.ip().to_string()),
            Some(&handshake.current_version),
            &DeviceStatus::Connected,
        )
        .await
    {
        warn!(device = %device_id, error = %err, "device record upsert failed");
    }
    info!(
        device = %device_id,
        peer = %addr,
        version = %handshake.current_version,
        "device connected"
    );
    state.bus().publish(
        topics::TOPIC_DEVICE_CONNECTED,
        &json!({
            "device_id": device_id,
            "ip": addr.ip().to_string(),
            "version": handshake.current_version,
        }),
    );
    state.dispatcher().evaluate(&device_id).await;

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                apply_status_report(&state, &device_id, text.as_str()).await;
            }
            Ok(Message::Binary(_)) => {
                debug!(device = %device_id, "ignoring unexpected binary frame");
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(device = %device_id, error = %err, "read error; closing");
                break;
            }
        }
    }

    teardown(&state, &device_id, conn_id).await;
}

/// Applies one inbound status report. Reports are awaited in arrival
/// order on this task, so per-device updates never reorder. Malformed
/// frames are logged and dropped.
async fn apply_status_report(state: &AppState, device_id: &str, text: &str) {
    let Ok(report) = serde_json::from_str::<StatusReport>(text) else {
        debug!(device = %device_id, frame = %text, "ignoring non-status frame");
        return;
    };
    let status = DeviceStatus::parse(&report.status);
    match state
        .kernel()
        .update_device_status_async(device_id, &status, report.version.as_deref())
        .await
    {
        Ok(true) => {
            debug!(device = %device_id, status = %status, "status report applied");
            state.bus().publish(
                topics::TOPIC_DEVICE_STATUS,
                &json!({
                    "device_id": device_id,
                    "status": status.as_wire(),
                    "version": report.version,
                }),
            );
        }
        Ok(false) => {
            debug!(device = %device_id, "status report for unknown record ignored");
        }
        Err(err) => {
            warn!(device = %device_id, error = %err, "status update failed");
        }
    }
}

/// Runs once per handler when its read loop ends, from either side. The
/// guarded removal keeps a superseding reconnection's entry intact; in
/// that case the record belongs to the new handler and is left alone.
async fn teardown(state: &AppState, device_id: &str, conn_id: Uuid) {
    if !state.registry().remove_if(device_id, conn_id).await {
        debug!(device = %device_id, "connection superseded; skipping disconnect record");
        return;
    }
    if let Err(err) = state
        .kernel()
        .update_device_status_async(device_id, &DeviceStatus::Disconnected, None)
        .await
    {
        warn!(device = %device_id, error = %err, "disconnect record update failed");
    }
    info!(device = %device_id, "device disconnected");
    state.bus().publish(
        topics::TOPIC_DEVICE_DISCONNECTED,
        &json!({"device_id": device_id}),
    );
}
