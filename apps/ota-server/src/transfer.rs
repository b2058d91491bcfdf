use axum::extract::ws::Message;
use ota_events::Bus;
use ota_kernel::{FirmwareRow, Kernel};
use ota_protocol::UpdateCommand;
use ota_topics as topics;
use serde_json::json;
use tracing::{debug, warn};

use crate::registry::ConnHandle;

/// Payload chunk size for the binary frames following the update command.
/// The receiver reconstructs the artifact by concatenating frames until it
/// has the announced total, so the exact size is a local choice.
pub const CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Announced,
    Sending,
    AwaitingResult,
    Succeeded,
    Failed,
    Aborted,
}

/// One push of one artifact to one device. Ephemeral: owned by the task
/// that runs it, never persisted. `Succeeded` means bytes delivered, which
/// is distinct from installation success; the device's own status reports
/// arrive through the connection handler, not here.
pub struct TransferSession {
    device_id: String,
    firmware: FirmwareRow,
    conn: ConnHandle,
    state: TransferState,
    sent_bytes: u64,
}

impl TransferSession {
    pub fn new(device_id: impl Into<String>, firmware: FirmwareRow, conn: ConnHandle) -> Self {
        Self {
            device_id: device_id.into(),
            firmware,
            conn,
            state: TransferState::Announced,
            sent_bytes: 0,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes
    }

    /// Drives announce → chunked send to completion. There is no retry:
    /// a failed or aborted push is only attempted again by a later
    /// dispatch evaluation.
    pub async fn run(mut self, kernel: &Kernel, bus: &Bus) -> TransferState {
        bus.publish(
            topics::TOPIC_TRANSFER_STARTED,
            &json!({
                "device_id": self.device_id,
                "firmware_id": self.firmware.id,
                "version": self.firmware.version,
                "size": self.firmware.size,
            }),
        );

        let bytes = match kernel.blob_read(&self.firmware.hash).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(device = %self.device_id, error = %err, "firmware blob unavailable; transfer failed");
                self.state = TransferState::Failed;
                self.publish_end(bus, "blob_unavailable");
                return self.state;
            }
        };

        let cmd = UpdateCommand::new(
            self.firmware.version.clone(),
            self.firmware.hash.clone(),
            bytes.len() as u64,
        );
        let announce = match serde_json::to_string(&cmd) {
            Ok(text) => text,
            Err(err) => {
                warn!(device = %self.device_id, error = %err, "update command serialization failed");
                self.state = TransferState::Failed;
                self.publish_end(bus, "encode");
                return self.state;
            }
        };
        if self.conn.send(Message::Text(announce.into())).await.is_err() {
            debug!(device = %self.device_id, "channel closed before announce");
            self.state = TransferState::Aborted;
            self.publish_end(bus, "channel_closed");
            return self.state;
        }

        self.state = TransferState::Sending;
        for chunk in bytes.chunks(CHUNK_SIZE) {
            if self
                .conn
                .send(Message::Binary(chunk.to_vec().into()))
                .await
                .is_err()
            {
                debug!(
                    device = %self.device_id,
                    sent = self.sent_bytes,
                    total = bytes.len(),
                    "channel closed mid-stream"
                );
                self.state = TransferState::Aborted;
                self.publish_end(bus, "channel_closed");
                return self.state;
            }
            self.sent_bytes += chunk.len() as u64;
        }

        self.state = TransferState::AwaitingResult;
        bus.publish(
            topics::TOPIC_TRANSFER_COMPLETED,
            &json!({
                "device_id": self.device_id,
                "firmware_id": self.firmware.id,
                "version": self.firmware.version,
                "bytes": self.sent_bytes,
            }),
        );
        // The session does not wait for the device's verdict; the install
        // result arrives on the status stream and is persisted by the
        // connection handler. Byte delivery is what succeeded here.
        self.state = TransferState::Succeeded;
        self.state
    }

    fn publish_end(&self, bus: &Bus, reason: &str) {
        bus.publish(
            topics::TOPIC_TRANSFER_ABORTED,
            &json!({
                "device_id": self.device_id,
                "firmware_id": self.firmware.id,
                "version": self.firmware.version,
                "bytes": self.sent_bytes,
                "reason": reason,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    async fn kernel_with_artifact(payload: &[u8]) -> (tempfile::TempDir, Kernel, FirmwareRow) {
        let dir = tempdir().expect("tempdir");
        let kernel = Kernel::open(dir.path()).expect("kernel");
        let hash = kernel.blob_put(payload).await.expect("blob");
        let row = kernel
            .insert_firmware("fw.bin", "1.1.0", &hash, payload.len() as i64)
            .expect("insert");
        (dir, kernel, row)
    }

    #[tokio::test]
    async fn full_push_announces_then_streams_all_bytes() {
        let payload = vec![0xAB; CHUNK_SIZE + 100];
        let (_dir, kernel, row) = kernel_with_artifact(&payload).await;
        let bus = Bus::new(8);
        let (tx, mut rx) = mpsc::channel(16);
        let session = TransferSession::new("dev-1", row.clone(), ConnHandle::new(tx));

        let state = session.run(&kernel, &bus).await;
        assert_eq!(state, TransferState::Succeeded);

        let Some(Message::Text(announce)) = rx.recv().await else {
            panic!("expected announce frame");
        };
        let cmd: UpdateCommand = serde_json::from_str(announce.as_str()).unwrap();
        assert_eq!(cmd.command, "update");
        assert_eq!(cmd.version, "1.1.0");
        assert_eq!(cmd.hash, row.hash);
        assert_eq!(cmd.size, payload.len() as u64);

        let mut received = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            match msg {
                Message::Binary(b) => received.extend_from_slice(&b),
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn closed_channel_before_announce_aborts() {
        let (_dir, kernel, row) = kernel_with_artifact(b"abc").await;
        let bus = Bus::new(8);
        let mut events = bus.subscribe();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let session = TransferSession::new("dev-1", row, ConnHandle::new(tx));
        let state = session.run(&kernel, &bus).await;
        assert_eq!(state, TransferState::Aborted);

        let started = events.recv().await.unwrap();
        assert_eq!(started.kind, topics::TOPIC_TRANSFER_STARTED);
        let aborted = events.recv().await.unwrap();
        assert_eq!(aborted.kind, topics::TOPIC_TRANSFER_ABORTED);
        assert_eq!(aborted.payload["bytes"], 0);
    }

    #[tokio::test]
    async fn disconnect_mid_stream_aborts_without_panic() {
        let payload = vec![1u8; CHUNK_SIZE * 3];
        let (_dir, kernel, row) = kernel_with_artifact(&payload).await;
        let bus = Bus::new(8);
        let (tx, mut rx) = mpsc::channel(1);

        // Peer that takes the announce plus one chunk, then goes away.
        let reader = tokio::spawn(async move {
            let _ = rx.recv().await;
            let _ = rx.recv().await;
            drop(rx);
        });

        let session = TransferSession::new("dev-1", row, ConnHandle::new(tx));
        let state = session.run(&kernel, &bus).await;
        reader.await.unwrap();
        assert_eq!(state, TransferState::Aborted);
    }

    #[tokio::test]
    async fn missing_blob_fails_the_session() {
        let dir = tempdir().unwrap();
        let kernel = Kernel::open(dir.path()).unwrap();
        let row = kernel.insert_firmware("fw.bin", "1.0", "deadbeef", 4).unwrap();
        let bus = Bus::new(8);
        let (tx, mut rx) = mpsc::channel(4);

        let session = TransferSession::new("dev-1", row, ConnHandle::new(tx));
        let state = session.run(&kernel, &bus).await;
        assert_eq!(state, TransferState::Failed);
        // Nothing was written to the channel.
        assert!(rx.try_recv().is_err());
    }
}
