use std::collections::HashSet;
use std::sync::Arc;

use ota_events::Bus;
use ota_kernel::Kernel;
use ota_topics as topics;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::{
    registry::ConnectionRegistry,
    tasks::{self, TaskHandle},
    transfer::TransferSession,
    AppState,
};

/// Decides whether a device needs a push and hands the work to a
/// concurrent transfer task. Never blocks the caller across a transfer.
pub struct UpdateDispatcher {
    kernel: Kernel,
    bus: Bus,
    registry: Arc<ConnectionRegistry>,
    in_flight: Mutex<HashSet<String>>,
}

impl UpdateDispatcher {
    pub fn new(kernel: Kernel, bus: Bus, registry: Arc<ConnectionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            kernel,
            bus,
            registry,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Compares the device's reported version against the catalog's latest
    /// artifact and starts a transfer session when they differ. Idempotent
    /// for up-to-date devices and a no-op while a session is in flight.
    pub async fn evaluate(self: &Arc<Self>, device_id: &str) {
        let latest = match self.kernel.latest_firmware_async().await {
            Ok(Some(row)) => row,
            Ok(None) => return,
            Err(err) => {
                warn!(device = %device_id, error = %err, "catalog lookup failed");
                return;
            }
        };
        let reported = match self.kernel.get_device_async(device_id).await {
            Ok(row) => row.and_then(|r| r.current_version),
            Err(err) => {
                warn!(device = %device_id, error = %err, "device record lookup failed");
                return;
            }
        };
        // Plain string inequality. No version ordering is implied: an
        // "older" upload still gets pushed.
        if reported.as_deref() == Some(latest.version.as_str()) {
            debug!(device = %device_id, version = %latest.version, "device up to date");
            return;
        }

        // One session per device: the registry lookup happens inside the
        // in-flight critical section, so a vanished device never gets
        // marked and two evaluations never race into one channel.
        let conn = {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight.contains(device_id) {
                debug!(device = %device_id, "transfer already in flight");
                return;
            }
            let Some(conn) = self.registry.get(device_id).await else {
                return;
            };
            in_flight.insert(device_id.to_string());
            conn
        };

        let this = self.clone();
        let device = device_id.to_string();
        tokio::spawn(async move {
            let session = TransferSession::new(device.clone(), latest, conn);
            let outcome = session.run(&this.kernel, &this.bus).await;
            debug!(device = %device, ?outcome, "transfer session finished");
            this.in_flight.lock().await.remove(&device);
        });
    }

    /// Sweeps every identifier currently in the registry. A device
    /// disappearing mid-iteration is skipped, not an error.
    pub async fn evaluate_all(self: &Arc<Self>) {
        for device_id in self.registry.device_ids().await {
            self.evaluate(&device_id).await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn in_flight_len(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

/// Background task reacting to catalog additions with a fleet sweep. The
/// admin path only publishes the event; all dispatch runs here.
pub fn start(state: AppState) -> TaskHandle {
    let bus = state.bus().clone();
    let dispatcher = state.dispatcher().clone();
    tasks::spawn_supervised("dispatcher.on_firmware_added", move || {
        let bus = bus.clone();
        let dispatcher = dispatcher.clone();
        async move {
            let mut rx = bus.subscribe();
            loop {
                match rx.recv().await {
                    Ok(env) if env.kind == topics::TOPIC_FIRMWARE_ADDED => {
                        dispatcher.evaluate_all().await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "dispatcher fell behind the bus; running a sweep");
                        dispatcher.evaluate_all().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    })
}
