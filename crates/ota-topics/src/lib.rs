//! Canonical event topic constants shared across the server.
//!
//! Centralizing the strings keeps publishers and subscribers in sync.
//! Keep this list alphabetized within sections and favor dot.case names.

// Devices
pub const TOPIC_DEVICE_CONNECTED: &str = "device.connected";
pub const TOPIC_DEVICE_DISCONNECTED: &str = "device.disconnected";
pub const TOPIC_DEVICE_STATUS: &str = "device.status";

// Firmware catalog
pub const TOPIC_FIRMWARE_ADDED: &str = "firmware.added";
pub const TOPIC_FIRMWARE_REMOVED: &str = "firmware.removed";

// Transfer sessions
pub const TOPIC_TRANSFER_ABORTED: &str = "transfer.aborted";
pub const TOPIC_TRANSFER_COMPLETED: &str = "transfer.completed";
pub const TOPIC_TRANSFER_STARTED: &str = "transfer.started";

// Service lifecycle
pub const TOPIC_SERVICE_START: &str = "service.start";
