use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use ota_events::Bus;
use ota_kernel::Kernel;
use ota_topics as topics;
use serde_json::json;
use tracing::info;

use crate::{dispatcher, tasks::TaskManager, AppState};

const DEFAULT_BIND: &str = "0.0.0.0";
const DEFAULT_ADMIN_PORT: u16 = 8090;
const DEFAULT_DEVICE_PORT: u16 = 8765;
const DEFAULT_STATE_DIR: &str = "./state";
const DEFAULT_HTTP_MAX_CONC: usize = 1024;
const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub admin_addr: SocketAddr,
    pub device_addr: SocketAddr,
    pub state_dir: PathBuf,
    pub concurrency_limit: usize,
}

pub fn config_from_env() -> Result<ServerConfig> {
    let bind = std::env::var("OTA_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let admin_port = env_parse("OTA_ADMIN_PORT", DEFAULT_ADMIN_PORT)?;
    let device_port = env_parse("OTA_DEVICE_PORT", DEFAULT_DEVICE_PORT)?;
    let state_dir = std::env::var("OTA_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_STATE_DIR));
    let concurrency_limit = env_parse("OTA_HTTP_MAX_CONC", DEFAULT_HTTP_MAX_CONC)?;

    let admin_addr = format!("{}:{}", bind, admin_port)
        .parse()
        .with_context(|| format!("invalid OTA_BIND/OTA_ADMIN_PORT ({}:{})", bind, admin_port))?;
    let device_addr = format!("{}:{}", bind, device_port)
        .parse()
        .with_context(|| format!("invalid OTA_BIND/OTA_DEVICE_PORT ({}:{})", bind, device_port))?;

    Ok(ServerConfig {
        admin_addr,
        device_addr,
        state_dir,
        concurrency_limit,
    })
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {} ({})", key, raw)),
        Err(_) => Ok(default),
    }
}

pub struct BootstrapOutput {
    pub state: AppState,
    pub background_tasks: TaskManager,
}

/// Opens durable state, wires the shared handles, and starts the
/// dispatcher's bus subscriber.
pub async fn build(cfg: &ServerConfig) -> Result<BootstrapOutput> {
    let kernel = Kernel::open(&cfg.state_dir)
        .with_context(|| format!("open state dir {}", cfg.state_dir.display()))?;
    let bus = Bus::new(BUS_CAPACITY);
    let state = AppState::new(bus, kernel);

    let mut background_tasks = TaskManager::new();
    background_tasks.push(dispatcher::start(state.clone()));

    info!(state_dir = %cfg.state_dir.display(), "service state ready");
    state.bus().publish(
        topics::TOPIC_SERVICE_START,
        &json!({
            "admin_addr": cfg.admin_addr.to_string(),
            "device_addr": cfg.device_addr.to_string(),
        }),
    );

    Ok(BootstrapOutput {
        state,
        background_tasks,
    })
}
