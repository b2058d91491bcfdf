use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Send side of one live device channel.
///
/// The WebSocket sink itself is owned by a writer task; this handle feeds
/// it through a bounded queue, so a slow or gone peer shows up as a
/// blocked or failed send rather than shared-sink contention.
#[derive(Clone)]
pub struct ConnHandle {
    id: Uuid,
    tx: mpsc::Sender<Message>,
}

#[derive(Debug, thiserror::Error)]
#[error("device channel closed")]
pub struct ChannelClosed;

impl ConnHandle {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
        }
    }

    /// Stable identifier of this particular connection, used for guarded
    /// removal after a reconnect superseded it.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn send(&self, msg: Message) -> Result<(), ChannelClosed> {
        self.tx.send(msg).await.map_err(|_| ChannelClosed)
    }
}

#[derive(Default)]
struct RegistryStore {
    conns: HashMap<String, ConnHandle>,
}

/// In-memory map of live device channels. Exists only as long as the
/// process runs; the durable record lives in the kernel.
pub struct ConnectionRegistry {
    store: RwLock<RegistryStore>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            store: RwLock::new(RegistryStore::default()),
        })
    }

    /// Registers a channel, replacing any prior entry for the identifier.
    /// The replaced channel is abandoned, not closed.
    pub async fn insert(&self, device_id: &str, handle: ConnHandle) {
        let mut guard = self.store.write().await;
        guard.conns.insert(device_id.to_string(), handle);
    }

    pub async fn get(&self, device_id: &str) -> Option<ConnHandle> {
        let guard = self.store.read().await;
        guard.conns.get(device_id).cloned()
    }

    /// Removes the entry only if it still belongs to `conn_id`, so a
    /// superseded connection's teardown cannot evict its replacement.
    pub async fn remove_if(&self, device_id: &str, conn_id: Uuid) -> bool {
        let mut guard = self.store.write().await;
        match guard.conns.get(device_id) {
            Some(handle) if handle.id() == conn_id => {
                guard.conns.remove(device_id);
                true
            }
            _ => false,
        }
    }

    pub async fn device_ids(&self) -> Vec<String> {
        let guard = self.store.read().await;
        let mut ids: Vec<String> = guard.conns.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drops all bookkeeping without closing the underlying channels.
    pub async fn clear(&self) {
        let mut guard = self.store.write().await;
        guard.conns.clear();
    }

    pub async fn len(&self) -> usize {
        let guard = self.store.read().await;
        guard.conns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (ConnHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        (ConnHandle::new(tx), rx)
    }

    #[tokio::test]
    async fn reconnect_replaces_prior_entry() {
        let reg = ConnectionRegistry::new();
        let (old, _old_rx) = handle();
        let (new, _new_rx) = handle();
        let old_id = old.id();
        let new_id = new.id();

        reg.insert("dev-1", old).await;
        reg.insert("dev-1", new).await;
        assert_eq!(reg.len().await, 1);
        assert_eq!(reg.get("dev-1").await.unwrap().id(), new_id);

        // The superseded handler's teardown must not evict the new entry.
        assert!(!reg.remove_if("dev-1", old_id).await);
        assert_eq!(reg.get("dev-1").await.unwrap().id(), new_id);

        assert!(reg.remove_if("dev-1", new_id).await);
        assert!(reg.get("dev-1").await.is_none());
    }

    #[tokio::test]
    async fn clear_discards_bookkeeping_without_closing_channels() {
        let reg = ConnectionRegistry::new();
        let (h, mut rx) = handle();
        let retained = h.clone();
        reg.insert("dev-1", h).await;
        reg.clear().await;
        assert_eq!(reg.len().await, 0);
        // Channel still usable by holders of the handle.
        retained.send(Message::Text("ping".into())).await.unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn send_on_dropped_receiver_reports_closed() {
        let (h, rx) = handle();
        drop(rx);
        assert!(h.send(Message::Text("x".into())).await.is_err());
    }
}
