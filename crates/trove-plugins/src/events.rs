use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Notifications the catalog sends to front ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatalogEvent {
    /// A plugin list changed.
    UpdatedPlugins,
    /// Cached manifests, archives or logos changed on disk.
    UpdatedCache,
    StatusMessage(String),
    DownloadProgress {
        message: String,
        value: u64,
        total: u64,
    },
    Error(String),
    /// A repository check is waiting on the network before its results are final.
    DownloadRequired,
}

#[derive(Debug, Default)]
pub(crate) struct EventBus {
    subscribers: Vec<mpsc::UnboundedSender<CatalogEvent>>,
}

impl EventBus {
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<CatalogEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn emit(&mut self, event: CatalogEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
