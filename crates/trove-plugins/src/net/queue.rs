use super::download::{build_client, run_download, DownloadMsg};
use crate::config::NetworkConfig;
use crate::errors::Result;
use crate::types::DownloadKind;
use reqwest::Client;
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// One fetch the queue knows about.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadTask {
    pub url: String,
    pub dest: PathBuf,
    pub checksum: Option<String>,
    pub kind: DownloadKind,
    pub received: u64,
    pub total: u64,
}

impl DownloadTask {
    pub fn new(url: impl Into<String>, dest: impl Into<PathBuf>, kind: DownloadKind) -> Self {
        Self {
            url: url.into(),
            dest: dest.into(),
            checksum: None,
            kind,
            received: 0,
            total: 0,
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}

struct ActiveDownload {
    task: DownloadTask,
    cancel: Option<oneshot::Sender<()>>,
}

/// Ordered, de-duplicated download pipeline running one transfer at a time.
///
/// Transfers run on spawned tokio tasks; their messages are read back with
/// [`DownloadQueue::next_message`] by whoever owns the queue, and a URL stays
/// in the queue until that owner calls [`DownloadQueue::complete`].
pub struct DownloadQueue {
    client: Client,
    pending: VecDeque<DownloadTask>,
    active: Option<ActiveDownload>,
    tx: mpsc::UnboundedSender<DownloadMsg>,
    rx: mpsc::UnboundedReceiver<DownloadMsg>,
}

impl DownloadQueue {
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            client: build_client(config)?,
            pending: VecDeque::new(),
            active: None,
            tx,
            rx,
        })
    }

    /// Queue `task` unless its URL is already queued or in flight.
    pub fn enqueue(&mut self, task: DownloadTask) -> bool {
        if self.contains(&task.url) {
            debug!("already queued: {}", task.url);
            return false;
        }
        debug!("queued {:?} {}", task.kind, task.url);
        self.pending.push_back(task);
        true
    }

    pub fn contains(&self, url: &str) -> bool {
        self.active.as_ref().is_some_and(|a| a.task.url == url)
            || self.pending.iter().any(|t| t.url == url)
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some() || !self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.active.is_some())
    }

    pub fn is_empty(&self) -> bool {
        !self.is_busy()
    }

    pub fn active(&self) -> Option<&DownloadTask> {
        self.active.as_ref().map(|a| &a.task)
    }

    pub fn pending(&self) -> impl Iterator<Item = &DownloadTask> {
        self.pending.iter()
    }

    /// Drop a queued task outright, or ask the running one to stop. A running
    /// task still reports through `Failed`, and is evicted when that is handled.
    pub fn remove(&mut self, url: &str) -> bool {
        if let Some(pos) = self.pending.iter().position(|t| t.url == url) {
            self.pending.remove(pos);
            info!("removed {url} from download queue");
            return true;
        }
        match self.active.as_mut() {
            Some(active) if active.task.url == url => {
                if let Some(cancel) = active.cancel.take() {
                    let _ = cancel.send(());
                    info!("cancelling in-flight download {url}");
                }
                true
            }
            _ => false,
        }
    }

    /// Start the next pending task if nothing is running. Needs a tokio runtime.
    pub fn pump(&mut self) {
        if self.active.is_some() {
            return;
        }
        let Some(task) = self.pending.pop_front() else {
            return;
        };
        info!("downloading {}", task.url);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        tokio::spawn(run_download(
            self.client.clone(),
            task.url.clone(),
            task.dest.clone(),
            self.tx.clone(),
            cancel_rx,
        ));
        self.active = Some(ActiveDownload {
            task,
            cancel: Some(cancel_tx),
        });
    }

    /// Next worker message. Starts a pending task first if the queue is idle;
    /// returns `None` when there is nothing to wait for.
    pub async fn next_message(&mut self) -> Option<DownloadMsg> {
        self.pump();
        self.active.as_ref()?;
        let msg = self.rx.recv().await?;
        if let DownloadMsg::Progress {
            url,
            received,
            total,
        } = &msg
        {
            if let Some(active) = self.active.as_mut().filter(|a| &a.task.url == url) {
                active.task.received = *received;
                active.task.total = *total;
            }
        }
        Some(msg)
    }

    /// Evict a finished task after its completion has been handled.
    pub fn complete(&mut self, url: &str) -> Option<DownloadTask> {
        match self.active.take() {
            Some(active) if active.task.url == url => Some(active.task),
            other => {
                self.active = other;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> DownloadQueue {
        DownloadQueue::new(&NetworkConfig::default()).unwrap()
    }

    #[test]
    fn enqueue_is_idempotent() {
        let mut q = queue();
        assert!(!q.is_busy());
        assert!(q.enqueue(DownloadTask::new("http://x/a", "/tmp/a", DownloadKind::Zip)));
        assert!(!q.enqueue(DownloadTask::new("http://x/a", "/tmp/other", DownloadKind::Zip)));
        assert!(q.enqueue(DownloadTask::new("http://x/b", "/tmp/b", DownloadKind::Logo)));
        assert_eq!(q.len(), 2);
        assert!(q.is_busy());
    }

    #[test]
    fn queued_task_can_be_removed() {
        let mut q = queue();
        q.enqueue(DownloadTask::new("http://x/a", "/tmp/a", DownloadKind::Manifest));
        assert!(q.remove("http://x/a"));
        assert!(!q.remove("http://x/a"));
        assert!(!q.is_busy());
    }

    #[test]
    fn order_is_preserved() {
        let mut q = queue();
        for name in ["a", "b", "c"] {
            q.enqueue(DownloadTask::new(format!("http://x/{name}"), "/tmp/x", DownloadKind::Zip));
        }
        let urls: Vec<_> = q.pending().map(|t| t.url.as_str()).collect();
        assert_eq!(urls, ["http://x/a", "http://x/b", "http://x/c"]);
    }

    #[tokio::test]
    async fn idle_queue_yields_nothing() {
        let mut q = queue();
        assert_eq!(q.next_message().await, None);
    }

    #[tokio::test]
    async fn url_stays_queued_until_completed() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.bin");
        std::fs::write(&src, b"abc").unwrap();
        let url = url::Url::from_file_path(&src).unwrap().to_string();

        let mut q = queue();
        q.enqueue(DownloadTask::new(url.clone(), dir.path().join("out.bin"), DownloadKind::Zip));

        let mut finished = false;
        while let Some(msg) = q.next_message().await {
            assert!(q.contains(&url));
            if matches!(msg, DownloadMsg::Finished { .. }) {
                finished = true;
                let task = q.complete(&url).unwrap();
                assert_eq!(task.received, 3);
            }
        }
        assert!(finished);
        assert!(!q.is_busy());
        assert!(!q.contains(&url));
    }

    #[tokio::test]
    async fn active_download_cancel_is_observed_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut q = queue();
        let url = "http://10.255.255.1/slow.zip".to_string();
        q.enqueue(DownloadTask::new(url.clone(), dir.path().join("slow.zip"), DownloadKind::Zip));
        q.pump();
        assert_eq!(q.active().map(|t| t.url.as_str()), Some(url.as_str()));

        assert!(q.remove(&url));
        assert!(q.is_busy());
        let msg = q.next_message().await.unwrap();
        assert!(matches!(msg, DownloadMsg::Failed { .. }));
        q.complete(&url);
        assert!(!q.is_busy());
    }
}
