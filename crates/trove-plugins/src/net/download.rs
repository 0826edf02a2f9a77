use crate::config::NetworkConfig;
use crate::errors::{Result, StoreError};
use reqwest::Client;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use url::Url;

/// Worker-to-queue messages. For one URL they arrive as
/// `Progress* -> (Finished | Failed)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadMsg {
    Progress {
        url: String,
        received: u64,
        total: u64,
    },
    Finished {
        url: String,
    },
    Failed {
        url: String,
        message: String,
    },
}

pub fn build_client(config: &NetworkConfig) -> Result<Client> {
    Ok(Client::builder()
        .timeout(config.timeout())
        .connect_timeout(config.connect_timeout())
        .user_agent(config.user_agent.clone())
        .build()?)
}

/// Fetch `url` into `dest`, reporting progress on `tx`, and always finish with
/// exactly one `Finished` or `Failed`. Firing `cancel` aborts the transfer and
/// reports it as a failure.
pub(crate) async fn run_download(
    client: Client,
    url: String,
    dest: PathBuf,
    tx: mpsc::UnboundedSender<DownloadMsg>,
    mut cancel: oneshot::Receiver<()>,
) {
    let part = part_path(&dest);
    let result = tokio::select! {
        biased;
        Ok(()) = &mut cancel => Err(StoreError::DownloadFailure("download cancelled".into())),
        res = download_to_path(&client, &url, &dest, &part, &tx) => res,
    };

    let msg = match result {
        Ok(()) => DownloadMsg::Finished { url },
        Err(e) => {
            let _ = fs::remove_file(&part).await;
            DownloadMsg::Failed {
                url,
                message: e.to_string(),
            }
        }
    };
    // The receiver lives as long as the queue; a send error means nobody cares anymore.
    let _ = tx.send(msg);
}

async fn download_to_path(
    client: &Client,
    url: &str,
    dest: &Path,
    part: &Path,
    tx: &mpsc::UnboundedSender<DownloadMsg>,
) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }

    if let Some(local) = local_source(url) {
        let total = fs::copy(&local, part).await?;
        let _ = tx.send(DownloadMsg::Progress {
            url: url.to_string(),
            received: total,
            total,
        });
        fs::rename(part, dest).await?;
        return Ok(());
    }

    let mut resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        return Err(StoreError::DownloadFailure(format!(
            "GET {url}: HTTP {}",
            resp.status()
        )));
    }

    // Zero when the server does not announce a length.
    let total = resp.content_length().unwrap_or(0);
    let mut out = fs::File::create(part).await?;
    let mut received = 0u64;

    while let Some(chunk) = resp.chunk().await? {
        out.write_all(&chunk).await?;
        received += chunk.len() as u64;
        let _ = tx.send(DownloadMsg::Progress {
            url: url.to_string(),
            received,
            total,
        });
    }
    out.flush().await?;
    drop(out);

    fs::rename(part, dest).await?;
    debug!("downloaded {url} -> {} ({received} bytes)", dest.display());
    Ok(())
}

fn local_source(url: &str) -> Option<PathBuf> {
    let parsed = Url::parse(url).ok()?;
    if parsed.scheme() != "file" {
        return None;
    }
    parsed.to_file_path().ok()
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_file_sits_next_to_destination() {
        assert_eq!(
            part_path(Path::new("/c/repos/r1/demo.zip")),
            PathBuf::from("/c/repos/r1/demo.zip.part")
        );
    }

    #[test]
    fn only_file_urls_are_local() {
        assert!(local_source("http://x/demo.zip").is_none());
        assert!(local_source("not a url").is_none());
        #[cfg(unix)]
        assert_eq!(
            local_source("file:///tmp/demo.zip"),
            Some(PathBuf::from("/tmp/demo.zip"))
        );
    }

    #[tokio::test]
    async fn file_url_is_copied_with_one_progress_step() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"12345").unwrap();
        let url = Url::from_file_path(&src).unwrap().to_string();
        let dest = dir.path().join("out").join("dest.bin");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let client = build_client(&NetworkConfig::default()).unwrap();
        run_download(client, url.clone(), dest.clone(), tx, cancel_rx).await;

        assert_eq!(
            rx.recv().await,
            Some(DownloadMsg::Progress {
                url: url.clone(),
                received: 5,
                total: 5
            })
        );
        assert_eq!(rx.recv().await, Some(DownloadMsg::Finished { url }));
        assert_eq!(std::fs::read(dest).unwrap(), b"12345");
    }

    #[tokio::test]
    async fn unknown_length_reports_zero_total() {
        use tokio::io::AsyncReadExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            // No Content-Length: the body runs until the connection closes.
            sock.write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nhello")
                .await
                .unwrap();
            sock.shutdown().await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let url = format!("http://{addr}/stream.bin");
        let dest = dir.path().join("stream.bin");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let client = build_client(&NetworkConfig::default()).unwrap();
        run_download(client, url.clone(), dest.clone(), tx, cancel_rx).await;

        let mut last = None;
        while let Some(msg) = rx.recv().await {
            match msg {
                DownloadMsg::Progress { received, total, .. } => {
                    assert_eq!(total, 0);
                    assert!(received > 0);
                }
                other => last = Some(other),
            }
        }
        assert_eq!(last, Some(DownloadMsg::Finished { url }));
        assert_eq!(std::fs::read(dest).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn cancelled_transfer_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        cancel_tx.send(()).unwrap();

        // The cancel branch is polled first and is already ready.
        let client = build_client(&NetworkConfig::default()).unwrap();
        run_download(
            client,
            "http://10.255.255.1/never.zip".into(),
            dir.path().join("never.zip"),
            tx,
            cancel_rx,
        )
        .await;

        match rx.recv().await {
            Some(DownloadMsg::Failed { message, .. }) => assert!(message.contains("cancelled")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
