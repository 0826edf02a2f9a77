mod download;
mod queue;

pub use download::{build_client, DownloadMsg};
pub use queue::{DownloadQueue, DownloadTask};
