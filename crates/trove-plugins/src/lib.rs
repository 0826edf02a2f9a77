//! trove-plugins
//!
//! Plugin catalog and repository engine for Trove.
//! - Scans read-only and user plugin roots into two plugin lists.
//! - Tracks remote repositories through their XML manifests.
//! - Downloads manifests, archives and logos on a single-file queue.
//! - Verifies archives by sha256 before anything is extracted.
//!
//! [`PluginCatalog`] is the entry point. It is owned by one task, which feeds it
//! download results with [`PluginCatalog::process_next`]; front ends follow it
//! through [`PluginCatalog::subscribe`].

pub mod catalog;
pub mod config;
pub mod errors;
pub mod events;
pub mod install;
pub mod logging;
pub mod manifest;
pub mod net;
pub mod paths;
pub mod repo;
pub mod scan;
pub mod state;
pub mod types;

pub use catalog::PluginCatalog;
pub use config::Config;
pub use errors::{ErrorKind, Result, StoreError};
pub use events::CatalogEvent;
pub use install::extract_plugin_archive;
pub use manifest::{get_manifest_version, read_manifest, write_manifest};
pub use net::{DownloadQueue, DownloadTask};
pub use paths::PluginPaths;
pub use repo::RepositoryStore;
pub use types::*;
