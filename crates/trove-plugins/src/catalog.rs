//! The plugin catalog: owner of both plugin lists, the repository list and the
//! download queue.
//!
//! Everything here runs on the task that owns the catalog. Downloads run on
//! spawned tasks and only report back through the queue; their results are
//! applied when the owner calls [`PluginCatalog::process_next`] or
//! [`PluginCatalog::run_until_idle`].

use crate::config::{Config, NetworkConfig};
use crate::errors::{Result, StoreError};
use crate::events::{CatalogEvent, EventBus};
use crate::install::{
    extract_plugin_archive, install_plugin_from_archive, unpack_repository_archive,
};
use crate::manifest::{derive_repo_id, open_manifest, write_manifest};
use crate::net::{DownloadMsg, DownloadQueue, DownloadTask};
use crate::paths::PluginPaths;
use crate::repo::{
    is_path_safe_id, is_repo_manifest, is_repo_zip, is_valid_repository, RepositoryStore,
};
use crate::scan::{merge_plugins, scan_folder, ScanOrigin};
use crate::state::PluginLists;
use crate::types::{DownloadKind, PluginSpecs, PluginStatus, PluginType, RepoSpecs};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

enum InstallStep {
    Installed(PathBuf),
    Queued,
}

pub struct PluginCatalog {
    paths: PluginPaths,
    repos: RepositoryStore,
    lists: PluginLists,
    queue: DownloadQueue,
    events: EventBus,
    /// Plugin ids waiting for their repository archive, by repository id.
    pending_installs: HashMap<String, Vec<String>>,
    /// Manifest URLs passed to `add_repository` whose manifest has not arrived.
    pending_additions: HashSet<String>,
    /// Fetched manifests of known repositories, by archive URL. They replace
    /// the stored entry only once that archive has been verified and unpacked.
    pending_refreshes: HashMap<String, RepoSpecs>,
    /// Event flags of the last `check_repositories`, reset when the queue idles.
    emit_changes: bool,
    emit_cache: bool,
}

impl PluginCatalog {
    /// Restore the repository list and scan every plugin root.
    pub fn new(paths: PluginPaths, network: &NetworkConfig) -> Result<Self> {
        let mut repos = RepositoryStore::new(paths.repositories_file());
        repos.load();

        let mut catalog = Self {
            queue: DownloadQueue::new(network)?,
            paths,
            repos,
            lists: PluginLists::default(),
            events: EventBus::default(),
            pending_installs: HashMap::new(),
            pending_additions: HashSet::new(),
            pending_refreshes: HashMap::new(),
            emit_changes: true,
            emit_cache: true,
        };
        catalog.rescan_available();
        catalog.rescan_installed();
        info!(
            "catalog ready: {} available, {} installed, {} repositories",
            catalog.lists.available.len(),
            catalog.lists.installed.len(),
            catalog.repos.repositories().len()
        );
        Ok(catalog)
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(PluginPaths::from_config(config), &config.network)
    }

    pub fn paths(&self) -> &PluginPaths {
        &self.paths
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<CatalogEvent> {
        self.events.subscribe()
    }

    // ---- queries ----

    pub fn has_plugin(&self, id: &str) -> bool {
        self.lists.installed(id).is_some() || self.lists.available(id).is_some()
    }

    /// The installed entry when there is one, else the available one.
    pub fn get_plugin(&self, id: &str) -> Option<&PluginSpecs> {
        self.lists.installed(id).or_else(|| self.lists.available(id))
    }

    pub fn get_available_plugin(&self, id: &str) -> Option<&PluginSpecs> {
        self.lists.available(id)
    }

    pub fn get_installed_plugin(&self, id: &str) -> Option<&PluginSpecs> {
        self.lists.installed(id)
    }

    pub fn get_plugins(&self) -> Vec<PluginSpecs> {
        self.lists.combined()
    }

    pub fn get_available_plugins(&self) -> &[PluginSpecs] {
        &self.lists.available
    }

    pub fn get_installed_plugins(&self) -> &[PluginSpecs] {
        &self.lists.installed
    }

    pub fn get_plugins_with_status(&self, status: PluginType) -> Vec<PluginSpecs> {
        self.lists
            .combined()
            .into_iter()
            .filter(|p| self.plugin_type(&p.id) == status)
            .collect()
    }

    pub fn get_plugin_groups(&self) -> Vec<String> {
        PluginLists::groups(&self.lists.combined())
    }

    pub fn get_plugin_groups_for(&self, status: PluginType) -> Vec<String> {
        PluginLists::groups(&self.get_plugins_with_status(status))
    }

    /// Plugins in `group`, optionally narrowed to one status.
    pub fn get_plugins_in_group(&self, group: &str, status: Option<PluginType>) -> Vec<PluginSpecs> {
        self.lists
            .combined()
            .into_iter()
            .filter(|p| p.group == group)
            .filter(|p| status.map_or(true, |s| self.plugin_type(&p.id) == s))
            .collect()
    }

    pub fn plugin_type(&self, id: &str) -> PluginType {
        self.lists.plugin_type(id)
    }

    pub fn get_available_repositories(&self) -> Vec<RepoSpecs> {
        self.repos.repositories().to_vec()
    }

    pub fn get_repository(&self, id: &str) -> Option<&RepoSpecs> {
        self.repos.get(id)
    }

    /// Cached logo of a repository, once downloaded.
    pub fn get_repository_logo(&self, id: &str) -> Option<PathBuf> {
        self.repos.get(id)?;
        Some(self.paths.repo_logo_file(id)).filter(|p| p.is_file())
    }

    pub fn is_busy(&self) -> bool {
        self.queue.is_busy()
    }

    // ---- scanning ----

    pub fn scan_for_available_plugins(
        &mut self,
        path: &Path,
        append: bool,
        emit_changes: bool,
        emit_cache: bool,
    ) {
        let origin = ScanOrigin::Available {
            repo: self.paths.repo_for_path(path),
        };
        let found = scan_folder(path, &origin);
        merge_plugins(&mut self.lists.available, found, append);
        if emit_changes {
            self.events.emit(CatalogEvent::UpdatedPlugins);
        }
        if emit_cache {
            self.events.emit(CatalogEvent::UpdatedCache);
        }
    }

    pub fn scan_for_installed_plugins(&mut self, path: &Path, append: bool) {
        let found = scan_folder(path, &ScanOrigin::Installed);
        merge_plugins(&mut self.lists.installed, found, append);
    }

    /// Rebuild the available list from the system roots and the unpacked
    /// archives of enabled repositories.
    pub fn rescan_available(&mut self) {
        let mut roots = self.paths.system_plugin_paths().to_vec();
        roots.extend(self.repos.enabled().map(|r| self.paths.repo_plugins_path(&r.id)));

        self.lists.available.clear();
        for root in roots {
            self.scan_for_available_plugins(&root, true, false, false);
        }
    }

    pub fn rescan_installed(&mut self) {
        let root = self.paths.user_plugin_path().to_path_buf();
        self.scan_for_installed_plugins(&root, false);
    }

    // ---- repositories ----

    /// Start tracking the repository published at `manifest_url`. The entry is
    /// created when the manifest arrives. Returns `false` if it is already known.
    pub fn add_repository(&mut self, manifest_url: &str) -> Result<bool> {
        let url = manifest_url.trim();
        Url::parse(url)
            .map_err(|e| StoreError::InvalidRepository(format!("bad manifest url {url:?}: {e}")))?;
        if self
            .repos
            .repositories()
            .iter()
            .any(|r| is_repo_manifest(r, url))
        {
            debug!("repository {url} already known");
            return Ok(false);
        }

        self.pending_additions.insert(url.to_string());
        self.queue.enqueue(DownloadTask::new(
            url,
            self.paths.get_random(None, ".xml"),
            DownloadKind::Manifest,
        ));
        self.events.emit(CatalogEvent::DownloadRequired);
        Ok(true)
    }

    /// Forget a repository, its cache directory and the plugins it offered.
    pub fn remove_repository(&mut self, id: &str) -> Result<()> {
        let repo = self
            .repos
            .remove(id)
            .ok_or_else(|| StoreError::InvalidRepository(format!("unknown repository {id}")))?;
        for url in [&repo.manifest, &repo.zip, &repo.logo] {
            self.queue.remove(url);
        }
        self.pending_installs.remove(id);
        let stale: Vec<String> = self
            .pending_refreshes
            .iter()
            .filter(|(_, r)| r.id == id)
            .map(|(url, _)| url.clone())
            .collect();
        for url in stale {
            self.pending_refreshes.remove(&url);
            self.queue.remove(&url);
        }
        self.repos.flush()?;

        let dir = self.paths.repo_path_for(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        info!("removed repository {id}");

        self.rescan_available();
        self.events.emit(CatalogEvent::UpdatedPlugins);
        self.events.emit(CatalogEvent::UpdatedCache);
        Ok(())
    }

    pub fn set_repository_enabled(&mut self, id: &str, enabled: bool) -> Result<()> {
        let repo = self
            .repos
            .get_mut(id)
            .ok_or_else(|| StoreError::InvalidRepository(format!("unknown repository {id}")))?;
        if repo.enabled == enabled {
            return Ok(());
        }
        repo.enabled = enabled;
        self.repos.flush()?;
        self.rescan_available();
        self.events.emit(CatalogEvent::UpdatedPlugins);
        Ok(())
    }

    /// Fetch the manifest of every enabled repository. Returns how many
    /// manifests are pending; results arrive through events.
    pub fn check_repositories(&mut self, emit_changes: bool, emit_cache: bool) -> usize {
        let manifests: Vec<String> = self.repos.enabled().map(|r| r.manifest.clone()).collect();
        if manifests.is_empty() {
            return 0;
        }
        self.emit_changes = emit_changes;
        self.emit_cache = emit_cache;

        for url in &manifests {
            if !self.queue.contains(url) {
                let dest = self.paths.get_random(None, ".xml");
                self.queue
                    .enqueue(DownloadTask::new(url, dest, DownloadKind::Manifest));
            }
        }

        info!("checking {} repositories", manifests.len());
        self.events.emit(CatalogEvent::DownloadRequired);
        self.events.emit(CatalogEvent::StatusMessage(format!(
            "Checking {} repositories",
            manifests.len()
        )));
        manifests.len()
    }

    // ---- install / remove ----

    /// Install an available plugin into the user root. Refused while downloads
    /// are in flight. A repository plugin whose archive is not cached yet is
    /// queued and finishes through events.
    pub fn install_plugin(&mut self, id: &str) -> PluginStatus {
        if self.queue.is_busy() {
            return PluginStatus::from_result(Err(StoreError::Msg(
                "downloads in progress, try again when idle".into(),
            )));
        }
        self.install_available(id)
    }

    pub fn remove_plugin(&mut self, id: &str) -> PluginStatus {
        let res = self.try_remove(id);
        match &res {
            Ok(msg) => {
                info!("{msg}");
                self.rescan_installed();
                self.events.emit(CatalogEvent::UpdatedPlugins);
            }
            Err(e) => warn!("remove {id}: {e}"),
        }
        PluginStatus::from_result(res)
    }

    /// Install every plugin in a local archive.
    pub fn install_local_archive(&mut self, file: &Path, checksum: Option<&str>) -> PluginStatus {
        let status = extract_plugin_archive(
            file,
            self.paths.user_plugin_path(),
            &self.paths.get_temp_path(),
            checksum,
        );
        if status.success {
            self.rescan_installed();
            self.events.emit(CatalogEvent::UpdatedPlugins);
        } else {
            warn!("install from {}: {}", file.display(), status.message);
        }
        status
    }

    /// Drop a queued download, or ask the running one to stop.
    pub fn remove_from_download_queue(&mut self, url: &str) -> bool {
        if !self.queue.remove(url) {
            return false;
        }
        if !self.queue.contains(url) {
            // Never started, so no failure message will follow.
            self.on_failure(url, "download cancelled");
        }
        true
    }

    fn install_available(&mut self, id: &str) -> PluginStatus {
        match self.try_install(id) {
            Ok(InstallStep::Installed(path)) => {
                info!("installed {id} into {}", path.display());
                self.rescan_installed();
                self.events.emit(CatalogEvent::UpdatedPlugins);
                let label = self
                    .lists
                    .installed(id)
                    .map(|p| p.label.clone())
                    .unwrap_or_else(|| id.to_string());
                PluginStatus::ok(format!("Installed {label}"))
            }
            Ok(InstallStep::Queued) => {
                PluginStatus::queued(format!("Downloading the archive providing {id}"))
            }
            Err(e) => {
                warn!("install {id}: {e}");
                PluginStatus::from_result(Err(e))
            }
        }
    }

    fn try_install(&mut self, id: &str) -> Result<InstallStep> {
        let plugin = self
            .lists
            .available(id)
            .cloned()
            .ok_or_else(|| StoreError::InvalidPlugin(format!("no available plugin {id}")))?;
        let Some(repo_id) = plugin.repo else {
            return Err(StoreError::InvalidPlugin(format!(
                "no repository archive provides {id}"
            )));
        };
        let repo = self
            .repos
            .get(&repo_id)
            .cloned()
            .ok_or_else(|| StoreError::InvalidRepository(format!("unknown repository {repo_id}")))?;
        if repo.zip.is_empty() {
            return Err(StoreError::InvalidRepository(format!(
                "{} publishes no archive",
                repo.label
            )));
        }

        let archive = self.paths.repo_archive_file(&repo.id);
        if !archive.is_file() {
            self.queue.enqueue(
                DownloadTask::new(&repo.zip, archive, DownloadKind::Zip)
                    .with_checksum(&repo.checksum),
            );
            let waiting = self.pending_installs.entry(repo.id.clone()).or_default();
            if !waiting.iter().any(|w| w == id) {
                waiting.push(id.to_string());
            }
            self.events.emit(CatalogEvent::DownloadRequired);
            return Ok(InstallStep::Queued);
        }

        let user_root = self.paths.user_plugin_path().to_path_buf();
        let scratch = self.paths.get_temp_path();
        match install_plugin_from_archive(&archive, id, &user_root, &scratch, &repo.checksum) {
            Err(e @ StoreError::ChecksumMismatch { .. }) => {
                discard(&archive);
                Err(e)
            }
            res => res.map(InstallStep::Installed),
        }
    }

    fn try_remove(&self, id: &str) -> Result<String> {
        let plugin = self
            .lists
            .installed(id)
            .ok_or_else(|| StoreError::InvalidPlugin(format!("{id} is not installed")))?;
        if !plugin.writable || !self.paths.is_user_path(&plugin.path) {
            return Err(StoreError::PermissionDenied(format!(
                "{} is write-protected",
                plugin.label
            )));
        }
        fs::remove_dir_all(&plugin.path)?;
        Ok(format!("Removed {}", plugin.label))
    }

    // ---- download completion ----

    /// Wait for one download message and apply it. Returns `false` once the
    /// queue is idle.
    pub async fn process_next(&mut self) -> bool {
        let Some(msg) = self.queue.next_message().await else {
            self.reset_emit_flags();
            return false;
        };
        match msg {
            DownloadMsg::Progress {
                url,
                received,
                total,
            } => {
                self.events.emit(CatalogEvent::DownloadProgress {
                    message: url,
                    value: received,
                    total,
                });
            }
            DownloadMsg::Finished { url } => {
                if let Some(task) = self.queue.active().filter(|t| t.url == url).cloned() {
                    self.on_finished(&task);
                }
                self.queue.complete(&url);
            }
            DownloadMsg::Failed { url, message } => {
                self.on_failure(&url, &message);
                self.queue.complete(&url);
            }
        }
        if !self.queue.is_busy() {
            self.reset_emit_flags();
        }
        true
    }

    fn reset_emit_flags(&mut self) {
        self.emit_changes = true;
        self.emit_cache = true;
    }

    pub async fn run_until_idle(&mut self) {
        while self.process_next().await {}
    }

    fn on_finished(&mut self, task: &DownloadTask) {
        debug!("finished {:?} {}", task.kind, task.url);
        match task.kind {
            DownloadKind::Manifest => {
                let res = self.apply_manifest(task);
                discard(&task.dest);
                if let Err(e) = res {
                    self.report_error(format!("{}: {e}", task.url));
                }
            }
            DownloadKind::Zip => self.apply_archive(task),
            DownloadKind::Logo => {
                if self.emit_cache {
                    self.events.emit(CatalogEvent::UpdatedCache);
                }
            }
        }
    }

    fn on_failure(&mut self, url: &str, message: &str) {
        self.report_error(format!("Download of {url} failed: {message}"));
        self.pending_additions.remove(url);
        let repo_id = match self.pending_refreshes.remove(url) {
            Some(fetched) => Some(fetched.id),
            None => self
                .repos
                .get_repo_from_url(url)
                .filter(|r| is_repo_zip(r, url))
                .map(|r| r.id.clone()),
        };
        if let Some(repo_id) = repo_id {
            self.fail_installs(&repo_id, message);
        }
    }

    fn apply_manifest(&mut self, task: &DownloadTask) -> Result<()> {
        let adding = self.pending_additions.remove(&task.url);
        let fetched = open_manifest(&task.dest)?;

        let known = self
            .repos
            .get_repo_from_url(&task.url)
            .filter(|r| is_repo_manifest(r, &task.url))
            .map(|r| r.id.clone());
        match known {
            Some(id) => self.refresh_repository(&id, fetched),
            None if adding => self.register_repository(fetched, &task.url),
            None => {
                debug!("manifest {} is no longer tracked", task.url);
                Ok(())
            }
        }
    }

    fn register_repository(&mut self, mut repo: RepoSpecs, manifest_url: &str) -> Result<()> {
        repo.manifest = manifest_url.to_string();
        repo.enabled = true;
        if !is_valid_repository(&repo) {
            return Err(StoreError::InvalidRepository(format!(
                "{manifest_url} lacks an identifier, source url or manifest url"
            )));
        }
        if !is_path_safe_id(&repo.id) {
            debug!("repository id {:?} is not a plain folder name", repo.id);
            repo.id = derive_repo_id(&repo.url);
        }
        if self.repos.contains(&repo.id) {
            repo.id = self.repos.gen_new_repo_id();
        }

        self.commit_repository(repo.clone())?;
        self.queue_repository_files(&repo);
        info!("added repository {} ({})", repo.label, repo.id);
        self.events.emit(CatalogEvent::StatusMessage(format!(
            "Added repository {}",
            repo.label
        )));
        Ok(())
    }

    /// Stage a fetched manifest for a known repository when it is newer than
    /// what we have, or when its archive was never cached. The stored entry
    /// changes once the new archive is in place.
    fn refresh_repository(&mut self, id: &str, fetched: RepoSpecs) -> Result<()> {
        let archive_cached = self.paths.repo_archive_file(id).is_file();
        let Some(current) = self.repos.get(id) else {
            return Ok(());
        };
        if !current.enabled {
            return Ok(());
        }
        let newer = match (fetched.modified, current.modified) {
            (Some(new), Some(old)) => new > old,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !newer && archive_cached {
            debug!("repository {id} is up to date");
            let label = current.label.clone();
            self.events
                .emit(CatalogEvent::StatusMessage(format!("{label} is up to date")));
            return Ok(());
        }

        let updated = RepoSpecs {
            id: current.id.clone(),
            manifest: current.manifest.clone(),
            enabled: current.enabled,
            ..fetched
        };
        if updated.zip.is_empty() {
            self.commit_repository(updated.clone())?;
        } else {
            info!("repository {id} changed, fetching its archive");
            self.pending_refreshes
                .insert(updated.zip.clone(), updated.clone());
        }
        self.queue_repository_files(&updated);
        Ok(())
    }

    /// Make `repo` the stored entry and cache its manifest.
    fn commit_repository(&mut self, repo: RepoSpecs) -> Result<()> {
        let manifest = self.paths.repo_manifest_file(&repo.id);
        if let Some(dir) = manifest.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&manifest, write_manifest(&repo))?;

        self.repos.upsert(repo);
        self.repos.flush()?;
        if self.emit_cache {
            self.events.emit(CatalogEvent::UpdatedCache);
        }
        Ok(())
    }

    /// Queue the archive and logo of `repo`.
    fn queue_repository_files(&mut self, repo: &RepoSpecs) {
        if !repo.zip.is_empty() {
            self.queue.enqueue(
                DownloadTask::new(&repo.zip, self.paths.repo_archive_file(&repo.id), DownloadKind::Zip)
                    .with_checksum(&repo.checksum),
            );
        }
        if !repo.logo.is_empty() {
            self.queue.enqueue(DownloadTask::new(
                &repo.logo,
                self.paths.repo_logo_file(&repo.id),
                DownloadKind::Logo,
            ));
        }
    }

    fn apply_archive(&mut self, task: &DownloadTask) {
        let refreshed = self
            .pending_refreshes
            .remove(&task.url)
            .filter(|r| self.repos.contains(&r.id));
        let stored = self
            .repos
            .get_repo_from_url(&task.url)
            .filter(|r| is_repo_zip(r, &task.url))
            .cloned();
        let Some(repo) = refreshed.clone().or(stored) else {
            debug!("archive {} has no repository anymore", task.url);
            discard(&task.dest);
            return;
        };

        // A staged manifest names the checksum of what was just fetched.
        let checksum = match &refreshed {
            Some(r) => r.checksum.clone(),
            None => task.checksum.clone().unwrap_or_else(|| repo.checksum.clone()),
        };
        let dest = self.paths.repo_plugins_path(&repo.id);
        match unpack_repository_archive(&task.dest, &dest, &self.paths.get_temp_path(), &checksum) {
            Ok(count) => {
                info!("{}: {count} plugin(s) unpacked", repo.label);
                if let Some(updated) = refreshed {
                    if let Err(e) = self.commit_repository(updated) {
                        self.report_error(format!("{}: {e}", repo.label));
                    }
                }
                self.rescan_available();
                if self.emit_changes {
                    self.events.emit(CatalogEvent::UpdatedPlugins);
                }
                if self.emit_cache {
                    self.events.emit(CatalogEvent::UpdatedCache);
                }
                self.events.emit(CatalogEvent::StatusMessage(format!(
                    "{}: {count} plugin(s) available",
                    repo.label
                )));
                self.resume_installs(&repo.id);
            }
            Err(e) => {
                if matches!(e, StoreError::ChecksumMismatch { .. }) {
                    discard(&task.dest);
                }
                self.report_error(format!("{}: {e}", repo.label));
                self.fail_installs(&repo.id, &e.to_string());
            }
        }
    }

    fn resume_installs(&mut self, repo_id: &str) {
        for id in self.pending_installs.remove(repo_id).unwrap_or_default() {
            let status = self.install_available(&id);
            if status.success {
                self.events.emit(CatalogEvent::StatusMessage(status.message));
            } else if !status.queued {
                self.report_error(status.message);
            }
        }
    }

    fn fail_installs(&mut self, repo_id: &str, message: &str) {
        for id in self.pending_installs.remove(repo_id).unwrap_or_default() {
            self.report_error(format!("Could not install {id}: {message}"));
        }
    }

    fn report_error(&mut self, message: String) {
        warn!("{message}");
        self.events.emit(CatalogEvent::Error(message));
    }
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("could not remove {}: {e}", path.display());
        }
    }
}
