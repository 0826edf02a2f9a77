//! Known repositories and their persisted list.

use crate::paths::random_token;
use crate::types::RepoSpecs;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Key of the composite entry holding the repository list.
pub const PLUGINS_SETTINGS_KEY_REPOS: &str = "repositories";

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredRepositories {
    #[serde(default)]
    repositories: Vec<RepoSpecs>,
}

/// Identifier, source URL and manifest URL are required.
pub fn is_valid_repository(repo: &RepoSpecs) -> bool {
    !repo.id.trim().is_empty() && !repo.url.trim().is_empty() && !repo.manifest.trim().is_empty()
}

/// Whether `id` can name a cache directory as a single plain path component.
pub fn is_path_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

pub fn is_repo_manifest(repo: &RepoSpecs, url: &str) -> bool {
    same_url(&repo.manifest, url)
}

pub fn is_repo_zip(repo: &RepoSpecs, url: &str) -> bool {
    same_url(&repo.zip, url)
}

pub fn is_repo_logo(repo: &RepoSpecs, url: &str) -> bool {
    same_url(&repo.logo, url)
}

fn same_url(known: &str, url: &str) -> bool {
    !known.is_empty() && known.trim() == url.trim()
}

/// Owns the repository list and its on-disk copy.
#[derive(Debug)]
pub struct RepositoryStore {
    repos: Vec<RepoSpecs>,
    settings_path: PathBuf,
}

impl RepositoryStore {
    pub fn new(settings_path: impl Into<PathBuf>) -> Self {
        Self {
            repos: Vec::new(),
            settings_path: settings_path.into(),
        }
    }

    /// Replace the in-memory list with the persisted one. A missing file is an
    /// empty list; an unreadable one is logged and treated the same way.
    pub fn load(&mut self) {
        self.repos = match read_repositories(&self.settings_path) {
            Ok(list) => list,
            Err(e) => {
                warn!("ignoring repository list {}: {e:#}", self.settings_path.display());
                Vec::new()
            }
        };
        debug!("loaded {} repositories", self.repos.len());
    }

    /// Persist `list` and make it the current list.
    pub fn save(&mut self, list: Vec<RepoSpecs>) -> anyhow::Result<()> {
        write_repositories(&self.settings_path, &list)?;
        self.repos = list;
        Ok(())
    }

    /// Persist the current list.
    pub fn flush(&self) -> anyhow::Result<()> {
        write_repositories(&self.settings_path, &self.repos)
    }

    pub fn repositories(&self) -> &[RepoSpecs] {
        &self.repos
    }

    pub fn get(&self, id: &str) -> Option<&RepoSpecs> {
        self.repos.iter().find(|r| r.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut RepoSpecs> {
        self.repos.iter_mut().find(|r| r.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Add or replace by id.
    pub(crate) fn upsert(&mut self, repo: RepoSpecs) {
        match self.get_mut(&repo.id) {
            Some(slot) => *slot = repo,
            None => self.repos.push(repo),
        }
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<RepoSpecs> {
        let pos = self.repos.iter().position(|r| r.id == id)?;
        Some(self.repos.remove(pos))
    }

    /// A fresh id not used by any known repository.
    pub fn gen_new_repo_id(&self) -> String {
        loop {
            let candidate = random_token(12).to_lowercase();
            if !self.contains(&candidate) {
                return candidate;
            }
        }
    }

    /// Repository whose manifest, archive or logo URL is `url`.
    pub fn get_repo_from_url(&self, url: &str) -> Option<&RepoSpecs> {
        self.repos
            .iter()
            .find(|r| is_repo_manifest(r, url) || is_repo_zip(r, url) || is_repo_logo(r, url))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &RepoSpecs> {
        self.repos
            .iter()
            .filter(|r| r.enabled && is_valid_repository(r))
    }
}

fn read_repositories(path: &Path) -> anyhow::Result<Vec<RepoSpecs>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let stored: StoredRepositories =
        serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;

    let mut seen = std::collections::HashSet::new();
    Ok(stored
        .repositories
        .into_iter()
        .filter(|r| {
            if !is_valid_repository(r) || !is_path_safe_id(&r.id) {
                warn!("dropping invalid stored repository {:?}", r.id);
                return false;
            }
            seen.insert(r.id.clone())
        })
        .collect())
}

fn write_repositories(path: &Path, list: &[RepoSpecs]) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .context("repository list path has no parent directory")?;
    fs::create_dir_all(dir).with_context(|| format!("mkd {}", dir.display()))?;

    let stored = StoredRepositories {
        repositories: list.to_vec(),
    };
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(&stored)?)
        .with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}
