use crate::config::Config;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::env;
use std::path::{Path, PathBuf};

/// Environment variable holding extra read-only plugin roots.
pub const PLUGIN_PATH_ENV: &str = "TROVE_PLUGIN_PATH";

/// ~/.local/share/Trove   (or platform-equivalent)
pub fn trove_home() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("~/.local/share"))
        .join("Trove")
}

/// ~/.local/share/Trove/plugins
pub fn default_user_plugins_dir() -> PathBuf {
    trove_home().join("plugins")
}

/// ~/.cache/Trove
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|p| p.join("Trove"))
        .unwrap_or_else(|| trove_home().join("cache"))
}

/// ~/.config/Trove
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join("Trove"))
        .unwrap_or_else(|| trove_home().join("config"))
}

/// ~/.local/share/Trove/logs
pub fn logs_dir() -> PathBuf {
    trove_home().join("logs")
}

/// Filesystem layout the catalog works in.
#[derive(Debug, Clone)]
pub struct PluginPaths {
    user_plugins: PathBuf,
    system_plugins: Vec<PathBuf>,
    cache: PathBuf,
    repositories_file: PathBuf,
}

impl PluginPaths {
    pub fn new(
        user_plugins: impl Into<PathBuf>,
        system_plugins: Vec<PathBuf>,
        cache: impl Into<PathBuf>,
        repositories_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            user_plugins: user_plugins.into(),
            system_plugins,
            cache: cache.into(),
            repositories_file: repositories_file.into(),
        }
    }

    /// Everything under one root; handy for tests and portable installs.
    pub fn rooted(root: &Path) -> Self {
        Self::new(
            root.join("plugins"),
            Vec::new(),
            root.join("cache"),
            root.join("repositories.json"),
        )
    }

    /// Layout from config overrides, falling back to platform directories.
    /// System roots are the configured ones followed by `TROVE_PLUGIN_PATH`.
    pub fn from_config(config: &Config) -> Self {
        let mut system_plugins = config.paths.system_plugins.clone();
        if let Some(extra) = env::var_os(PLUGIN_PATH_ENV) {
            system_plugins.extend(env::split_paths(&extra).filter(|p| !p.as_os_str().is_empty()));
        }
        Self {
            user_plugins: config
                .paths
                .user_plugins
                .clone()
                .unwrap_or_else(default_user_plugins_dir),
            system_plugins,
            cache: config.paths.cache.clone().unwrap_or_else(default_cache_dir),
            repositories_file: config
                .paths
                .repositories
                .clone()
                .unwrap_or_else(|| default_config_dir().join("repositories.json")),
        }
    }

    pub fn with_system_plugins(mut self, roots: Vec<PathBuf>) -> Self {
        self.system_plugins = roots;
        self
    }

    pub fn user_plugin_path(&self) -> &Path {
        &self.user_plugins
    }

    pub fn system_plugin_paths(&self) -> &[PathBuf] {
        &self.system_plugins
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache
    }

    pub fn repositories_file(&self) -> &Path {
        &self.repositories_file
    }

    /// <cache>/repos
    pub fn repo_path(&self) -> PathBuf {
        self.cache.join("repos")
    }

    /// <cache>/repos/<id>
    pub fn repo_path_for(&self, id: &str) -> PathBuf {
        self.repo_path().join(id)
    }

    /// <cache>/repos/<id>/plugins, the extracted archive contents.
    pub fn repo_plugins_path(&self, id: &str) -> PathBuf {
        self.repo_path_for(id).join("plugins")
    }

    pub fn repo_manifest_file(&self, id: &str) -> PathBuf {
        self.repo_path_for(id).join("manifest.xml")
    }

    pub fn repo_archive_file(&self, id: &str) -> PathBuf {
        self.repo_path_for(id).join("plugins.zip")
    }

    pub fn repo_logo_file(&self, id: &str) -> PathBuf {
        self.repo_path_for(id).join("logo.png")
    }

    /// <cache>/tmp
    pub fn get_temp_path(&self) -> PathBuf {
        self.cache.join("tmp")
    }

    /// A path under `base` (or the temp path) that does not exist yet.
    pub fn get_random(&self, base: Option<&Path>, suffix: &str) -> PathBuf {
        let base = base
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.get_temp_path());
        loop {
            let candidate = base.join(format!("{}{}", random_token(12), suffix));
            if !candidate.exists() {
                return candidate;
            }
        }
    }

    /// Is `path` one of the user-writable locations?
    pub fn is_user_path(&self, path: &Path) -> bool {
        path.starts_with(&self.user_plugins)
    }

    /// Repository id owning `path` when it lives in the repository cache.
    pub fn repo_for_path(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(self.repo_path()).ok()?;
        rel.components()
            .next()
            .and_then(|c| c.as_os_str().to_str())
            .map(str::to_string)
    }
}

pub(crate) fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooted_layout() {
        let p = PluginPaths::rooted(Path::new("/srv/trove"));
        assert_eq!(p.user_plugin_path(), Path::new("/srv/trove/plugins"));
        assert_eq!(
            p.repo_plugins_path("abc"),
            PathBuf::from("/srv/trove/cache/repos/abc/plugins")
        );
        assert_eq!(p.get_temp_path(), PathBuf::from("/srv/trove/cache/tmp"));
    }

    #[test]
    fn repo_for_path_reads_first_component() {
        let p = PluginPaths::rooted(Path::new("/srv/trove"));
        let inside = p.repo_plugins_path("r1").join("Blur");
        assert_eq!(p.repo_for_path(&inside).as_deref(), Some("r1"));
        assert_eq!(p.repo_for_path(Path::new("/usr/share/plugins")), None);
    }

    #[test]
    fn random_paths_get_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let p = PluginPaths::rooted(dir.path());
        let a = p.get_random(None, ".zip");
        let b = p.get_random(Some(dir.path()), "");
        assert!(a.starts_with(p.get_temp_path()));
        assert!(a.to_string_lossy().ends_with(".zip"));
        assert!(b.starts_with(dir.path()));
        assert_ne!(a.file_name(), b.file_name());
    }
}
