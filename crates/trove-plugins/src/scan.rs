//! Plugin folder discovery.
//!
//! A plugin is a folder holding a `plugin.info` file of `key = value` lines:
//!
//! ```text
//! id = net.example.blur
//! label = Blur
//! version = 1.2
//! group = Filter
//! icon = blur.png
//! desc = First line\nSecond line
//! ```
//!
//! Only the immediate children of a scanned root are considered.

use crate::types::PluginSpecs;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const PLUGIN_METADATA_FILE: &str = "plugin.info";

/// Where a scanned root sits in the layout; decides `writable` and `repo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOrigin {
    /// Read-only search path (system, bundled, or a repository cache).
    Available { repo: Option<String> },
    /// The user-writable plugin root.
    Installed,
}

/// Value of `key` in a metadata file, if present.
pub fn get_value_from_file(key: &str, filename: &Path) -> Option<String> {
    read_metadata(filename).remove(key)
}

fn read_metadata(filename: &Path) -> HashMap<String, String> {
    let Ok(text) = fs::read_to_string(filename) else {
        return HashMap::new();
    };
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), unquote(v.trim()).to_string()))
        .collect()
}

fn unquote(v: &str) -> &str {
    for q in ['"', '\''] {
        if v.len() >= 2 && v.starts_with(q) && v.ends_with(q) {
            return &v[1..v.len() - 1];
        }
    }
    v
}

/// Build specs from a plugin folder. `None` when there is no metadata file.
/// The result may still be invalid; see [`is_valid_plugin`].
pub fn get_plugin_specs(folder: &Path) -> Option<PluginSpecs> {
    let meta_path = folder.join(PLUGIN_METADATA_FILE);
    if !meta_path.is_file() {
        return None;
    }
    let mut meta = read_metadata(&meta_path);
    let mut take = |key: &str| meta.remove(key).unwrap_or_default();

    let folder_name = folder
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let version_raw = take("version");
    let version = version_raw.parse::<f64>().unwrap_or_else(|_| {
        if !version_raw.is_empty() {
            warn!("{}: unreadable version {version_raw:?}", folder.display());
        }
        0.0
    });

    let icon = match take("icon") {
        name if !name.is_empty() => folder.join(name).to_string_lossy().into_owned(),
        _ => {
            let fallback = folder.join(format!("{folder_name}.png"));
            if fallback.is_file() {
                fallback.to_string_lossy().into_owned()
            } else {
                String::new()
            }
        }
    };

    Some(PluginSpecs {
        id: take("id"),
        label: take("label"),
        version,
        icon,
        group: take("group"),
        desc: take("desc"),
        path: folder.to_path_buf(),
        folder: folder_name,
        writable: true,
        repo: None,
    })
}

/// A plugin needs at least an id and a label.
pub fn is_valid_plugin(plugin: &PluginSpecs) -> bool {
    !plugin.id.trim().is_empty() && !plugin.label.trim().is_empty()
}

pub fn folder_has_plugin(path: &Path) -> bool {
    get_plugin_specs(path).is_some_and(|p| is_valid_plugin(&p))
}

/// Number of immediate child folders that hold a valid plugin.
pub fn folder_has_plugins(path: &Path) -> usize {
    child_dirs(path).filter(|dir| folder_has_plugin(dir)).count()
}

/// Scan the immediate children of `root`. Result is sorted by label and holds
/// each id once; for duplicates the later folder (by name) wins.
pub fn scan_folder(root: &Path, origin: &ScanOrigin) -> Vec<PluginSpecs> {
    let mut found = Vec::new();
    for dir in child_dirs(root) {
        let Some(mut specs) = get_plugin_specs(&dir) else {
            continue;
        };
        if !is_valid_plugin(&specs) {
            debug!("skipping {}: missing id or label", dir.display());
            continue;
        }
        match origin {
            ScanOrigin::Available { repo } => {
                specs.writable = false;
                specs.repo = repo.clone();
            }
            ScanOrigin::Installed => {
                specs.writable = fs::metadata(&dir)
                    .map(|m| !m.permissions().readonly())
                    .unwrap_or(false);
            }
        }
        found.push(specs);
    }
    let mut out = Vec::new();
    merge_plugins(&mut out, found, false);
    debug!("scanned {}: {} plugin(s)", root.display(), out.len());
    out
}

/// Replace (`append == false`) or extend `target` with `found`, letting later
/// entries override earlier ones with the same id, then sort by label.
pub fn merge_plugins(target: &mut Vec<PluginSpecs>, found: Vec<PluginSpecs>, append: bool) {
    if !append {
        target.clear();
    }
    for plugin in found {
        match target.iter_mut().find(|p| p.id == plugin.id) {
            Some(slot) => *slot = plugin,
            None => target.push(plugin),
        }
    }
    target.sort_by(|a, b| a.label.cmp(&b.label).then_with(|| a.id.cmp(&b.id)));
}

pub(crate) fn child_dirs(root: &Path) -> impl Iterator<Item = std::path::PathBuf> {
    WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
}
