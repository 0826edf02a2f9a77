//! Checksum-gated archive extraction and plugin folder placement.
//!
//! Every install goes through a scratch directory: the archive is verified,
//! unpacked next to nothing of value, checked for plugin folders, and only then
//! moved into its final location. Scratch directories are removed on every
//! exit path.

mod unzip;

pub use unzip::unzip_into;

use crate::errors::{Result, StoreError};
use crate::manifest::verify_checksum;
use crate::paths::random_token;
use crate::scan::{child_dirs, folder_has_plugin, folder_has_plugins, get_plugin_specs};
use crate::types::PluginStatus;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Verify `file`, extract it and move every plugin folder it holds into
/// `dest`. Reports the outcome instead of failing.
pub fn extract_plugin_archive(
    file: &Path,
    dest: &Path,
    scratch_root: &Path,
    checksum: Option<&str>,
) -> PluginStatus {
    PluginStatus::from_result(
        extract_plugins(file, dest, scratch_root, checksum)
            .map(|folders| format!("installed {}", folders.join(", "))),
    )
}

/// [`extract_plugin_archive`] with the folder names that were installed.
pub fn extract_plugins(
    file: &Path,
    dest: &Path,
    scratch_root: &Path,
    checksum: Option<&str>,
) -> Result<Vec<String>> {
    let scratch = Scratch::unpack(file, scratch_root, checksum)?;
    let root = plugin_root(scratch.path())?;

    let folders: Vec<PathBuf> = child_dirs(&root).filter(|d| folder_has_plugin(d)).collect();
    for folder in &folders {
        ensure_replaceable(&dest.join(folder_name(folder)?))?;
    }

    let mut installed = Vec::with_capacity(folders.len());
    for folder in folders {
        let target = place_plugin(&folder, dest)?;
        installed.push(folder_name(&target)?);
    }
    info!("extracted {} plugin(s) from {}", installed.len(), file.display());
    Ok(installed)
}

/// Verify `file` against `checksum`, then install only the folder holding
/// plugin `id`. Returns the installed folder.
pub fn install_plugin_from_archive(
    file: &Path,
    id: &str,
    dest: &Path,
    scratch_root: &Path,
    checksum: &str,
) -> Result<PathBuf> {
    let scratch = Scratch::unpack(file, scratch_root, Some(checksum))?;
    let root = plugin_root(scratch.path())?;

    let folder = child_dirs(&root)
        .find(|d| get_plugin_specs(d).is_some_and(|p| p.id == id))
        .ok_or_else(|| {
            StoreError::InvalidPlugin(format!("{} does not contain plugin {id}", file.display()))
        })?;
    place_plugin(&folder, dest)
}

/// Verify and unpack a repository archive, replacing `dest` wholesale with its
/// plugin tree. Returns the number of plugin folders.
pub fn unpack_repository_archive(
    file: &Path,
    dest: &Path,
    scratch_root: &Path,
    checksum: &str,
) -> Result<usize> {
    let scratch = Scratch::unpack(file, scratch_root, Some(checksum))?;
    let root = plugin_root(scratch.path())?;
    let count = folder_has_plugins(&root);

    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    move_dir(&root, dest)?;
    debug!("unpacked {count} plugin(s) into {}", dest.display());
    Ok(count)
}

/// Directory holding the plugin folders of an unpacked archive: the archive
/// root itself, or its single wrapper directory.
fn plugin_root(extracted: &Path) -> Result<PathBuf> {
    if folder_has_plugins(extracted) > 0 {
        return Ok(extracted.to_path_buf());
    }
    let dirs: Vec<PathBuf> = child_dirs(extracted).collect();
    if let [wrapper] = dirs.as_slice() {
        if folder_has_plugins(wrapper) > 0 {
            return Ok(wrapper.clone());
        }
    }
    Err(StoreError::ExtractionFailure(
        "archive holds no recognizable plugin folder".into(),
    ))
}

/// Move `folder` into `dest` under its own name, replacing a previous copy.
fn place_plugin(folder: &Path, dest: &Path) -> Result<PathBuf> {
    let target = dest.join(folder_name(folder)?);
    ensure_replaceable(&target)?;
    if target.exists() {
        fs::remove_dir_all(&target)?;
    }
    fs::create_dir_all(dest)?;
    move_dir(folder, &target)?;
    debug!("placed {}", target.display());
    Ok(target)
}

fn ensure_replaceable(target: &Path) -> Result<()> {
    match fs::metadata(target) {
        Ok(meta) if meta.permissions().readonly() => Err(StoreError::PermissionDenied(format!(
            "{} is write-protected",
            target.display()
        ))),
        _ => Ok(()),
    }
}

fn folder_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| StoreError::InvalidPlugin(format!("{} has no folder name", path.display())))
}

fn move_dir(src: &Path, dest: &Path) -> Result<()> {
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    // Different filesystems.
    copy_dir(src, dest)?;
    fs::remove_dir_all(src)?;
    Ok(())
}

fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| StoreError::Msg(format!("walk {}: {e}", src.display())))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| StoreError::Msg(e.to_string()))?;
        let out = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&out)?;
        } else {
            fs::copy(entry.path(), &out)?;
        }
    }
    Ok(())
}

/// Scratch directory removed on drop.
struct Scratch(PathBuf);

impl Scratch {
    fn create(scratch_root: &Path) -> Result<Self> {
        let path = loop {
            let candidate = scratch_root.join(format!("extract-{}", random_token(12)));
            if !candidate.exists() {
                break candidate;
            }
        };
        fs::create_dir_all(&path)?;
        Ok(Self(path))
    }

    fn unpack(file: &Path, scratch_root: &Path, checksum: Option<&str>) -> Result<Self> {
        if let Some(expected) = checksum {
            verify_checksum(file, expected)?;
        }
        let scratch = Self::create(scratch_root)?;
        unzip_into(file, scratch.path())?;
        Ok(scratch)
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if self.0.exists() {
            if let Err(e) = fs::remove_dir_all(&self.0) {
                warn!("could not remove scratch dir {}: {e}", self.0.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::manifest::sha256_file;
    use std::io::Write;
    use zip::write::FileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let mut zip = zip::ZipWriter::new(fs::File::create(path).unwrap());
        for (name, data) in entries {
            zip.start_file(*name, FileOptions::default()).unwrap();
            zip.write_all(data.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        archive: PathBuf,
        dest: PathBuf,
        scratch: PathBuf,
    }

    fn fixture(entries: &[(&str, &str)]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("plugins.zip");
        write_zip(&archive, entries);
        Fixture {
            dest: dir.path().join("user"),
            scratch: dir.path().join("tmp"),
            archive,
            _dir: dir,
        }
    }

    fn scratch_is_clean(f: &Fixture) -> bool {
        !f.scratch.exists() || fs::read_dir(&f.scratch).unwrap().next().is_none()
    }

    #[test]
    fn verified_archive_installs_every_plugin() {
        let f = fixture(&[
            ("Blur/plugin.info", "id=blur\nlabel=Blur\n"),
            ("Crop/plugin.info", "id=crop\nlabel=Crop\n"),
            ("Docs/readme.txt", "not a plugin"),
        ]);
        let sum = sha256_file(&f.archive).unwrap();

        let status = extract_plugin_archive(&f.archive, &f.dest, &f.scratch, Some(&sum));
        assert!(status.success, "{}", status.message);
        assert!(f.dest.join("Blur/plugin.info").is_file());
        assert!(f.dest.join("Crop/plugin.info").is_file());
        assert!(!f.dest.join("Docs").exists());
        assert!(scratch_is_clean(&f));
    }

    #[test]
    fn checksum_mismatch_touches_nothing() {
        let f = fixture(&[("Blur/plugin.info", "id=blur\nlabel=Blur\n")]);

        let status = extract_plugin_archive(&f.archive, &f.dest, &f.scratch, Some("abcd"));
        assert!(!status.success);
        assert_eq!(status.error, Some(ErrorKind::ChecksumMismatch));
        assert!(!f.dest.exists());
        assert!(!f.scratch.exists());
    }

    #[test]
    fn wrapper_directory_is_tolerated() {
        let f = fixture(&[("bundle-1.0/Blur/plugin.info", "id=blur\nlabel=Blur\n")]);
        let installed = extract_plugins(&f.archive, &f.dest, &f.scratch, None).unwrap();
        assert_eq!(installed, ["Blur"]);
        assert!(f.dest.join("Blur/plugin.info").is_file());
    }

    #[test]
    fn archive_without_plugins_fails_and_cleans_up() {
        let f = fixture(&[("readme.txt", "hello")]);
        let status = extract_plugin_archive(&f.archive, &f.dest, &f.scratch, None);
        assert_eq!(status.error, Some(ErrorKind::ExtractionFailure));
        assert!(scratch_is_clean(&f));
    }

    #[test]
    fn reinstall_overwrites_previous_folder() {
        let f = fixture(&[("Blur/plugin.info", "id=blur\nlabel=Blur\nversion=2\n")]);
        fs::create_dir_all(f.dest.join("Blur")).unwrap();
        fs::write(f.dest.join("Blur/stale.txt"), "old").unwrap();

        extract_plugins(&f.archive, &f.dest, &f.scratch, None).unwrap();
        assert!(!f.dest.join("Blur/stale.txt").exists());
        assert_eq!(get_plugin_specs(&f.dest.join("Blur")).unwrap().version, 2.0);
    }

    #[test]
    fn write_protected_target_is_refused() {
        let f = fixture(&[("Blur/plugin.info", "id=blur\nlabel=Blur\n")]);
        let target = f.dest.join("Blur");
        fs::create_dir_all(&target).unwrap();
        let mut perms = fs::metadata(&target).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(&target, perms.clone()).unwrap();

        let err = extract_plugins(&f.archive, &f.dest, &f.scratch, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(target.exists());

        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        fs::set_permissions(&target, perms).unwrap();
    }

    #[test]
    fn single_plugin_is_picked_by_id() {
        let f = fixture(&[
            ("Blur/plugin.info", "id=blur\nlabel=Blur\n"),
            ("Crop/plugin.info", "id=crop\nlabel=Crop\n"),
        ]);
        let sum = sha256_file(&f.archive).unwrap();

        let path = install_plugin_from_archive(&f.archive, "crop", &f.dest, &f.scratch, &sum).unwrap();
        assert_eq!(path, f.dest.join("Crop"));
        assert!(!f.dest.join("Blur").exists());

        let err =
            install_plugin_from_archive(&f.archive, "nope", &f.dest, &f.scratch, &sum).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPlugin);
    }

    #[test]
    fn repository_archive_replaces_cache_tree() {
        let f = fixture(&[("Blur/plugin.info", "id=blur\nlabel=Blur\n")]);
        let sum = sha256_file(&f.archive).unwrap();
        let cache = f.dest.join("repos/r1/plugins");
        fs::create_dir_all(cache.join("Gone")).unwrap();

        let count = unpack_repository_archive(&f.archive, &cache, &f.scratch, &sum).unwrap();
        assert_eq!(count, 1);
        assert!(cache.join("Blur/plugin.info").is_file());
        assert!(!cache.join("Gone").exists());
    }
}
