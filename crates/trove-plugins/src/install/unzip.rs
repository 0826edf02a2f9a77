use crate::errors::{Result, StoreError};
use std::fs;
use std::path::Path;
use zip::ZipArchive;

/// Extract every entry of `zip_path` under `dest`. Entries whose names would
/// land outside `dest` fail the whole extraction. Returns the file count.
pub fn unzip_into(zip_path: &Path, dest: &Path) -> Result<usize> {
    let f = fs::File::open(zip_path)?;
    let mut archive = ZipArchive::new(f)?;
    fs::create_dir_all(dest)?;

    let mut files = 0;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let Some(rel) = file.enclosed_name().map(Path::to_path_buf) else {
            return Err(StoreError::ExtractionFailure(format!(
                "unsafe entry name {:?}",
                file.name()
            )));
        };
        let outpath = dest.join(rel);
        if file.is_dir() {
            fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = fs::File::create(&outpath)?;
            std::io::copy(&mut file, &mut out)?;
            files += 1;
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let mut zip = zip::ZipWriter::new(fs::File::create(path).unwrap());
        for (name, data) in entries {
            if name.ends_with('/') {
                zip.add_directory(*name, FileOptions::default()).unwrap();
            } else {
                zip.start_file(*name, FileOptions::default()).unwrap();
                zip.write_all(data).unwrap();
            }
        }
        zip.finish().unwrap();
    }

    #[test]
    fn nested_entries_are_extracted() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        write_zip(
            &archive,
            &[("Blur/", b""), ("Blur/plugin.info", b"id=blur"), ("Blur/res/x.txt", b"x")],
        );

        let out = dir.path().join("out");
        assert_eq!(unzip_into(&archive, &out).unwrap(), 2);
        assert_eq!(fs::read(out.join("Blur/plugin.info")).unwrap(), b"id=blur");
        assert!(out.join("Blur/res/x.txt").is_file());
    }

    #[test]
    fn escaping_entry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("../evil.txt", b"boom")]);

        let err = unzip_into(&archive, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, StoreError::ExtractionFailure(_)));
        assert!(!dir.path().join("evil.txt").exists());
    }

    #[test]
    fn garbage_is_an_extraction_failure() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("junk.zip");
        fs::write(&archive, b"not a zip at all").unwrap();

        let err = unzip_into(&archive, &dir.path().join("out")).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::ExtractionFailure);
    }
}
