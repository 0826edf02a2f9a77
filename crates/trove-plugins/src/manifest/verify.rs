//! Archive checksum gate. A repository's `<checksum>` is the lowercase hex
//! SHA-256 of its archive; nothing is extracted unless it matches.

use crate::errors::{Result, StoreError};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::Path;

/// Verify the sha256 of `path` against `expected` (hex, case-insensitive).
/// An empty `expected` never matches.
pub fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    let want = expected.trim().to_lowercase();
    let got = sha256_file(path)?;

    if want.is_empty() || got != want {
        return Err(StoreError::ChecksumMismatch {
            file: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            expected: want,
            actual: got,
        });
    }
    Ok(())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut f = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
