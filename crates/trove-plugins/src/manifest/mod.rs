//! Repository manifest documents.
//!
//! A manifest is a small XML file with a `<repo>` root whose children carry the
//! repository metadata. The `<version>` child selects the schema parser; only
//! schema 1 exists today.

pub mod verify;

use crate::errors::{Result, StoreError};
use crate::types::{RepoSpecs, MODIFIED_FORMAT};
use chrono::NaiveDateTime;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::warn;

pub use verify::{sha256_file, verify_checksum};

pub const MANIFEST_TAG_ROOT: &str = "repo";
pub const MANIFEST_TAG_VERSION: &str = "version";
pub const MANIFEST_TAG_ID: &str = "id";
pub const MANIFEST_TAG_TITLE: &str = "title";
pub const MANIFEST_TAG_URL: &str = "url";
pub const MANIFEST_TAG_MANIFEST: &str = "manifest";
pub const MANIFEST_TAG_LOGO: &str = "logo";
pub const MANIFEST_TAG_ZIP: &str = "zip";
pub const MANIFEST_TAG_CHECKSUM: &str = "checksum";
pub const MANIFEST_TAG_MODIFIED: &str = "modified";

/// Schema tag of `text`, or 0 when the document is empty, malformed or untagged.
pub fn get_manifest_version(text: &str) -> f64 {
    read_fields(text)
        .ok()
        .and_then(|fields| {
            fields
                .get(MANIFEST_TAG_VERSION)
                .and_then(|v| v.trim().parse::<f64>().ok())
        })
        .filter(|v| v.is_finite() && *v > 0.0)
        .unwrap_or(0.0)
}

pub fn is_valid_manifest(text: &str) -> bool {
    read_manifest(text).is_ok()
}

/// Parse a manifest, dispatching on its schema version.
pub fn read_manifest(text: &str) -> Result<RepoSpecs> {
    let version = get_manifest_version(text);
    if is_schema(version, 1) {
        return parse_manifest_v1(text);
    }
    if version == 0.0 {
        return Err(StoreError::InvalidManifest(
            "missing or unreadable version tag".into(),
        ));
    }
    Err(StoreError::InvalidManifest(format!(
        "unsupported manifest version {version}"
    )))
}

/// Read and parse a manifest file from disk.
pub fn open_manifest(path: &Path) -> Result<RepoSpecs> {
    let text = fs::read_to_string(path)?;
    read_manifest(&text)
}

pub fn parse_manifest_v1(text: &str) -> Result<RepoSpecs> {
    let fields = read_fields(text)?;
    let field = |tag: &str| {
        fields
            .get(tag)
            .map(|v| v.trim().to_string())
            .unwrap_or_default()
    };

    let version: f64 = field(MANIFEST_TAG_VERSION).parse().unwrap_or(0.0);
    if !is_schema(version, 1) {
        return Err(StoreError::InvalidManifest(format!(
            "expected schema 1, found {}",
            field(MANIFEST_TAG_VERSION)
        )));
    }

    let modified_raw = field(MANIFEST_TAG_MODIFIED);
    let modified = if modified_raw.is_empty() {
        None
    } else {
        match NaiveDateTime::parse_from_str(&modified_raw, MODIFIED_FORMAT) {
            Ok(ts) => Some(ts),
            Err(e) => {
                warn!("manifest has unreadable modified timestamp {modified_raw:?}: {e}");
                None
            }
        }
    };

    let url = field(MANIFEST_TAG_URL);
    let manifest = field(MANIFEST_TAG_MANIFEST);
    let id = match field(MANIFEST_TAG_ID) {
        explicit if !explicit.is_empty() => explicit,
        _ if !url.is_empty() => derive_repo_id(&url),
        _ => derive_repo_id(&manifest),
    };

    Ok(RepoSpecs {
        version,
        label: field(MANIFEST_TAG_TITLE),
        id,
        url,
        manifest,
        logo: field(MANIFEST_TAG_LOGO),
        zip: field(MANIFEST_TAG_ZIP),
        checksum: field(MANIFEST_TAG_CHECKSUM),
        modified,
        enabled: false,
    })
}

/// Serialize `repo` as a schema 1 manifest.
pub fn write_manifest(repo: &RepoSpecs) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str(&format!("<{MANIFEST_TAG_ROOT}>\n"));

    let mut push = |tag: &str, value: &str| {
        out.push_str(&format!("  <{tag}>{}</{tag}>\n", escape(value)));
    };
    push(MANIFEST_TAG_VERSION, &repo.version.to_string());
    push(MANIFEST_TAG_ID, &repo.id);
    push(MANIFEST_TAG_TITLE, &repo.label);
    push(MANIFEST_TAG_URL, &repo.url);
    push(MANIFEST_TAG_MANIFEST, &repo.manifest);
    push(MANIFEST_TAG_LOGO, &repo.logo);
    push(MANIFEST_TAG_ZIP, &repo.zip);
    push(MANIFEST_TAG_CHECKSUM, &repo.checksum);
    if let Some(ts) = repo.modified {
        push(
            MANIFEST_TAG_MODIFIED,
            &ts.format(MODIFIED_FORMAT).to_string(),
        );
    }

    out.push_str(&format!("</{MANIFEST_TAG_ROOT}>\n"));
    out
}

/// Stable repository id for manifests that do not name one.
pub fn derive_repo_id(source: &str) -> String {
    let digest = Sha256::digest(source.trim().as_bytes());
    hex::encode(digest)[..16].to_string()
}

fn is_schema(version: f64, schema: u32) -> bool {
    (version - f64::from(schema)).abs() < f64::EPSILON
}

/// Collect the text of every direct child of the `<repo>` root.
fn read_fields(text: &str) -> Result<HashMap<String, String>> {
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);

    let mut fields = HashMap::new();
    let mut depth = 0usize;
    let mut root_seen = false;
    let mut current: Option<String> = None;

    loop {
        let event = reader.read_event().map_err(|e| {
            StoreError::InvalidManifest(format!(
                "malformed XML at byte {}: {e}",
                reader.buffer_position()
            ))
        })?;
        match event {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match depth {
                    0 if name == MANIFEST_TAG_ROOT => root_seen = true,
                    0 => {
                        return Err(StoreError::InvalidManifest(format!(
                            "expected <{MANIFEST_TAG_ROOT}> root, found <{name}>"
                        )))
                    }
                    1 => {
                        fields.entry(name.clone()).or_insert_with(String::new);
                        current = Some(name);
                    }
                    _ => {}
                }
                depth += 1;
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match depth {
                    0 if name == MANIFEST_TAG_ROOT => root_seen = true,
                    0 => {
                        return Err(StoreError::InvalidManifest(format!(
                            "expected <{MANIFEST_TAG_ROOT}> root, found <{name}/>"
                        )))
                    }
                    1 => {
                        fields.entry(name).or_insert_with(String::new);
                    }
                    _ => {}
                }
            }
            Event::Text(t) if depth == 2 => {
                let value = t
                    .unescape()
                    .map_err(|e| StoreError::InvalidManifest(e.to_string()))?;
                if let Some(slot) = current.as_ref().and_then(|name| fields.get_mut(name)) {
                    slot.push_str(&value);
                }
            }
            Event::CData(c) if depth == 2 => {
                let raw = c.into_inner();
                if let Some(slot) = current.as_ref().and_then(|name| fields.get_mut(name)) {
                    slot.push_str(&String::from_utf8_lossy(&raw));
                }
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if depth <= 1 {
                    current = None;
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !root_seen {
        return Err(StoreError::InvalidManifest(format!(
            "missing <{MANIFEST_TAG_ROOT}> root element"
        )));
    }
    Ok(fields)
}
