use crate::errors::{ErrorKind, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Timestamp layout used by manifests and by the persisted repository list.
pub const MODIFIED_FORMAT: &str = "%Y-%m-%d %H:%M";

/// One plugin folder found on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSpecs {
    pub id: String,
    pub label: String,
    pub version: f64,
    pub icon: String,
    pub group: String,
    /// Raw description; `\n` and `\\` are still escaped. See [`PluginSpecs::description`].
    pub desc: String,
    pub path: PathBuf,
    pub folder: String,
    pub writable: bool,
    /// Owning repository for plugins extracted from a repository archive.
    #[serde(default)]
    pub repo: Option<String>,
}

impl Default for PluginSpecs {
    fn default() -> Self {
        Self {
            id: String::new(),
            label: String::new(),
            version: 0.0,
            icon: String::new(),
            group: String::new(),
            desc: String::new(),
            path: PathBuf::new(),
            folder: String::new(),
            writable: true,
            repo: None,
        }
    }
}

impl PluginSpecs {
    /// Description with `\n` and `\\` escapes decoded.
    pub fn description(&self) -> String {
        let mut out = String::with_capacity(self.desc.len());
        let mut chars = self.desc.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        }
        out
    }
}

/// A remote repository publishing plugins through its manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoSpecs {
    pub version: f64,
    pub label: String,
    pub id: String,
    pub url: String,
    pub manifest: String,
    pub logo: String,
    pub zip: String,
    pub checksum: String,
    #[serde(default, with = "modified_format")]
    pub modified: Option<NaiveDateTime>,
    pub enabled: bool,
}

impl Default for RepoSpecs {
    fn default() -> Self {
        Self {
            version: 1.0,
            label: String::new(),
            id: String::new(),
            url: String::new(),
            manifest: String::new(),
            logo: String::new(),
            zip: String::new(),
            checksum: String::new(),
            modified: None,
            enabled: false,
        }
    }
}

mod modified_format {
    use super::MODIFIED_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<NaiveDateTime>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.serialize_str(&ts.format(MODIFIED_FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<NaiveDateTime>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => NaiveDateTime::parse_from_str(s, MODIFIED_FORMAT)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Derived install state of a plugin. Never stored; see [`crate::state::plugin_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginType {
    None,
    Available,
    Installed,
    Update,
}

/// Result of a catalog command (install, remove, extract).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginStatus {
    pub success: bool,
    pub message: String,
    /// The command is waiting on a download and will finish through events.
    #[serde(default)]
    pub queued: bool,
    #[serde(default)]
    pub error: Option<ErrorKind>,
}

impl PluginStatus {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            queued: false,
            error: None,
        }
    }

    pub fn queued(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            queued: true,
            error: None,
        }
    }

    pub fn from_result(res: Result<String>) -> Self {
        match res {
            Ok(message) => Self::ok(message),
            Err(e) => Self {
                success: false,
                message: e.to_string(),
                queued: false,
                error: Some(e.kind()),
            },
        }
    }
}

/// What a queued download is for; decides which handler receives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadKind {
    Manifest,
    Zip,
    Logo,
}
