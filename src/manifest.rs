//! `content.json` parsing: the file listing at the root of a site.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{NodeError, NodeResult};

/// A fixed size cap on `includes` manifests, matching the reference node's
/// bound on how large a delegated sub-manifest is allowed to be.
pub const INCLUDE_SIZE_CAP: usize = 2_048_000;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileEntry {
    pub sha512: String,
    pub size: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct IncludeEntry {
    #[serde(default)]
    pub signers: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Manifest {
    pub modified: f64,
    #[serde(default)]
    pub files: BTreeMap<String, FileEntry>,
    #[serde(default)]
    pub includes: BTreeMap<String, IncludeEntry>,
    /// Every field ZeroNode doesn't interpret directly, kept so the UI layer
    /// can forward the manifest to the browser unchanged.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Manifest {
    pub fn parse(bytes: &[u8]) -> NodeResult<Self> {
        serde_json::from_slice(bytes).map_err(NodeError::Json)
    }

    /// `user_contents.archived`, if present: a mapping of archived user
    /// subdirectory name to an archival timestamp. Each archived entry
    /// implies a `<dir>/content.json` and `<dir>/data.json` to fetch.
    pub fn archived_user_dirs(&self) -> Vec<String> {
        self.extra
            .get("user_contents")
            .and_then(|v| v.get("archived"))
            .and_then(|v| v.as_object())
            .map(|obj| obj.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_manifest() {
        let raw = br#"{
            "modified": 123.456,
            "files": {"hello.txt": {"sha512": "abc", "size": 3}},
            "includes": {}
        }"#;
        let manifest = Manifest::parse(raw).unwrap();
        assert_eq!(manifest.modified, 123.456);
        assert_eq!(manifest.files["hello.txt"].size, 3);
    }

    #[test]
    fn preserves_unknown_fields() {
        let raw = br#"{"modified": 1.0, "files": {}, "includes": {}, "title": "My Site"}"#;
        let manifest = Manifest::parse(raw).unwrap();
        assert_eq!(manifest.extra["title"], "My Site");
    }

    #[test]
    fn finds_archived_user_dirs() {
        let raw = br#"{
            "modified": 1.0, "files": {}, "includes": {},
            "user_contents": {"archived": {"user1": 1000, "user2": 2000}}
        }"#;
        let manifest = Manifest::parse(raw).unwrap();
        let mut dirs = manifest.archived_user_dirs();
        dirs.sort();
        assert_eq!(dirs, vec!["user1".to_string(), "user2".to_string()]);
    }
}
