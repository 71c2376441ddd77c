//! The manifest model: an immutable, point-in-time description of a backed
//! up directory tree as an ordered list of entries.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// One file, directory, or symlink in a manifest.
///
/// Field names are the wire format and must not change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// Path relative to the backup root, forward-slash separated.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Unix permission bits.
    pub mode: u32,
    /// Modification time, nanoseconds since the epoch.
    pub mtime: i64,
    /// Uncompressed file size (files only).
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: u64,
    /// Ordered block CIDs (files only; empty for an empty file).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<String>,
    /// Symlink target (symlinks only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl Entry {
    pub fn dir(path: String, mode: u32, mtime: i64) -> Self {
        Self {
            path,
            kind: EntryKind::Dir,
            mode,
            mtime,
            size: 0,
            blocks: Vec::new(),
            link_target: None,
        }
    }

    pub fn file(path: String, mode: u32, mtime: i64, size: u64) -> Self {
        Self {
            path,
            kind: EntryKind::File,
            mode,
            mtime,
            size,
            blocks: Vec::new(),
            link_target: None,
        }
    }

    pub fn symlink(path: String, mode: u32, mtime: i64, target: String) -> Self {
        Self {
            path,
            kind: EntryKind::Symlink,
            mode,
            mtime,
            size: 0,
            blocks: Vec::new(),
            link_target: Some(target),
        }
    }
}

/// A point-in-time description of a backed-up directory tree.
///
/// Manifests are created whole, never mutated, and destroyed only by
/// explicit delete or retention pruning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Lexicographically sortable: UTC timestamp plus a random suffix.
    pub id: String,
    /// Tag mapping; the distinguished `name` tag groups related backups.
    pub tags: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub root_path: String,
    pub entries: Vec<Entry>,
}

impl Manifest {
    pub fn new(tags: BTreeMap<String, String>, root_path: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            tags,
            created_at: Utc::now(),
            root_path: root_path.into(),
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    /// Index entries by path for incremental-backup lookups.
    pub fn index_by_path(&self) -> HashMap<&str, &Entry> {
        self.entries
            .iter()
            .map(|e| (e.path.as_str(), e))
            .collect()
    }

    pub fn find_entry(&self, path: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.path == path)
    }
}

/// Summary row returned by manifest listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestInfo {
    pub id: String,
    pub tags: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Whether `tags` contains every `(k, v)` pair of `filter`.
pub fn matches_tags(tags: &BTreeMap<String, String>, filter: &BTreeMap<String, String>) -> bool {
    filter
        .iter()
        .all(|(k, v)| tags.get(k).is_some_and(|have| have == v))
}

fn generate_id() -> String {
    let suffix: [u8; 4] = rand::random();
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%d-%H%M%S"),
        hex::encode(suffix)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn id_shape_is_timestamp_dash_suffix() {
        let m = Manifest::new(tags(&[("name", "t")]), "/root");
        // "YYYYMMDD-HHMMSS-xxxxxxxx"
        assert_eq!(m.id.len(), 8 + 1 + 6 + 1 + 8);
        let parts: Vec<&str> = m.id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].chars().all(|c| c.is_ascii_digit()));
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn wire_field_names_are_normative() {
        let mut m = Manifest::new(tags(&[("name", "t")]), "/data");
        let mut e = Entry::file("a.txt".into(), 0o644, 42, 6);
        e.blocks = vec!["bafy-example".into()];
        m.push(e);
        m.push(Entry::symlink("link".into(), 0o777, 43, "a.txt".into()));

        let v: serde_json::Value = serde_json::to_value(&m).unwrap();
        assert!(v.get("id").is_some());
        assert!(v.get("created_at").unwrap().as_str().is_some());
        assert_eq!(v["root_path"], "/data");
        assert_eq!(v["entries"][0]["type"], "file");
        assert_eq!(v["entries"][0]["path"], "a.txt");
        assert_eq!(v["entries"][0]["size"], 6);
        assert_eq!(v["entries"][0]["blocks"][0], "bafy-example");
        assert_eq!(v["entries"][1]["type"], "symlink");
        assert_eq!(v["entries"][1]["link_target"], "a.txt");
        // Empty collections are elided from the wire form.
        assert!(v["entries"][1].get("blocks").is_none());
        assert!(v["entries"][1].get("size").is_none());
    }

    #[test]
    fn created_at_serializes_rfc3339() {
        let m = Manifest::new(tags(&[]), "/");
        let v: serde_json::Value = serde_json::to_value(&m).unwrap();
        let ts = v["created_at"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn json_roundtrip() {
        let mut m = Manifest::new(tags(&[("name", "app"), ("env", "prod")]), "/srv");
        m.push(Entry::dir("sub".into(), 0o755, 1));
        let text = serde_json::to_string(&m).unwrap();
        let back: Manifest = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, m.id);
        assert_eq!(back.tags, m.tags);
        assert_eq!(back.entries.len(), 1);
        assert_eq!(back.entries[0].kind, EntryKind::Dir);
    }

    #[test]
    fn index_by_path_finds_entries() {
        let mut m = Manifest::new(tags(&[]), "/");
        m.push(Entry::file("a".into(), 0o644, 0, 1));
        m.push(Entry::file("b/c".into(), 0o644, 0, 2));
        let idx = m.index_by_path();
        assert_eq!(idx.get("b/c").unwrap().size, 2);
        assert!(idx.get("missing").is_none());
    }

    #[test]
    fn tag_filter_semantics() {
        let have = tags(&[("name", "app"), ("env", "prod")]);
        assert!(matches_tags(&have, &tags(&[])));
        assert!(matches_tags(&have, &tags(&[("name", "app")])));
        assert!(matches_tags(&have, &tags(&[("name", "app"), ("env", "prod")])));
        assert!(!matches_tags(&have, &tags(&[("name", "other")])));
        assert!(!matches_tags(&have, &tags(&[("missing", "x")])));
    }
}
