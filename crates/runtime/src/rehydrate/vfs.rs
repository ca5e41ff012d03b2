//! In-memory virtual file system.
//!
//! A tree of directories and files reconstructible at any point in time.
//! `write_file` auto-creates parent directories; path sanitation normalizes
//! `.`/`..` and refuses traversal outside the root. Snapshots serialize to
//! gzipped JSON of `{root}`; loading accepts gzip or raw JSON and validates
//! that the root is a directory node.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::types::RehydrationError;

/// One node in the tree. The wire format tags with `type` and uses
/// camelCase for file metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VfsNode {
    Directory {
        name: String,
        children: BTreeMap<String, VfsNode>,
    },
    File {
        name: String,
        content: String,
        #[serde(rename = "lastModified")]
        last_modified: i64,
    },
}

impl VfsNode {
    fn directory(name: &str) -> Self {
        Self::Directory {
            name: name.to_string(),
            children: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDocument {
    root: VfsNode,
}

/// The virtual file system.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualFileSystem {
    root: VfsNode,
}

impl Default for VirtualFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualFileSystem {
    pub fn new() -> Self {
        Self {
            root: VfsNode::directory(""),
        }
    }

    /// Normalize a path into components. `.` drops, `..` pops; popping past
    /// the root is a traversal error.
    fn sanitize(path: &str) -> Result<Vec<String>, RehydrationError> {
        let mut components: Vec<String> = Vec::new();
        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    if components.pop().is_none() {
                        return Err(RehydrationError::InvalidPath(format!(
                            "path escapes root: {path}"
                        )));
                    }
                }
                name => components.push(name.to_string()),
            }
        }
        if components.is_empty() {
            return Err(RehydrationError::InvalidPath(format!(
                "empty path: {path:?}"
            )));
        }
        Ok(components)
    }

    pub fn write_file(
        &mut self,
        path: &str,
        content: &str,
        last_modified: i64,
    ) -> Result<(), RehydrationError> {
        let components = Self::sanitize(path)?;
        let (file_name, directories) = components.split_last().expect("sanitize is non-empty");

        let mut node = &mut self.root;
        for directory in directories {
            let VfsNode::Directory { children, .. } = node else {
                return Err(RehydrationError::InvalidPath(format!(
                    "component '{directory}' of {path} is a file"
                )));
            };
            node = children
                .entry(directory.clone())
                .or_insert_with(|| VfsNode::directory(directory));
        }
        let VfsNode::Directory { children, .. } = node else {
            return Err(RehydrationError::InvalidPath(format!(
                "parent of {path} is a file"
            )));
        };
        children.insert(
            file_name.clone(),
            VfsNode::File {
                name: file_name.clone(),
                content: content.to_string(),
                last_modified,
            },
        );
        Ok(())
    }

    /// Create an empty directory, including parents.
    pub fn make_dir(&mut self, path: &str) -> Result<(), RehydrationError> {
        let components = Self::sanitize(path)?;
        let mut node = &mut self.root;
        for directory in &components {
            let VfsNode::Directory { children, .. } = node else {
                return Err(RehydrationError::InvalidPath(format!(
                    "component '{directory}' of {path} is a file"
                )));
            };
            node = children
                .entry(directory.clone())
                .or_insert_with(|| VfsNode::directory(directory));
        }
        Ok(())
    }

    fn lookup(&self, path: &str) -> Option<&VfsNode> {
        let components = Self::sanitize(path).ok()?;
        let mut node = &self.root;
        for component in &components {
            let VfsNode::Directory { children, .. } = node else {
                return None;
            };
            node = children.get(component)?;
        }
        Some(node)
    }

    pub fn read_file(&self, path: &str) -> Option<&str> {
        match self.lookup(path)? {
            VfsNode::File { content, .. } => Some(content),
            VfsNode::Directory { .. } => None,
        }
    }

    pub fn contains_file(&self, path: &str) -> bool {
        self.read_file(path).is_some()
    }

    /// All file paths, depth-first, `/`-joined.
    pub fn list_files(&self) -> Vec<String> {
        fn walk(node: &VfsNode, prefix: &str, out: &mut Vec<String>) {
            match node {
                VfsNode::File { name, .. } => {
                    out.push(format!("{prefix}{name}"));
                }
                VfsNode::Directory { children, .. } => {
                    for (name, child) in children {
                        match child {
                            VfsNode::File { .. } => out.push(format!("{prefix}{name}")),
                            VfsNode::Directory { .. } => {
                                walk(child, &format!("{prefix}{name}/"), out)
                            }
                        }
                    }
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.root, "", &mut out);
        out
    }

    /// Serialize to gzipped JSON `{root}`.
    pub fn to_snapshot_bytes(&self) -> Result<Vec<u8>, RehydrationError> {
        let document = SnapshotDocument {
            root: self.root.clone(),
        };
        let json =
            serde_json::to_vec(&document).map_err(|e| RehydrationError::SnapshotUnreadable {
                uri: "<serialize>".into(),
                reason: e.to_string(),
            })?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&json)
            .and_then(|_| encoder.finish())
            .map_err(|e| RehydrationError::SnapshotUnreadable {
                uri: "<serialize>".into(),
                reason: e.to_string(),
            })
    }

    /// Deserialize a snapshot: gzip first, raw JSON fallback. The root must
    /// be a directory node.
    pub fn from_snapshot_bytes(bytes: &[u8], uri: &str) -> Result<Self, RehydrationError> {
        let mut decompressed = Vec::new();
        let json: &[u8] = match GzDecoder::new(bytes).read_to_end(&mut decompressed) {
            Ok(_) => &decompressed,
            Err(_) => bytes,
        };
        let document: SnapshotDocument =
            serde_json::from_slice(json).map_err(|e| RehydrationError::SnapshotUnreadable {
                uri: uri.to_string(),
                reason: e.to_string(),
            })?;
        match document.root {
            VfsNode::Directory { .. } => Ok(Self {
                root: document.root,
            }),
            VfsNode::File { .. } => Err(RehydrationError::SnapshotUnreadable {
                uri: uri.to_string(),
                reason: "snapshot root is not a directory".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_creates_parent_directories() {
        let mut vfs = VirtualFileSystem::new();
        vfs.write_file("src/storage/blob.rs", "pub fn save() {}", 1_000)
            .unwrap();
        assert_eq!(
            vfs.read_file("src/storage/blob.rs"),
            Some("pub fn save() {}")
        );
        assert_eq!(vfs.list_files(), vec!["src/storage/blob.rs".to_string()]);
    }

    #[test]
    fn dot_dot_normalizes_inside_root() {
        let mut vfs = VirtualFileSystem::new();
        vfs.write_file("src/../README.md", "readme", 1).unwrap();
        assert!(vfs.contains_file("README.md"));
    }

    #[test]
    fn traversal_outside_root_is_rejected() {
        let mut vfs = VirtualFileSystem::new();
        let err = vfs.write_file("../etc/passwd", "x", 1).unwrap_err();
        assert!(matches!(err, RehydrationError::InvalidPath(_)));
    }

    #[test]
    fn snapshot_round_trip_preserves_empty_directories() {
        let mut vfs = VirtualFileSystem::new();
        vfs.write_file("src/main.rs", "fn main() {}", 5).unwrap();
        vfs.make_dir("tests/fixtures").unwrap();

        let bytes = vfs.to_snapshot_bytes().unwrap();
        let restored = VirtualFileSystem::from_snapshot_bytes(&bytes, "blob:test").unwrap();
        assert_eq!(restored, vfs);
        assert_eq!(restored.read_file("src/main.rs"), Some("fn main() {}"));
    }

    #[test]
    fn raw_json_snapshot_is_accepted() {
        let mut vfs = VirtualFileSystem::new();
        vfs.write_file("a.txt", "alpha", 1).unwrap();
        let document = serde_json::json!({
            "root": {
                "type": "directory",
                "name": "",
                "children": {
                    "a.txt": {"type": "file", "name": "a.txt", "content": "alpha", "lastModified": 1}
                }
            }
        });
        let restored =
            VirtualFileSystem::from_snapshot_bytes(&serde_json::to_vec(&document).unwrap(), "raw")
                .unwrap();
        assert_eq!(restored, vfs);
    }

    #[test]
    fn garbage_snapshot_is_unreadable() {
        let err = VirtualFileSystem::from_snapshot_bytes(b"definitely not json", "blob:bad")
            .unwrap_err();
        assert!(matches!(err, RehydrationError::SnapshotUnreadable { .. }));
    }

    #[test]
    fn file_root_is_rejected() {
        let document = serde_json::json!({
            "root": {"type": "file", "name": "x", "content": "", "lastModified": 0}
        });
        let err = VirtualFileSystem::from_snapshot_bytes(
            &serde_json::to_vec(&document).unwrap(),
            "blob:file-root",
        )
        .unwrap_err();
        assert!(matches!(err, RehydrationError::SnapshotUnreadable { .. }));
    }
}
