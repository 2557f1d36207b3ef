//! Snapshot loading.
//!
//! A snapshot is JSON produced by an offline tool that walks a real host:
//!
//! ```json
//! {"root": {"t": 1, "n": "", "m": 2147484141, "o": "root", "f": {...}}, "home": "/home/{}"}
//! ```
//!
//! Node keys: `t` kind (1 dir, 2 file, 3 symlink), `n` name, `f` children,
//! `c` contents, `m` mode, `o` owner, `g` group, `mt` mtime, `lt` link
//! target, `nl` link count.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::mode::Mode;
use super::node::{Node, NodeKind};
use super::path::{self, DEFAULT_HOME_TEMPLATE};
use super::Vfs;

const KIND_DIR: u8 = 1;
const KIND_FILE: u8 = 2;
const KIND_SYMLINK: u8 = 3;

/// Snapshot load errors. All fatal at startup.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to read snapshot: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed snapshot: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown node kind {kind} at {path}")]
    InvalidKind { path: String, kind: u8 },

    #[error("snapshot root is not a directory")]
    RootNotDirectory,
}

/// Serialized tree plus home template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub root: SnapshotNode,
    #[serde(default = "default_home")]
    pub home: String,
}

fn default_home() -> String {
    DEFAULT_HOME_TEMPLATE.to_string()
}

/// One serialized node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotNode {
    #[serde(rename = "t")]
    pub kind: u8,
    #[serde(rename = "n", default)]
    pub name: String,
    #[serde(rename = "f", default, skip_serializing_if = "Option::is_none")]
    pub children: Option<BTreeMap<String, SnapshotNode>>,
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
    #[serde(rename = "m", default)]
    pub mode: u32,
    #[serde(rename = "o", default)]
    pub owner: String,
    #[serde(rename = "g", default)]
    pub group: String,
    #[serde(rename = "mt", default, skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<DateTime<Utc>>,
    #[serde(rename = "lt", default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    #[serde(rename = "nl", default, skip_serializing_if = "Option::is_none")]
    pub nlink: Option<u32>,
}

impl SnapshotNode {
    /// Convert to a tree node named `name`. The parent's map key wins over `n`.
    fn into_node(self, name: String, at: &str, loaded: DateTime<Utc>) -> Result<Node, SnapshotError> {
        let owner = if self.owner.is_empty() { "root".to_string() } else { self.owner };
        let group = if self.group.is_empty() { owner.clone() } else { self.group };
        let mod_time = self.mod_time.unwrap_or(loaded);

        let (kind, mode, default_nlink) = match self.kind {
            KIND_DIR => {
                let mut children = std::collections::HashMap::new();
                for (child_name, child) in self.children.unwrap_or_default() {
                    let child_path = path::join(at, &child_name);
                    let node = child.into_node(child_name.clone(), &child_path, loaded)?;
                    children.insert(child_name, node);
                }
                (NodeKind::Directory(children), Mode::from_bits(self.mode).with_dir_flag(), 2)
            }
            KIND_FILE => (
                NodeKind::File(self.contents.unwrap_or_default()),
                Mode::from_bits(self.mode),
                1,
            ),
            KIND_SYMLINK => (
                NodeKind::Symlink(self.link_target.unwrap_or_default()),
                Mode::from_bits(self.mode | Mode::SYMLINK),
                1,
            ),
            kind => {
                return Err(SnapshotError::InvalidKind {
                    path: at.to_string(),
                    kind,
                });
            }
        };

        Ok(Node {
            name,
            owner,
            group,
            mode,
            mod_time,
            nlink: self.nlink.unwrap_or(default_nlink),
            kind,
        })
    }
}

impl Snapshot {
    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Build the live tree.
    pub fn into_vfs(self) -> Result<Vfs, SnapshotError> {
        if self.root.kind != KIND_DIR {
            return Err(SnapshotError::RootNotDirectory);
        }
        let root = self.root.into_node(String::new(), "/", Utc::now())?;
        let home = if self.home.is_empty() { default_home() } else { self.home };
        Ok(Vfs::new(root, home))
    }
}

impl Vfs {
    /// Load a snapshot file.
    pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading snapshot");
        let json = std::fs::read_to_string(path)?;
        let vfs = Self::from_json(&json)?;
        info!(path = %path.display(), home = %vfs.home_template(), "snapshot loaded");
        Ok(vfs)
    }

    /// Load a snapshot from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        Snapshot::from_json(json)?.into_vfs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{FileType, VfsContext, VfsError};

    const FIXTURE: &str = r#"{"root":{"t":1,"n":"","f":{"home":{"t":1,"n":"home","f":{"{}":{"t":1,"n":"{}","f":{"test.txt":{"t":2,"n":"test.txt","o":"{}","c":"This is a test file","m":432}},"o":"{}","m":2147484157}},"o":"root","m":2147484141},"etc":{"t":1,"n":"etc","f":{"hostname":{"t":2,"n":"hostname","o":"root","c":"test-hostname","m":420},"issue":{"t":2,"n":"issue","o":"root","c":"Ubuntu 22.04","m":420}},"o":"root","m":2147484141}},"o":"root","m":2147484141},"home":"/home/{}"}"#;

    fn ctx(user: &str) -> VfsContext {
        VfsContext::new("/", user, Some(crate::vfs::Identity::new("{}", "{}")))
    }

    #[test]
    fn test_load_fixture() {
        let vfs = Vfs::from_json(FIXTURE).unwrap();
        assert_eq!(vfs.home_template(), "/home/{}");

        let r = vfs.resolve("/etc/issue", &ctx("test")).unwrap();
        assert_eq!(r.path, "/etc/issue");
        assert_eq!(r.node.contents(), Some("Ubuntu 22.04"));
        assert_eq!(r.node.mode, Mode::file(0o644));
        // missing `g` falls back to the owner
        assert_eq!(r.node.group, "root");
    }

    #[test]
    fn test_home_file_via_tilde() {
        let vfs = Vfs::from_json(FIXTURE).unwrap();
        let contents = vfs.read_file("~/test.txt", &ctx("test")).unwrap();
        assert_eq!(contents, "This is a test file");
        let contents = vfs.read_file("/home/test/test.txt", &ctx("test")).unwrap();
        assert_eq!(contents, "This is a test file");
    }

    #[test]
    fn test_map_key_wins() {
        let json = r#"{"root":{"t":1,"f":{"real":{"t":2,"n":"fake","c":"x","m":420}}}}"#;
        let vfs = Vfs::from_json(json).unwrap();
        assert_eq!(vfs.stat("/real", &VfsContext::system()).unwrap().name, "real");
        assert!(matches!(
            vfs.stat("/fake", &VfsContext::system()),
            Err(VfsError::NotFound(_))
        ));
        assert_eq!(vfs.home_template(), "/home/{}");
    }

    #[test]
    fn test_directory_without_children() {
        let json = r#"{"root":{"t":1,"f":{"tmp":{"t":1,"m":1023}}},"home":"/root"}"#;
        let vfs = Vfs::from_json(json).unwrap();
        let info = vfs.stat("/tmp", &VfsContext::system()).unwrap();
        assert_eq!(info.kind, FileType::Directory);
        assert!(info.mode.is_dir());
        assert_eq!(vfs.child_count("/tmp"), Some(0));
    }

    #[test]
    fn test_symlink() {
        let json = r#"{"root":{"t":1,"f":{"etc":{"t":1,"m":493,"f":{"os-release":{"t":2,"c":"ID=debian","m":420}}},"os-release":{"t":3,"lt":"etc/os-release"}}}}"#;
        let vfs = Vfs::from_json(json).unwrap();
        let info = vfs.stat("/os-release", &VfsContext::system()).unwrap();
        assert_eq!(info.kind, FileType::Symlink);
        assert_eq!(info.link_target.as_deref(), Some("etc/os-release"));
        assert_eq!(vfs.read_file("/os-release", &VfsContext::system()).unwrap(), "ID=debian");
    }

    #[test]
    fn test_invalid_kind() {
        let json = r#"{"root":{"t":1,"f":{"dev":{"t":9}}}}"#;
        assert!(matches!(
            Vfs::from_json(json),
            Err(SnapshotError::InvalidKind { kind: 9, .. })
        ));
        assert!(matches!(
            Vfs::from_json(r#"{"root":{"t":2}}"#),
            Err(SnapshotError::RootNotDirectory)
        ));
    }

    #[test]
    fn test_load_snapshot_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fs.json");
        std::fs::write(&path, FIXTURE).unwrap();
        let vfs = Vfs::load_snapshot(&path).unwrap();
        assert_eq!(vfs.child_count("/etc"), Some(2));
        assert!(matches!(
            Vfs::load_snapshot(dir.path().join("missing.json")),
            Err(SnapshotError::Io(_))
        ));
    }
}
