//! The VFS tree node.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::{VfsError, VfsResult};
use super::mode::Mode;
use super::path;
use super::perm::{self, Access, Identity};
use crate::commands::CommandHandler;

/// Size reported for directories, as `ls -l` shows on ext4.
const DIR_SIZE: u64 = 4096;

/// What a node holds. Exactly one payload per kind.
pub enum NodeKind {
    Directory(HashMap<String, Node>),
    File(String),
    Symlink(String),
    /// A mounted command. Dispatched, never read as data.
    Executable(Arc<dyn CommandHandler>),
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Directory(children) => f
                .debug_tuple("Directory")
                .field(&children.len())
                .finish(),
            NodeKind::File(contents) => f.debug_tuple("File").field(&contents.len()).finish(),
            NodeKind::Symlink(target) => f.debug_tuple("Symlink").field(target).finish(),
            NodeKind::Executable(_) => f.write_str("Executable"),
        }
    }
}

/// Node type without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Directory,
    File,
    Symlink,
    Executable,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Directory => "directory",
            FileType::File => "file",
            FileType::Symlink => "symlink",
            FileType::Executable => "executable",
        }
    }
}

/// One entry in the tree.
#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub owner: String,
    pub group: String,
    pub mode: Mode,
    pub mod_time: DateTime<Utc>,
    pub nlink: u32,
    pub kind: NodeKind,
}

/// Owned metadata snapshot of a node, safe to hold after the tree lock is released.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub name: String,
    pub kind: FileType,
    pub owner: String,
    pub group: String,
    pub mode: Mode,
    pub size: u64,
    pub nlink: u32,
    pub mod_time: DateTime<Utc>,
    pub link_target: Option<String>,
}

impl Node {
    pub fn directory(
        name: impl Into<String>,
        owner: impl Into<String>,
        group: impl Into<String>,
        mode: Mode,
    ) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            group: group.into(),
            mode: mode.with_dir_flag(),
            mod_time: Utc::now(),
            nlink: 2,
            kind: NodeKind::Directory(HashMap::new()),
        }
    }

    pub fn file(
        name: impl Into<String>,
        owner: impl Into<String>,
        group: impl Into<String>,
        mode: Mode,
        contents: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            group: group.into(),
            mode,
            mod_time: Utc::now(),
            nlink: 1,
            kind: NodeKind::File(contents.into()),
        }
    }

    pub fn symlink(
        name: impl Into<String>,
        owner: impl Into<String>,
        group: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            group: group.into(),
            mode: Mode::symlink(),
            mod_time: Utc::now(),
            nlink: 1,
            kind: NodeKind::Symlink(target.into()),
        }
    }

    /// A mounted command: `rwxr-xr-x root:root`.
    pub fn executable(name: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Self {
        Self {
            name: name.into(),
            owner: "root".into(),
            group: "root".into(),
            mode: Mode::file(0o755),
            mod_time: Utc::now(),
            nlink: 1,
            kind: NodeKind::Executable(handler),
        }
    }

    /// Builder-style child insertion, keyed by the child's name.
    pub fn with_child(mut self, child: Node) -> Self {
        if let Some(children) = self.children_mut() {
            children.insert(child.name.clone(), child);
        }
        self
    }

    pub fn file_type(&self) -> FileType {
        match &self.kind {
            NodeKind::Directory(_) => FileType::Directory,
            NodeKind::File(_) => FileType::File,
            NodeKind::Symlink(_) => FileType::Symlink,
            NodeKind::Executable(_) => FileType::Executable,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(_))
    }

    /// Children map, `None` for anything but a directory.
    pub fn children(&self) -> Option<&HashMap<String, Node>> {
        match &self.kind {
            NodeKind::Directory(children) => Some(children),
            _ => None,
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut HashMap<String, Node>> {
        match &mut self.kind {
            NodeKind::Directory(children) => Some(children),
            _ => None,
        }
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children().and_then(|c| c.get(name))
    }

    /// Children sorted by name.
    pub fn entries(&self) -> Vec<&Node> {
        let mut entries: Vec<&Node> = self
            .children()
            .map(|c| c.values().collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn contents(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::File(contents) => Some(contents),
            _ => None,
        }
    }

    pub fn link_target(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Symlink(target) => Some(target),
            _ => None,
        }
    }

    pub fn handler(&self) -> Option<Arc<dyn CommandHandler>> {
        match &self.kind {
            NodeKind::Executable(handler) => Some(Arc::clone(handler)),
            _ => None,
        }
    }

    /// True for a mounted command or a directory with one anywhere below it.
    pub fn holds_executable(&self) -> bool {
        match &self.kind {
            NodeKind::Executable(_) => true,
            NodeKind::Directory(children) => children.values().any(Node::holds_executable),
            NodeKind::File(_) | NodeKind::Symlink(_) => false,
        }
    }

    pub fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::Directory(_) => DIR_SIZE,
            NodeKind::File(contents) => contents.len() as u64,
            NodeKind::Symlink(target) => target.len() as u64,
            NodeKind::Executable(_) => 0,
        }
    }

    pub fn access(&self, who: Option<&Identity>) -> Access {
        perm::evaluate(self.mode, &self.owner, &self.group, who)
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            name: self.name.clone(),
            kind: self.file_type(),
            owner: self.owner.clone(),
            group: self.group.clone(),
            mode: self.mode,
            size: self.size(),
            nlink: self.nlink,
            mod_time: self.mod_time,
            link_target: self.link_target().map(str::to_string),
        }
    }

    /// Walk a clean absolute path from this node.
    ///
    /// Every segment but the last must land on a directory.
    pub fn descend(&self, abs: &str) -> VfsResult<&Node> {
        let mut node = self;
        for segment in path::segments(abs) {
            let children = node
                .children()
                .ok_or_else(|| VfsError::not_a_directory(abs))?;
            node = children
                .get(segment)
                .ok_or_else(|| VfsError::not_found(abs))?;
        }
        Ok(node)
    }

    pub fn descend_mut(&mut self, abs: &str) -> VfsResult<&mut Node> {
        let mut node = self;
        for segment in path::segments(abs) {
            let children = node
                .children_mut()
                .ok_or_else(|| VfsError::not_a_directory(abs))?;
            node = children
                .get_mut(segment)
                .ok_or_else(|| VfsError::not_found(abs))?;
        }
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Node {
        Node::directory("", "root", "root", Mode::dir(0o755))
            .with_child(
                Node::directory("etc", "root", "root", Mode::dir(0o755)).with_child(Node::file(
                    "issue",
                    "root",
                    "root",
                    Mode::file(0o644),
                    "Ubuntu 22.04",
                )),
            )
            .with_child(Node::symlink("bin", "root", "root", "/usr/bin"))
    }

    #[test]
    fn test_descend() {
        let root = tree();
        let issue = root.descend("/etc/issue").unwrap();
        assert_eq!(issue.contents(), Some("Ubuntu 22.04"));
        assert!(root.descend("/").unwrap().is_dir());
    }

    #[test]
    fn test_descend_errors() {
        let root = tree();
        assert!(matches!(
            root.descend("/etc/missing"),
            Err(VfsError::NotFound(_))
        ));
        assert!(matches!(
            root.descend("/etc/issue/x"),
            Err(VfsError::NotADirectory(_))
        ));
        // symlinks are not followed mid-path
        assert!(matches!(
            root.descend("/bin/ls"),
            Err(VfsError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_entries_sorted() {
        let root = tree();
        let names: Vec<_> = root.entries().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["bin", "etc"]);
        assert!(root.child("etc").unwrap().child("issue").unwrap().entries().is_empty());
    }

    #[test]
    fn test_file_has_no_children() {
        let file = Node::file("f", "root", "root", Mode::file(0o644), "");
        assert!(file.children().is_none());
        let dir = Node::directory("d", "root", "root", Mode::dir(0o755));
        assert_eq!(dir.children().map(|c| c.len()), Some(0));
    }
}
