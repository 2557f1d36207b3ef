//! Simulated filesystem.
//!
//! One tree shared by every session, guarded by a single `RwLock`. Reads
//! share the lock. Each mutation holds the write lock for its whole
//! check-then-insert step, so a mutation lands completely or not at all and
//! concurrent writers to the same name resolve as last write wins.

mod error;
mod mode;
mod node;
pub mod path;
mod perm;
mod snapshot;

pub use error::{VfsError, VfsResult};
pub use mode::Mode;
pub use node::{FileType, Node, NodeInfo, NodeKind};
pub use perm::{Access, Identity, evaluate};
pub use snapshot::{Snapshot, SnapshotError, SnapshotNode};

use std::sync::Arc;

use chrono::Utc;
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use tracing::debug;

use crate::commands::CommandHandler;

/// Default mode for `create_dir`.
pub const DEFAULT_DIR_MODE: u32 = 0o775;
/// Default mode for files created by `write_file`.
pub const DEFAULT_FILE_MODE: u32 = 0o664;

/// Symlink hops followed when reading through links.
const MAX_LINK_HOPS: usize = 8;

/// Who is asking, and from where.
#[derive(Debug, Clone)]
pub struct VfsContext {
    /// Canonical working directory.
    pub cwd: String,
    /// Login name, used for `~` and the home rewrite.
    pub username: String,
    /// Identity used for permission checks and ownership of new nodes.
    pub identity: Option<Identity>,
}

impl VfsContext {
    pub fn new(cwd: impl Into<String>, username: impl Into<String>, identity: Option<Identity>) -> Self {
        Self {
            cwd: cwd.into(),
            username: username.into(),
            identity,
        }
    }

    /// Root at `/`, for startup work like mounting commands.
    pub fn system() -> Self {
        Self::new("/", "root", Some(Identity::root()))
    }
}

/// A resolved path: the canonical string plus a read view of the node.
///
/// Holds the tree's read lock. Drop it before mutating.
pub struct Resolved<'a> {
    pub path: String,
    pub node: MappedRwLockReadGuard<'a, Node>,
}

/// The tree plus its home template.
pub struct Vfs {
    root: RwLock<Node>,
    home_template: String,
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs")
            .field("home_template", &self.home_template)
            .finish_non_exhaustive()
    }
}

impl Vfs {
    pub fn new(root: Node, home_template: impl Into<String>) -> Self {
        Self {
            root: RwLock::new(root),
            home_template: home_template.into(),
        }
    }

    /// An empty root directory owned by root.
    pub fn empty(home_template: impl Into<String>) -> Self {
        Self::new(
            Node::directory("", "root", "root", Mode::dir(0o755)),
            home_template,
        )
    }

    pub fn home_template(&self) -> &str {
        &self.home_template
    }

    /// Literal home of `username`, e.g. `/home/alice`.
    pub fn home_for(&self, username: &str) -> String {
        path::home_for(&self.home_template, username)
    }

    /// Canonical home shared by every session (the template itself).
    pub fn canonical_home(&self) -> String {
        path::clean(&self.home_template)
    }

    pub fn canonicalize(&self, raw: &str, ctx: &VfsContext) -> String {
        path::canonicalize(raw, &ctx.cwd, &ctx.username, &self.home_template)
    }

    /// Resolve `raw` to its canonical path and node.
    pub fn resolve(&self, raw: &str, ctx: &VfsContext) -> VfsResult<Resolved<'_>> {
        let path = self.canonicalize(raw, ctx);
        let guard = self.root.read();
        guard.descend(&path)?;
        let node = RwLockReadGuard::try_map(guard, |root| root.descend(&path).ok())
            .map_err(|_| VfsError::not_found(&path))?;
        Ok(Resolved { path, node })
    }

    /// Metadata of the node at `raw`.
    pub fn stat(&self, raw: &str, ctx: &VfsContext) -> VfsResult<NodeInfo> {
        let path = self.canonicalize(raw, ctx);
        let root = self.root.read();
        Ok(root.descend(&path)?.info())
    }

    /// Run `f` against the node at `raw` under the read lock.
    pub fn with_node<R>(
        &self,
        raw: &str,
        ctx: &VfsContext,
        f: impl FnOnce(&str, &Node) -> R,
    ) -> VfsResult<R> {
        let path = self.canonicalize(raw, ctx);
        let root = self.root.read();
        let node = root.descend(&path)?;
        Ok(f(&path, node))
    }

    /// Canonical path with every symlink along it expanded.
    pub fn realpath(&self, raw: &str, ctx: &VfsContext) -> VfsResult<String> {
        let path = self.canonicalize(raw, ctx);
        follow_links(&self.root.read(), path)
    }

    /// Contents of a file, following symlinks. Requires read permission.
    pub fn read_file(&self, raw: &str, ctx: &VfsContext) -> VfsResult<String> {
        let root = self.root.read();
        let path = follow_links(&root, self.canonicalize(raw, ctx))?;
        let node = root.descend(&path)?;
        match &node.kind {
            NodeKind::Directory(_) => Err(VfsError::is_a_directory(path)),
            _ if !node.access(ctx.identity.as_ref()).read => Err(VfsError::permission_denied(path)),
            NodeKind::File(contents) => Ok(contents.clone()),
            NodeKind::Executable(_) | NodeKind::Symlink(_) => Ok(String::new()),
        }
    }

    /// Entries of a directory, sorted by name. Requires read permission.
    pub fn read_dir(&self, raw: &str, ctx: &VfsContext) -> VfsResult<Vec<NodeInfo>> {
        let root = self.root.read();
        let path = follow_links(&root, self.canonicalize(raw, ctx))?;
        let node = root.descend(&path)?;
        if !node.is_dir() {
            return Err(VfsError::not_a_directory(path));
        }
        if !node.access(ctx.identity.as_ref()).read {
            return Err(VfsError::permission_denied(path));
        }
        Ok(node.entries().into_iter().map(Node::info).collect())
    }

    /// Create an empty directory. Returns its canonical path.
    #[tracing::instrument(level = "debug", skip(self, mode, ctx), name = "vfs.mkdir")]
    pub fn create_dir(&self, raw: &str, mode: Option<Mode>, ctx: &VfsContext) -> VfsResult<String> {
        let path = self.canonicalize(raw, ctx);
        let (parent_path, name) = path::split_parent(&path);
        if name.is_empty() {
            return Err(VfsError::already_exists(path));
        }
        let who = ctx.identity.as_ref();

        let mut root = self.root.write();
        let parent_path = follow_links(&root, parent_path)?;
        let parent = root.descend_mut(&parent_path)?;
        if !parent.is_dir() {
            return Err(VfsError::not_a_directory(parent_path));
        }
        if !parent.access(who).write {
            return Err(VfsError::permission_denied(path));
        }
        let (owner, group) = owner_of(who);
        let mode = mode.unwrap_or(Mode::dir(DEFAULT_DIR_MODE));
        let children = parent
            .children_mut()
            .ok_or_else(|| VfsError::not_a_directory(&parent_path))?;
        if children.contains_key(&name) {
            return Err(VfsError::already_exists(path));
        }
        children.insert(name.clone(), Node::directory(name, owner, group, mode));
        parent.mod_time = Utc::now();
        debug!(%path, "vfs: mkdir");
        Ok(path)
    }

    /// Replace a file's contents, or create the file. Returns the canonical
    /// path written, which is the link target when `raw` names a symlink.
    #[tracing::instrument(level = "debug", skip(self, contents, ctx), name = "vfs.write")]
    pub fn write_file(&self, raw: &str, contents: &str, ctx: &VfsContext) -> VfsResult<String> {
        let mut root = self.root.write();
        let path = write_target(&root, self.canonicalize(raw, ctx))?;
        store_file(&mut root, &path, ctx.identity.as_ref(), |_| contents.to_string())?;
        debug!(%path, bytes = contents.len(), "vfs: write");
        Ok(path)
    }

    /// Append to a file, creating it when missing. Read and write happen
    /// under one write lock. Returns the canonical path written.
    #[tracing::instrument(level = "debug", skip(self, contents, ctx), name = "vfs.append")]
    pub fn append_file(&self, raw: &str, contents: &str, ctx: &VfsContext) -> VfsResult<String> {
        let mut root = self.root.write();
        let path = write_target(&root, self.canonicalize(raw, ctx))?;
        store_file(&mut root, &path, ctx.identity.as_ref(), |existing| {
            format!("{}{contents}", existing.unwrap_or_default())
        })?;
        debug!(%path, bytes = contents.len(), "vfs: append");
        Ok(path)
    }

    /// Delete the entry at `raw`, with everything below it. Returns its canonical path.
    ///
    /// Mounted commands, and directories holding any, are refused so the
    /// command index never points at a missing node.
    #[tracing::instrument(level = "debug", skip(self, ctx), name = "vfs.remove")]
    pub fn remove(&self, raw: &str, ctx: &VfsContext) -> VfsResult<String> {
        let path = self.canonicalize(raw, ctx);
        let (parent_path, name) = path::split_parent(&path);
        if name.is_empty() {
            return Err(VfsError::permission_denied(path));
        }
        let who = ctx.identity.as_ref();

        let mut root = self.root.write();
        let parent_path = follow_links(&root, parent_path)?;
        let parent = root.descend_mut(&parent_path)?;
        let children = parent
            .children_mut()
            .ok_or_else(|| VfsError::not_a_directory(&parent_path))?;
        let existing = children
            .get(&name)
            .ok_or_else(|| VfsError::not_found(&path))?;
        if !existing.access(who).write || existing.holds_executable() {
            return Err(VfsError::permission_denied(path));
        }
        children.remove(&name);
        parent.mod_time = Utc::now();
        debug!(%path, "vfs: remove");
        Ok(path)
    }

    /// Insert an executable node named `name` into `dir`.
    ///
    /// `dir` resolves as root from `/`. A symlinked `dir` is followed exactly
    /// once, its target taken as absolute. Returns the node's canonical path.
    pub fn mount_executable(
        &self,
        dir: &str,
        name: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> VfsResult<String> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(VfsError::invalid_path(name));
        }
        let ctx = VfsContext::system();
        let mut dir_path = self.canonicalize(dir, &ctx);

        let mut root = self.root.write();
        if let NodeKind::Symlink(target) = &root.descend(&dir_path)?.kind {
            dir_path = path::clean(target);
        }
        let dir_node = root.descend_mut(&dir_path)?;
        let children = dir_node
            .children_mut()
            .ok_or_else(|| VfsError::not_a_directory(&dir_path))?;
        let full = path::join(&dir_path, name);
        if children.contains_key(name) {
            return Err(VfsError::already_exists(full));
        }
        children.insert(name.to_string(), Node::executable(name, handler));
        Ok(full)
    }

    /// Number of children of the directory at `abs`, for tests and diagnostics.
    pub fn child_count(&self, abs: &str) -> Option<usize> {
        let root = self.root.read();
        root.descend(&path::clean(abs))
            .ok()
            .and_then(|n| n.children().map(|c| c.len()))
    }
}

/// Expand symlinks on `abs` until none remain.
fn follow_links(root: &Node, mut abs: String) -> VfsResult<String> {
    for _ in 0..MAX_LINK_HOPS {
        match expand_first_link(root, &abs)? {
            Some(next) => abs = next,
            None => return Ok(abs),
        }
    }
    Err(VfsError::other(format!("{abs}: Too many levels of symbolic links")))
}

/// Replace the first symlink on `abs` with its target. `None` if there is none.
fn expand_first_link(root: &Node, abs: &str) -> VfsResult<Option<String>> {
    let segments: Vec<&str> = path::segments(abs).collect();
    let mut node = root;
    for (idx, segment) in segments.iter().enumerate() {
        node = node
            .children()
            .ok_or_else(|| VfsError::not_a_directory(abs))?
            .get(*segment)
            .ok_or_else(|| VfsError::not_found(abs))?;
        if let NodeKind::Symlink(target) = &node.kind {
            let base = if target.starts_with('/') {
                path::clean(target)
            } else {
                path::join(&format!("/{}", segments[..idx].join("/")), target)
            };
            return Ok(Some(path::join(&base, &segments[idx + 1..].join("/"))));
        }
    }
    Ok(None)
}

/// Where a write to `abs` lands: symlinks on the parent and on the final
/// component are followed. A dangling final link yields its target path.
fn write_target(root: &Node, mut abs: String) -> VfsResult<String> {
    for _ in 0..MAX_LINK_HOPS {
        let (parent, name) = path::split_parent(&abs);
        let parent = follow_links(root, parent)?;
        let full = path::join(&parent, &name);
        match root.descend(&full).ok().and_then(Node::link_target) {
            Some(target) if target.starts_with('/') => abs = path::clean(target),
            Some(target) => abs = path::join(&parent, target),
            None => return Ok(full),
        }
    }
    Err(VfsError::other(format!("{abs}: Too many levels of symbolic links")))
}

/// Write a regular file at the link-free path `abs`. `contents` gets the
/// current contents when the file exists.
fn store_file(
    root: &mut Node,
    abs: &str,
    who: Option<&Identity>,
    contents: impl FnOnce(Option<&str>) -> String,
) -> VfsResult<()> {
    let (parent_path, name) = path::split_parent(abs);
    if name.is_empty() {
        return Err(VfsError::is_a_directory(abs));
    }
    let parent = root.descend_mut(&parent_path)?;
    if !parent.is_dir() {
        return Err(VfsError::not_a_directory(parent_path));
    }
    if !parent.access(who).write {
        return Err(VfsError::permission_denied(abs));
    }
    let (owner, group) = owner_of(who);
    let children = parent
        .children_mut()
        .ok_or_else(|| VfsError::not_a_directory(&parent_path))?;

    if let Some(existing) = children.get_mut(&name) {
        let current = match &existing.kind {
            NodeKind::Directory(_) => return Err(VfsError::is_a_directory(abs)),
            NodeKind::Executable(_) => return Err(VfsError::permission_denied(abs)),
            _ if !existing.access(who).write => return Err(VfsError::permission_denied(abs)),
            NodeKind::File(current) => current.as_str(),
            NodeKind::Symlink(_) => {
                return Err(VfsError::other(format!("{abs}: Too many levels of symbolic links")));
            }
        };
        let next = contents(Some(current));
        existing.kind = NodeKind::File(next);
        existing.mod_time = Utc::now();
    } else {
        let next = contents(None);
        children.insert(
            name.clone(),
            Node::file(name, owner, group, Mode::file(DEFAULT_FILE_MODE), next),
        );
        parent.mod_time = Utc::now();
    }
    Ok(())
}

fn owner_of(who: Option<&Identity>) -> (String, String) {
    match who {
        Some(id) => (id.username.clone(), id.group.clone()),
        None => ("nobody".to_string(), "nogroup".to_string()),
    }
}
