//! Command registry.
//!
//! Commands are mounted as executable nodes in the VFS and indexed by bare
//! name and by path. The VFS insert happens first; a name already taken in
//! the mount directory fails before either index is touched.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::args::CmdArgs;
use crate::session::Session;
use crate::vfs::{Vfs, VfsContext, VfsResult, path};

/// A command implementation.
///
/// Handlers write to the session's output and may mutate the VFS through it.
/// Errors are logged by the dispatcher and never shown to the peer.
pub trait CommandHandler: Send + Sync {
    fn call(&self, args: &CmdArgs, session: &Session) -> anyhow::Result<()>;
}

impl<F> CommandHandler for F
where
    F: Fn(&CmdArgs, &Session) -> anyhow::Result<()> + Send + Sync,
{
    fn call(&self, args: &CmdArgs, session: &Session) -> anyhow::Result<()> {
        self(args, session)
    }
}

/// A registered command as seen by completion and `help`.
#[derive(Clone)]
pub struct CommandEntry {
    pub name: String,
    pub path: String,
    pub handler: Arc<dyn CommandHandler>,
}

impl std::fmt::Debug for CommandEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandEntry")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Flat dispatch index over the commands mounted in one VFS.
pub struct CommandRegistry {
    vfs: Arc<Vfs>,
    by_name: DashMap<String, CommandEntry>,
    by_path: DashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new(vfs: Arc<Vfs>) -> Self {
        Self {
            vfs,
            by_name: DashMap::new(),
            by_path: DashMap::new(),
        }
    }

    pub fn vfs(&self) -> &Arc<Vfs> {
        &self.vfs
    }

    /// Mount `handler` as `mount_dir/name`.
    ///
    /// Fails with `AlreadyExists` if the directory already holds `name`.
    /// On success the bare name points at this handler (last writer wins
    /// across mount directories) and both the requested and the resolved
    /// path are indexed. Returns the resolved path.
    pub fn register(
        &self,
        name: &str,
        mount_dir: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> VfsResult<String> {
        let resolved = self
            .vfs
            .mount_executable(mount_dir, name, Arc::clone(&handler))?;

        let requested = path::join(
            &self.vfs.canonicalize(mount_dir, &VfsContext::system()),
            name,
        );
        if requested != resolved {
            self.by_path.insert(requested, Arc::clone(&handler));
        }
        self.by_path.insert(resolved.clone(), Arc::clone(&handler));

        if let Some(previous) = self.by_name.insert(
            name.to_string(),
            CommandEntry {
                name: name.to_string(),
                path: resolved.clone(),
                handler,
            },
        ) {
            debug!(name, previous = %previous.path, now = %resolved, "command shadowed");
        }
        debug!(name, path = %resolved, "command registered");
        Ok(resolved)
    }

    /// Handler for a bare command name.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.by_name.get(name).map(|e| Arc::clone(&e.handler))
    }

    /// Handler indexed under a canonical path.
    pub fn lookup_path(&self, path: &str) -> Option<Arc<dyn CommandHandler>> {
        self.by_path.get(path).map(|h| Arc::clone(h.value()))
    }

    /// Where a bare name is mounted, like `which`.
    pub fn path_of(&self, name: &str) -> Option<String> {
        self.by_name.get(name).map(|e| e.path.clone())
    }

    /// Every command whose name starts with `partial`, sorted by name.
    pub fn match_prefix(&self, partial: &str) -> Vec<CommandEntry> {
        let mut matches: Vec<CommandEntry> = self
            .by_name
            .iter()
            .filter(|e| e.key().starts_with(partial))
            .map(|e| e.value().clone())
            .collect();
        matches.sort_by(|a, b| a.name.cmp(&b.name));
        matches
    }

    /// All bare names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
