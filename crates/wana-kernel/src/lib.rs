//! # wana-kernel
//!
//! The machine an SSH honeypot pretends to be.
//!
//! - A simulated filesystem loaded from a JSON snapshot, with Unix-style
//!   ownership and permission bits
//! - Commands mounted as executable nodes in that filesystem
//! - Per-connection sessions that dispatch input lines to those commands
//! - Plugins, written in Rhai, that supply commands, password intercepts,
//!   the prompt and the login message
//!
//! Nothing here touches the network; `wana-server` puts sessions on SSH.

pub mod args;
pub mod commands;
pub mod host;
pub mod plugin;
pub mod session;
pub mod vfs;

/// Tracing target for attacker activity. The server routes it to its own log.
pub const AUDIT_TARGET: &str = "wana::audit";

pub use args::{ArgValue, ArgsError, CmdArgs, OptionSpec};
pub use commands::{CommandEntry, CommandHandler, CommandRegistry};
pub use host::{DEFAULT_HOSTNAME, Host, HostBuilder};
pub use plugin::script::{ScriptPlugin, discover};
pub use plugin::{
    Config, LoginMessage, PasswordIntercept, Plugin, PluginError, PluginHooks, PromptProvider,
    default_prompt,
};
pub use session::{Dispatch, STATUS_NOT_EXECUTABLE, STATUS_NOT_FOUND, Session, SessionState};
pub use vfs::{
    Access, FileType, Identity, Mode, Node, NodeInfo, NodeKind, Snapshot, SnapshotError, Vfs,
    VfsContext, VfsError, VfsResult,
};
