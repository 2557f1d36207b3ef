//! wana server library
//!
//! SSH front end, credential capture and interactive shell for the wana
//! honeypot.

pub mod capture;
pub mod config;
pub mod constants;
pub mod shell;
pub mod ssh;

pub use capture::{CaptureDb, CaptureError, CaptureSink, KeyAttempt, PasswordAttempt, Record};
pub use config::{ConfigError, ServerConfig, load_server_config};
pub use shell::{Input, LineEditor, Shell, ShellOutput};
pub use ssh::{SshServer, SshServerConfig, key_attempt, load_host_key};
