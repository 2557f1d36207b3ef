//! Rhai-driven server configuration.
//!
//! The config script is ordinary Rhai; top-level `let` bindings are read back
//! out of the scope after it runs:
//!
//! ```rhai
//! let port = 2222;
//! let hostname = "raspberrypi";
//! let host_key = "~/.local/share/wana/host_ed25519";
//! ```
//!
//! Unset keys fall back to [`crate::constants`].

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use thiserror::Error;
use wana_kernel::{DEFAULT_HOSTNAME, Host, Vfs, discover};

use crate::constants::{
    DEFAULT_BANNER, DEFAULT_BIND_ADDRESS, DEFAULT_DATABASE, DEFAULT_PLUGINS_DIR, DEFAULT_SNAPSHOT,
    DEFAULT_SSH_PORT, SSH_AUTH_REJECTION_DELAY,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error: {0}")]
    Parse(String),

    #[error("config evaluation error: {0}")]
    Eval(String),

    #[error("invalid value for `{key}`: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Everything the server needs to start.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// SSH identification string, e.g. `SSH-2.0-OpenSSH_7.4p1`.
    pub banner: String,
    pub hostname: String,
    /// OpenSSH private key. Generated on first start if missing; `None` means
    /// a fresh key every run.
    pub host_key: Option<PathBuf>,
    pub plugins: PathBuf,
    pub snapshot: PathBuf,
    pub database: PathBuf,
    /// File for the audit log. `None` keeps audit events on stderr only.
    pub audit_log: Option<PathBuf>,
    pub auth_rejection: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_SSH_PORT,
            banner: DEFAULT_BANNER.to_string(),
            hostname: DEFAULT_HOSTNAME.to_string(),
            host_key: None,
            plugins: PathBuf::from(DEFAULT_PLUGINS_DIR),
            snapshot: PathBuf::from(DEFAULT_SNAPSHOT),
            database: PathBuf::from(DEFAULT_DATABASE),
            audit_log: None,
            auth_rejection: SSH_AUTH_REJECTION_DELAY,
        }
    }
}

impl ServerConfig {
    /// Evaluate a config script file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let script = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loading server config");
        load_server_config(&script)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                key: "bind_address",
                message: e.to_string(),
            })
    }

    /// Load the snapshot and every plugin into a ready [`Host`].
    ///
    /// Any plugin failure aborts startup; a partially installed command set
    /// is never served.
    pub fn build_host(&self) -> anyhow::Result<Host> {
        let vfs = Vfs::load_snapshot(&self.snapshot)
            .with_context(|| format!("failed to load snapshot {}", self.snapshot.display()))?;
        let plugins = discover(&self.plugins)
            .with_context(|| format!("failed to load plugins from {}", self.plugins.display()))?;
        let host = Host::builder(Arc::new(vfs))
            .hostname(self.hostname.clone())
            .plugins(plugins)
            .build()
            .context("failed to install plugins")?;
        Ok(host)
    }
}

/// Parse a config script and extract settings.
pub fn load_server_config(script: &str) -> Result<ServerConfig, ConfigError> {
    let engine = rhai::Engine::new();
    let ast = engine
        .compile(script)
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let mut scope = rhai::Scope::new();
    engine
        .run_ast_with_scope(&mut scope, &ast)
        .map_err(|e| ConfigError::Eval(e.to_string()))?;

    let defaults = ServerConfig::default();

    let port = match scope.get_value::<i64>("port") {
        Some(port) => u16::try_from(port).map_err(|_| ConfigError::Invalid {
            key: "port",
            message: format!("{port} is not a TCP port"),
        })?,
        None => defaults.port,
    };

    let auth_rejection = match scope.get_value::<i64>("auth_rejection_ms") {
        Some(ms) => Duration::from_millis(u64::try_from(ms).map_err(|_| ConfigError::Invalid {
            key: "auth_rejection_ms",
            message: format!("{ms} is negative"),
        })?),
        None => defaults.auth_rejection,
    };

    let banner = get_string(&scope, "banner").unwrap_or(defaults.banner);
    if !banner.starts_with("SSH-2.0-") {
        return Err(ConfigError::Invalid {
            key: "banner",
            message: "must start with SSH-2.0-".into(),
        });
    }

    Ok(ServerConfig {
        bind_address: get_string(&scope, "bind_address").unwrap_or(defaults.bind_address),
        port,
        banner,
        hostname: get_string(&scope, "hostname").unwrap_or(defaults.hostname),
        host_key: get_path(&scope, "host_key"),
        plugins: get_path(&scope, "plugins").unwrap_or(defaults.plugins),
        snapshot: get_path(&scope, "snapshot").unwrap_or(defaults.snapshot),
        database: get_path(&scope, "database").unwrap_or(defaults.database),
        audit_log: get_path(&scope, "audit_log"),
        auth_rejection,
    })
}

fn get_string(scope: &rhai::Scope, key: &str) -> Option<String> {
    scope
        .get_value::<rhai::ImmutableString>(key)
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}

/// A path setting, with `~` and `$VARS` expanded.
pub(crate) fn get_path(scope: &rhai::Scope, key: &str) -> Option<PathBuf> {
    get_string(scope, key).map(|s| expand_path(&s))
}

pub fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(raw).as_ref()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_script_uses_defaults() {
        let config = load_server_config("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.bind_addr().unwrap().port(), 2222);
    }

    #[test]
    fn test_bundled_defaults() {
        let config = load_server_config(include_str!("../../../assets/defaults/wana.rhai")).unwrap();
        assert_eq!(config.port, 2222);
        assert_eq!(config.hostname, "raspberrypi");
        assert_eq!(config.banner, DEFAULT_BANNER);
        assert_eq!(config.plugins, PathBuf::from("assets/plugins"));
        assert!(config.audit_log.is_some());
    }

    #[test]
    fn test_values_read_from_scope() {
        let config = load_server_config(
            r#"
            let port = 22;
            let bind_address = "127.0.0.1";
            let banner = "SSH-2.0-OpenSSH_8.2p1 Ubuntu-4ubuntu0.5";
            let hostname = "db" + "-prod-" + 3;
            let database = "/var/lib/wana/capture.db";
            let auth_rejection_ms = 250;
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.hostname, "db-prod-3");
        assert_eq!(config.database, PathBuf::from("/var/lib/wana/capture.db"));
        assert_eq!(config.auth_rejection, Duration::from_millis(250));
        assert_eq!(config.bind_addr().unwrap().to_string(), "127.0.0.1:22");
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            load_server_config("let port = 70000;"),
            Err(ConfigError::Invalid { key: "port", .. })
        ));
        assert!(matches!(
            load_server_config(r#"let banner = "hello";"#),
            Err(ConfigError::Invalid { key: "banner", .. })
        ));
        assert!(matches!(load_server_config("let = ;"), Err(ConfigError::Parse(_))));
        assert!(matches!(
            load_server_config(r#"throw "nope";"#),
            Err(ConfigError::Eval(_))
        ));
    }

    #[test]
    fn test_tilde_expansion() {
        let config = load_server_config(r#"let host_key = "~/wana/host_key";"#).unwrap();
        let key = config.host_key.unwrap();
        assert!(!key.to_string_lossy().starts_with('~'));
        assert!(key.ends_with("wana/host_key"));
    }
}
