//! Server configuration constants.
//!
//! Fallbacks for anything the config script or command line leaves unset.

use std::time::Duration;

/// Default SSH port for the honeypot.
pub const DEFAULT_SSH_PORT: u16 = 2222;

/// Default bind address. Honeypots listen on every interface.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Identification string sent before key exchange.
pub const DEFAULT_BANNER: &str = "SSH-2.0-OpenSSH_7.4p1 Raspbian-10+deb9u3";

/// SSH authentication rejection delay (slows down brute forcing).
pub const SSH_AUTH_REJECTION_DELAY: Duration = Duration::from_secs(1);

/// Idle connections are dropped after this long.
pub const SSH_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(600);

/// Largest exec request accepted, in bytes.
pub const MAX_EXEC_BYTES: usize = 4096;

/// Config script used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "assets/defaults/wana.rhai";

pub const DEFAULT_PLUGINS_DIR: &str = "assets/plugins";

pub const DEFAULT_SNAPSHOT: &str = "assets/snapshots/minimal.json";

pub const DEFAULT_DATABASE: &str = "wana.db";

/// Service name reported to OpenTelemetry.
pub const SERVICE_NAME: &str = "wana-server";
