//! wana server binary
//!
//! SSH honeypot with a simulated filesystem and scriptable commands.
//!
//! ## Usage
//!
//! ```bash
//! # Run the honeypot (default)
//! wana-server [--config wana.rhai] [serve --port 2222]
//!
//! # Inspect captured credentials
//! wana-server passwords --limit 50
//! wana-server passwords --top 10
//! wana-server keys --json
//! ```

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{Directive, filter_fn};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use wana_kernel::AUDIT_TARGET;
use wana_server::constants::DEFAULT_CONFIG_PATH;
#[cfg(feature = "telemetry")]
use wana_server::constants::SERVICE_NAME;
use wana_server::{CaptureDb, Record, ServerConfig, SshServer, SshServerConfig, load_host_key};

#[derive(Debug, Parser)]
#[command(name = "wana-server", version, about = "SSH honeypot with a simulated filesystem")]
struct Cli {
    /// Config script (default: assets/defaults/wana.rhai when present)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Capture database
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the SSH server (default)
    Serve(ServeArgs),
    /// List captured password attempts
    Passwords(PasswordsArgs),
    /// List captured public keys
    Keys(ListArgs),
}

#[derive(Debug, Default, Args)]
struct ServeArgs {
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    bind: Option<String>,
    /// SSH identification string
    #[arg(long)]
    banner: Option<String>,
    #[arg(long)]
    host_key: Option<PathBuf>,
    /// Plugin directory
    #[arg(long)]
    plugins: Option<PathBuf>,
    /// Filesystem snapshot (JSON)
    #[arg(long)]
    snapshot: Option<PathBuf>,
    #[arg(long)]
    audit_log: Option<PathBuf>,
    #[arg(long)]
    hostname: Option<String>,
}

impl ServeArgs {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(banner) = self.banner {
            config.banner = banner;
        }
        if let Some(path) = self.host_key {
            config.host_key = Some(path);
        }
        if let Some(path) = self.plugins {
            config.plugins = path;
        }
        if let Some(path) = self.snapshot {
            config.snapshot = path;
        }
        if let Some(path) = self.audit_log {
            config.audit_log = Some(path);
        }
        if let Some(hostname) = self.hostname {
            config.hostname = hostname;
        }
    }
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
    /// One JSON object per line
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct PasswordsArgs {
    #[command(flatten)]
    list: ListArgs,
    /// Most tried usernames instead of individual attempts
    #[arg(long, value_name = "N")]
    top: Option<usize>,
}

/// Held for the life of the process; dropping flushes the log writers.
struct TracingGuards {
    _audit: Option<WorkerGuard>,
    #[cfg(feature = "telemetry")]
    _otel: Option<wana_telemetry::OtelGuard>,
}

fn init_tracing(audit_log: Option<&Path>) -> anyhow::Result<TracingGuards> {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Ok(directive) = format!("{AUDIT_TARGET}=info").parse::<Directive>() {
        filter = filter.add_directive(directive);
    }

    let (audit_layer, audit_guard) = match audit_log {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open audit log {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter_fn(|meta| meta.target() == AUDIT_TARGET));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(audit_layer);

    #[cfg(feature = "telemetry")]
    let otel_guard = if wana_telemetry::otel_enabled() {
        match wana_telemetry::otel_layer(SERVICE_NAME) {
            Ok((otel_layer, guard)) => {
                registry.with(otel_layer).init();
                Some(guard)
            }
            Err(e) => {
                registry.init();
                tracing::warn!(error = %e, "OTel exporter unavailable, tracing locally only");
                None
            }
        }
    } else {
        registry.init();
        None
    };

    #[cfg(not(feature = "telemetry"))]
    registry.init();

    Ok(TracingGuards {
        _audit: audit_guard,
        #[cfg(feature = "telemetry")]
        _otel: otel_guard,
    })
}

fn load_config(cli: &Cli) -> anyhow::Result<ServerConfig> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => ServerConfig::load(DEFAULT_CONFIG_PATH)?,
        None => ServerConfig::default(),
    };
    if let Some(database) = &cli.database {
        config.database = database.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Passwords(args)) => cmd_passwords(&config, &args),
        Some(Command::Keys(args)) => cmd_keys(&config, &args),
        Some(Command::Serve(args)) => {
            args.apply(&mut config);
            run_server(config).await
        }
        None => run_server(config).await,
    }
}

async fn run_server(config: ServerConfig) -> ExitCode {
    let _guards = match init_tracing(config.audit_log.as_deref()) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = serve(config).await {
        error!("Server error: {e:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    if !config.banner.starts_with("SSH-2.0-") {
        anyhow::bail!("banner must start with SSH-2.0-");
    }
    let bind_addr = config.bind_addr()?;

    let host = Arc::new(config.build_host()?);
    info!(
        hostname = %host.hostname(),
        commands = host.registry().len(),
        "host ready"
    );

    let capture = Arc::new(
        CaptureDb::open(&config.database)
            .with_context(|| format!("failed to open {}", config.database.display()))?,
    );
    let host_key = load_host_key(config.host_key.as_deref())?;

    let ssh_config = SshServerConfig {
        bind_addr,
        host_key,
        banner: config.banner.clone(),
        auth_rejection: config.auth_rejection,
    };
    let server = SshServer::new(ssh_config, host, capture);

    tokio::select! {
        result = server.run() => result.context("SSH server failed"),
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}

/// One record per line.
fn print_json<T: Serialize>(rows: &[Record<T>]) -> ExitCode {
    for row in rows {
        match serde_json::to_string(row) {
            Ok(line) => println!("{line}"),
            Err(e) => {
                eprintln!("Failed to encode record {}: {}", row.id, e);
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}

fn open_db(config: &ServerConfig) -> Option<CaptureDb> {
    match CaptureDb::open(&config.database) {
        Ok(db) => Some(db),
        Err(e) => {
            eprintln!("Failed to open capture database: {}", e);
            None
        }
    }
}

/// List captured password attempts
fn cmd_passwords(config: &ServerConfig, args: &PasswordsArgs) -> ExitCode {
    let Some(db) = open_db(config) else {
        return ExitCode::FAILURE;
    };
    if let Some(top) = args.top {
        return cmd_top_usernames(&db, top, args.list.json);
    }
    let args = &args.list;
    let rows = match db.list_passwords(args.limit) {
        Ok(rows) => rows,
        Err(e) => {
            eprintln!("Failed to list passwords: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.json {
        return print_json(&rows);
    }

    if rows.is_empty() {
        println!("No password attempts captured yet.");
        return ExitCode::SUCCESS;
    }

    println!(
        "{:<20} {:<16} {:<16} {}",
        "TIME", "IP", "USER", "PASSWORD"
    );
    println!("{}", "-".repeat(72));
    for row in rows {
        let attempt = &row.attempt;
        println!(
            "{:<20} {:<16} {:<16} {}",
            attempt.created_at.format("%Y-%m-%d %H:%M:%S"),
            attempt.ip_address,
            attempt.username,
            attempt.password
        );
    }
    ExitCode::SUCCESS
}

#[derive(Serialize)]
struct UsernameCount<'a> {
    username: &'a str,
    attempts: i64,
}

fn cmd_top_usernames(db: &CaptureDb, limit: usize, json: bool) -> ExitCode {
    let counts = match db.top_usernames(limit) {
        Ok(counts) => counts,
        Err(e) => {
            eprintln!("Failed to count usernames: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if json {
        for (username, attempts) in &counts {
            let row = UsernameCount { username, attempts: *attempts };
            match serde_json::to_string(&row) {
                Ok(line) => println!("{line}"),
                Err(e) => {
                    eprintln!("Failed to encode {}: {}", username, e);
                    return ExitCode::FAILURE;
                }
            }
        }
        return ExitCode::SUCCESS;
    }

    if counts.is_empty() {
        println!("No password attempts captured yet.");
        return ExitCode::SUCCESS;
    }

    println!("{:<24} {}", "USER", "ATTEMPTS");
    println!("{}", "-".repeat(34));
    for (username, attempts) in counts {
        println!("{:<24} {}", username, attempts);
    }
    ExitCode::SUCCESS
}

/// List captured public keys
fn cmd_keys(config: &ServerConfig, args: &ListArgs) -> ExitCode {
    let Some(db) = open_db(config) else {
        return ExitCode::FAILURE;
    };
    let rows = match db.list_keys(args.limit) {
        Ok(rows) => rows,
        Err(e) => {
            eprintln!("Failed to list keys: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.json {
        return print_json(&rows);
    }

    if rows.is_empty() {
        println!("No keys captured yet.");
        return ExitCode::SUCCESS;
    }

    println!(
        "{:<20} {:<16} {:<12} {:<12} {}",
        "TIME", "IP", "USER", "TYPE", "FINGERPRINT"
    );
    println!("{}", "-".repeat(110));
    for row in rows {
        let attempt = &row.attempt;
        println!(
            "{:<20} {:<16} {:<12} {:<12} {}",
            attempt.created_at.format("%Y-%m-%d %H:%M:%S"),
            attempt.ip_address,
            attempt.username,
            attempt.key_type,
            attempt.key_fingerprint
        );
    }
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passwords_top_flag() {
        let cli = Cli::try_parse_from(["wana-server", "passwords", "--top", "5", "--json"]).unwrap();
        match cli.command {
            Some(Command::Passwords(args)) => {
                assert_eq!(args.top, Some(5));
                assert!(args.list.json);
                assert_eq!(args.list.limit, 20);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_default_is_serve() {
        let cli = Cli::try_parse_from(["wana-server", "--database", "/tmp/x.db"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.database.as_deref(), Some(Path::new("/tmp/x.db")));
    }
}
