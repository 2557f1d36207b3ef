//! SSH front end.
//!
//! Every credential is captured, then rejected unless a plugin's password
//! intercept accepts it. Accepted peers get a [`Shell`] per session channel,
//! or a single dispatch for `exec` requests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use russh::keys::PrivateKey;
use russh::keys::ssh_key::{self, HashAlg, LineEnding};
use russh::server::{self, Auth, Msg, Server as _, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodKind, MethodSet};
use tokio::net::TcpListener;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};
use uuid::Uuid;
use wana_kernel::{AUDIT_TARGET, Host};

use crate::capture::{CaptureSink, KeyAttempt, PasswordAttempt};
use crate::constants::{
    DEFAULT_BANNER, MAX_EXEC_BYTES, SSH_AUTH_REJECTION_DELAY, SSH_INACTIVITY_TIMEOUT,
};
use crate::shell::{Shell, to_crlf};

/// SSH server configuration
#[derive(Clone)]
pub struct SshServerConfig {
    pub bind_addr: SocketAddr,
    pub host_key: PrivateKey,
    /// Identification string sent before key exchange.
    pub banner: String,
    pub auth_rejection: Duration,
}

impl SshServerConfig {
    pub fn new(bind_addr: SocketAddr, host_key: PrivateKey) -> Self {
        Self {
            bind_addr,
            host_key,
            banner: DEFAULT_BANNER.to_string(),
            auth_rejection: SSH_AUTH_REJECTION_DELAY,
        }
    }

    /// Create config with an ephemeral key (for testing)
    pub fn ephemeral(port: u16) -> anyhow::Result<Self> {
        Ok(Self::new(
            SocketAddr::from(([127, 0, 0, 1], port)),
            generate_host_key()?,
        ))
    }
}

fn generate_host_key() -> anyhow::Result<PrivateKey> {
    PrivateKey::random(&mut rand::thread_rng(), russh::keys::Algorithm::Ed25519)
        .context("failed to generate host key")
}

/// Load the host key at `path`, creating it on first start.
///
/// With no path a fresh key is generated for this run only, so clients see
/// a new host key after every restart.
pub fn load_host_key(path: Option<&Path>) -> anyhow::Result<PrivateKey> {
    let Some(path) = path else {
        warn!("no host_key configured, using an ephemeral key");
        return generate_host_key();
    };

    if path.exists() {
        let key = russh::keys::load_secret_key(path, None)
            .with_context(|| format!("failed to load host key {}", path.display()))?;
        info!(
            path = %path.display(),
            fingerprint = %key.public_key().fingerprint(HashAlg::Sha256),
            "loaded host key"
        );
        return Ok(key);
    }

    let key = generate_host_key()?;
    let pem = key
        .to_openssh(LineEnding::LF)
        .context("failed to encode host key")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    write_private(path, pem.as_bytes())
        .with_context(|| format!("failed to write host key {}", path.display()))?;
    info!(
        path = %path.display(),
        fingerprint = %key.public_key().fingerprint(HashAlg::Sha256),
        "generated host key"
    );
    Ok(key)
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

/// Capture record for an offered public key.
pub fn key_attempt(ip: &str, username: &str, key: &ssh_key::PublicKey) -> KeyAttempt {
    KeyAttempt {
        ip_address: ip.to_string(),
        username: username.to_string(),
        key: key.to_openssh().unwrap_or_default(),
        key_fingerprint: key.fingerprint(HashAlg::Sha256).to_string(),
        key_type: key.algorithm().as_str().to_string(),
        created_at: chrono::Utc::now(),
    }
}

/// SSH server
pub struct SshServer {
    config: SshServerConfig,
    host: Arc<Host>,
    capture: Arc<dyn CaptureSink>,
}

impl SshServer {
    pub fn new(config: SshServerConfig, host: Arc<Host>, capture: Arc<dyn CaptureSink>) -> Self {
        Self {
            config,
            host,
            capture,
        }
    }

    /// Run the SSH server
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let socket = TcpListener::bind(self.config.bind_addr).await?;
        self.run_on(socket).await
    }

    /// Serve on an already bound listener.
    pub async fn run_on(&self, socket: TcpListener) -> Result<(), std::io::Error> {
        let config = server::Config {
            server_id: russh::SshId::Standard(self.config.banner.clone()),
            methods: MethodSet::from([MethodKind::Password, MethodKind::PublicKey].as_slice()),
            auth_rejection_time: self.config.auth_rejection,
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            inactivity_timeout: Some(SSH_INACTIVITY_TIMEOUT),
            keys: vec![self.config.host_key.clone()],
            ..Default::default()
        };

        info!(
            addr = %socket.local_addr()?,
            banner = %self.config.banner,
            commands = self.host.registry().len(),
            "SSH server listening"
        );

        let mut server = Server {
            host: self.host.clone(),
            capture: self.capture.clone(),
        };
        server
            .run_on_socket(Arc::new(config), &socket)
            .await
            .map_err(std::io::Error::other)
    }
}

/// Server factory - creates handlers for each connection
struct Server {
    host: Arc<Host>,
    capture: Arc<dyn CaptureSink>,
}

impl server::Server for Server {
    type Handler = ConnectionHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        ConnectionHandler::new(self.host.clone(), self.capture.clone(), peer_addr)
    }

    fn handle_session_error(&mut self, error: <Self::Handler as server::Handler>::Error) {
        debug!(error = %error, "SSH session error");
    }
}

/// Handler for a single SSH connection
struct ConnectionHandler {
    conn_id: Uuid,
    ip: String,
    host: Arc<Host>,
    capture: Arc<dyn CaptureSink>,
    /// Set once a password was accepted.
    username: Option<String>,
    channels: HashMap<ChannelId, ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    pty: bool,
    shell: Option<Shell>,
    span: Option<Span>,
}

impl ConnectionHandler {
    fn new(host: Arc<Host>, capture: Arc<dyn CaptureSink>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            ip: peer_addr.map(|a| a.ip().to_string()).unwrap_or_default(),
            host,
            capture,
            username: None,
            channels: HashMap::new(),
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(
                [MethodKind::Password, MethodKind::PublicKey].as_slice(),
            )),
            partial_success: false,
        }
    }

    /// Record the attempt, then ask the password intercepts.
    async fn check_password(&self, user: &str, password: &str) -> bool {
        let attempt = PasswordAttempt::new(&self.ip, user, password);
        let capture = self.capture.clone();
        let host = self.host.clone();
        let result = tokio::task::spawn_blocking(move || {
            if let Err(e) = capture.record_password(&attempt) {
                error!(error = %e, "failed to record password attempt");
            }
            host.hooks()
                .check_password(&attempt.username, &attempt.password, &attempt.ip_address)
        })
        .await;

        result.unwrap_or_else(|e| {
            error!(error = %e, "password check task failed");
            false
        })
    }

    async fn record_key(&self, attempt: KeyAttempt) {
        let capture = self.capture.clone();
        let result = tokio::task::spawn_blocking(move || capture.record_key(&attempt)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "failed to record key attempt"),
            Err(e) => error!(error = %e, "key capture task failed"),
        }
    }

    fn new_shell(&self, pty: bool) -> Option<Shell> {
        let username = self.username.as_deref()?;
        let session = wana_kernel::Session::new(self.host.clone(), username, self.ip.clone());
        Some(Shell::new(session, pty))
    }

    fn send(session: &mut Session, channel: ChannelId, text: &str) {
        if !text.is_empty() {
            let _ = session.data(channel, CryptoVec::from_slice(text.as_bytes()));
        }
    }

    fn finish(session: &mut Session, channel: ChannelId) {
        let _ = session.exit_status_request(channel, 0);
        let _ = session.eof(channel);
        let _ = session.close(channel);
    }
}

impl server::Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        info!(
            target: AUDIT_TARGET,
            conn = %self.conn_id,
            ip = %self.ip,
            user,
            "connection"
        );
        Ok(Self::reject())
    }

    #[tracing::instrument(skip(self, password), name = "ssh.auth.password", fields(conn = %self.conn_id, ip = %self.ip))]
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let accepted = self.check_password(user, password).await;
        info!(
            target: AUDIT_TARGET,
            conn = %self.conn_id,
            ip = %self.ip,
            user,
            password,
            accepted,
            "password attempt"
        );
        if accepted {
            self.username = Some(user.to_string());
            Ok(Auth::Accept)
        } else {
            Ok(Self::reject())
        }
    }

    #[tracing::instrument(skip(self, public_key), name = "ssh.auth.publickey", fields(conn = %self.conn_id, ip = %self.ip))]
    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &ssh_key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        let attempt = key_attempt(&self.ip, user, public_key);
        info!(
            target: AUDIT_TARGET,
            conn = %self.conn_id,
            ip = %self.ip,
            user,
            fingerprint = %attempt.key_fingerprint,
            key_type = %attempt.key_type,
            "public key offered"
        );
        self.record_key(attempt).await;
        Ok(Self::reject())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.username.is_none() {
            return Ok(false);
        }
        debug!(conn = %self.conn_id, channel = %channel.id(), "session channel opened");
        self.channels.insert(channel.id(), ChannelState::default());
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(conn = %self.conn_id, term, col_width, row_height, "pty requested");
        if let Some(state) = self.channels.get_mut(&channel) {
            state.pty = true;
        }
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let pty = self.channels.get(&channel).is_some_and(|s| s.pty);
        let Some(shell) = self.new_shell(pty) else {
            let _ = session.channel_failure(channel);
            return Ok(());
        };

        let span = info_span!(
            "shell.session",
            conn = %self.conn_id,
            session = %shell.session().id(),
            ip = %self.ip,
            user = %shell.session().login_name(),
        );
        info!(
            target: AUDIT_TARGET,
            conn = %self.conn_id,
            session = %shell.session().id(),
            ip = %self.ip,
            user = %shell.session().login_name(),
            "shell started"
        );

        let _ = session.channel_success(channel);
        let greeting = shell.greeting().instrument(span.clone()).await;
        Self::send(session, channel, &greeting);

        let state = self.channels.entry(channel).or_default();
        state.shell = Some(shell);
        state.span = Some(span);
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(state) = self.channels.get_mut(&channel) else {
            return Ok(());
        };
        let span = state.span.clone().unwrap_or_else(Span::none);
        let Some(shell) = state.shell.as_mut() else {
            return Ok(());
        };

        let output = shell.feed(data).instrument(span).await;
        Self::send(session, channel, &output.text);
        if output.close {
            info!(
                target: AUDIT_TARGET,
                conn = %self.conn_id,
                session = %shell.session().id(),
                ip = %self.ip,
                "shell closed"
            );
            self.channels.remove(&channel);
            Self::finish(session, channel);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, data, session), name = "ssh.exec", fields(conn = %self.conn_id, ip = %self.ip))]
    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if data.len() > MAX_EXEC_BYTES {
            warn!(len = data.len(), "exec request too large");
            let _ = session.channel_failure(channel);
            return Ok(());
        }
        let pty = self.channels.get(&channel).is_some_and(|s| s.pty);
        let Some(shell) = self.new_shell(pty) else {
            let _ = session.channel_failure(channel);
            return Ok(());
        };
        let _ = session.channel_success(channel);

        let command = String::from_utf8_lossy(data).to_string();
        let sess = shell.session().clone();
        let output = tokio::task::spawn_blocking(move || {
            sess.dispatch(&command);
            sess.take_output()
        })
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "exec task failed");
            String::new()
        });

        let output = if pty { to_crlf(&output) } else { output };
        Self::send(session, channel, &output);
        self.channels.remove(&channel);
        Self::finish(session, channel);
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.channels.remove(&channel).is_some() {
            Self::finish(session, channel);
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(conn = %self.conn_id, channel = %channel, "channel closed");
        self.channels.remove(&channel);
        Ok(())
    }
}
