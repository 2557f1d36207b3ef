//! Plugin contract.
//!
//! A plugin receives a [`Config`] and fills it with commands and the three
//! session callbacks. How the plugin is written is its own business; the
//! Rhai host in [`script`] is one implementation.

pub mod script;

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::AUDIT_TARGET;
use crate::commands::{CommandHandler, CommandRegistry};
use crate::session::Session;
use crate::vfs::VfsError;

/// Plugin load errors. All fatal at startup.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to read plugin {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("plugin directory {0} has no main.rhai entry point")]
    MissingEntryPoint(PathBuf),

    #[error("plugin {0} does not define install(config)")]
    MissingInstall(String),

    #[error("plugin {plugin}: {message}")]
    Script { plugin: String, message: String },

    #[error("plugin {plugin} failed to register command {command}: {source}")]
    Registration {
        plugin: String,
        command: String,
        #[source]
        source: VfsError,
    },
}

/// Decide whether a password logs the peer in.
pub trait PasswordIntercept: Send + Sync {
    fn intercept(&self, username: &str, password: &str, source_ip: &str) -> anyhow::Result<bool>;
}

impl<F> PasswordIntercept for F
where
    F: Fn(&str, &str, &str) -> anyhow::Result<bool> + Send + Sync,
{
    fn intercept(&self, username: &str, password: &str, source_ip: &str) -> anyhow::Result<bool> {
        self(username, password, source_ip)
    }
}

/// Compute prompt text.
pub trait PromptProvider: Send + Sync {
    fn prompt(&self, session: &Session) -> anyhow::Result<String>;
}

impl<F> PromptProvider for F
where
    F: Fn(&Session) -> anyhow::Result<String> + Send + Sync,
{
    fn prompt(&self, session: &Session) -> anyhow::Result<String> {
        self(session)
    }
}

/// Compute the banner shown after login.
pub trait LoginMessage: Send + Sync {
    fn message(&self, session: &Session) -> anyhow::Result<String>;
}

impl<F> LoginMessage for F
where
    F: Fn(&Session) -> anyhow::Result<String> + Send + Sync,
{
    fn message(&self, session: &Session) -> anyhow::Result<String> {
        self(session)
    }
}

/// A command waiting to be mounted.
pub struct CommandRegistration {
    pub name: String,
    pub mount_dir: String,
    pub handler: Arc<dyn CommandHandler>,
}

/// What one plugin contributes.
pub struct Config {
    plugin: String,
    commands: Vec<CommandRegistration>,
    password_intercepts: Vec<Arc<dyn PasswordIntercept>>,
    prompt: Option<Arc<dyn PromptProvider>>,
    login_message: Option<Arc<dyn LoginMessage>>,
}

impl Config {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            commands: Vec::new(),
            password_intercepts: Vec::new(),
            prompt: None,
            login_message: None,
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn register_command(
        &mut self,
        name: impl Into<String>,
        mount_dir: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) {
        self.commands.push(CommandRegistration {
            name: name.into(),
            mount_dir: mount_dir.into(),
            handler,
        });
    }

    pub fn register_password_intercept(&mut self, intercept: Arc<dyn PasswordIntercept>) {
        self.password_intercepts.push(intercept);
    }

    /// Replaces any prompt set earlier by this plugin.
    pub fn register_prompt(&mut self, prompt: Arc<dyn PromptProvider>) {
        self.prompt = Some(prompt);
    }

    /// Replaces any login message set earlier by this plugin.
    pub fn register_login_message(&mut self, message: Arc<dyn LoginMessage>) {
        self.login_message = Some(message);
    }

    pub fn commands(&self) -> &[CommandRegistration] {
        &self.commands
    }
}

/// A loadable plugin.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn install(&self, config: &mut Config) -> Result<(), PluginError>;
}

/// The callbacks gathered from every installed plugin.
#[derive(Default)]
pub struct PluginHooks {
    password_intercepts: Vec<Arc<dyn PasswordIntercept>>,
    prompt: Option<Arc<dyn PromptProvider>>,
    login_message: Option<Arc<dyn LoginMessage>>,
}

impl PluginHooks {
    /// Mount a plugin's commands and take its callbacks.
    ///
    /// Intercepts accumulate in load order. A later prompt or login message
    /// replaces an earlier one.
    pub fn apply(&mut self, config: Config, registry: &CommandRegistry) -> Result<(), PluginError> {
        let Config {
            plugin,
            commands,
            password_intercepts,
            prompt,
            login_message,
        } = config;

        for command in commands {
            registry
                .register(&command.name, &command.mount_dir, command.handler)
                .map_err(|source| PluginError::Registration {
                    plugin: plugin.clone(),
                    command: command.name.clone(),
                    source,
                })?;
        }

        debug!(
            plugin = %plugin,
            intercepts = password_intercepts.len(),
            prompt = prompt.is_some(),
            login_message = login_message.is_some(),
            "plugin hooks applied"
        );
        self.password_intercepts.extend(password_intercepts);
        if prompt.is_some() {
            self.prompt = prompt;
        }
        if login_message.is_some() {
            self.login_message = login_message;
        }
        Ok(())
    }

    /// Ask every intercept in order; the first `true` lets the peer in.
    pub fn check_password(&self, username: &str, password: &str, source_ip: &str) -> bool {
        for intercept in &self.password_intercepts {
            match intercept.intercept(username, password, source_ip) {
                Ok(true) => {
                    info!(target: AUDIT_TARGET, username, source_ip, "password accepted by plugin");
                    return true;
                }
                Ok(false) => {}
                Err(e) => warn!(username, source_ip, error = %e, "password intercept failed"),
            }
        }
        false
    }

    pub fn has_password_intercepts(&self) -> bool {
        !self.password_intercepts.is_empty()
    }

    /// Prompt from the plugin, or `user@host:cwd$ `.
    pub fn prompt(&self, session: &Session) -> String {
        if let Some(prompt) = &self.prompt {
            match prompt.prompt(session) {
                Ok(text) => return text,
                Err(e) => warn!(session = %session.id(), error = %e, "prompt function failed"),
            }
        }
        default_prompt(session)
    }

    pub fn login_message(&self, session: &Session) -> Option<String> {
        let message = self.login_message.as_ref()?;
        match message.message(session) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(session = %session.id(), error = %e, "login message function failed");
                None
            }
        }
    }
}

/// `alice@host:~$ `, with `#` for root.
pub fn default_prompt(session: &Session) -> String {
    let user = session.username();
    let sigil = if user == "root" { '#' } else { '$' };
    format!("{}@{}:{}{} ", user, session.hostname(), session.prompt_cwd(), sigil)
}
