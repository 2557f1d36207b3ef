//! The impersonated machine: tree, commands, plugin hooks and hostname.
//!
//! Built once at startup and shared by every session.

use std::sync::Arc;

use tracing::info;

use crate::commands::CommandRegistry;
use crate::plugin::{Config, Plugin, PluginError, PluginHooks};
use crate::vfs::Vfs;

/// Hostname used when none is configured.
pub const DEFAULT_HOSTNAME: &str = "localhost";

pub struct Host {
    vfs: Arc<Vfs>,
    registry: Arc<CommandRegistry>,
    hooks: PluginHooks,
    hostname: String,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("hostname", &self.hostname)
            .field("commands", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Host {
    pub fn builder(vfs: Arc<Vfs>) -> HostBuilder {
        HostBuilder {
            vfs,
            hostname: DEFAULT_HOSTNAME.to_string(),
            sources: Vec::new(),
        }
    }

    pub fn vfs(&self) -> &Arc<Vfs> {
        &self.vfs
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn hooks(&self) -> &PluginHooks {
        &self.hooks
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

enum Source {
    Plugin(Box<dyn Plugin>),
    Config(Config),
}

/// Collects plugins, then installs them in the order given.
pub struct HostBuilder {
    vfs: Arc<Vfs>,
    hostname: String,
    sources: Vec<Source>,
}

impl HostBuilder {
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn plugin(mut self, plugin: Box<dyn Plugin>) -> Self {
        self.sources.push(Source::Plugin(plugin));
        self
    }

    pub fn plugins(mut self, plugins: impl IntoIterator<Item = Box<dyn Plugin>>) -> Self {
        self.sources.extend(plugins.into_iter().map(Source::Plugin));
        self
    }

    /// An already filled config, for commands written in Rust.
    pub fn config(mut self, config: Config) -> Self {
        self.sources.push(Source::Config(config));
        self
    }

    /// Install everything. Any plugin failure aborts the build.
    pub fn build(self) -> Result<Host, PluginError> {
        let registry = Arc::new(CommandRegistry::new(Arc::clone(&self.vfs)));
        let mut hooks = PluginHooks::default();

        for source in self.sources {
            let config = match source {
                Source::Plugin(plugin) => {
                    let mut config = Config::new(plugin.name());
                    plugin.install(&mut config)?;
                    config
                }
                Source::Config(config) => config,
            };
            let plugin = config.plugin().to_string();
            let commands = config.commands().len();
            hooks.apply(config, &registry)?;
            info!(plugin = %plugin, commands, "plugin installed");
        }

        Ok(Host {
            vfs: self.vfs,
            registry,
            hooks,
            hostname: self.hostname,
        })
    }
}
