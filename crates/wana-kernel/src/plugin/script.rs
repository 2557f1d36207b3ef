//! Rhai plugin host.
//!
//! Each plugin is a directory holding a `main.rhai` that defines
//! `fn install(config)`. The directory is the module search path, so
//! `import "helpers" as h;` loads `helpers.rhai` next to it.
//!
//! ```rhai
//! fn install(config) {
//!     config.register_command("uname", "/bin", |args, session| {
//!         session.writeln(if args.has("a") { "Linux web01 5.15.0 x86_64" } else { "Linux" });
//!     });
//!     config.register_password_intercept(|user, pass, ip| user == "root" && pass == "123456");
//!     config.register_prompt(|session| `${session.username()}@${session.hostname()}:${session.pwd()}$ `);
//! }
//! ```
//!
//! One engine and AST per plugin, shared by every session. The engine's
//! operation limit applies to each call, which bounds how long a single
//! command can run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use chrono::format::{Item, StrftimeItems};
use parking_lot::Mutex;
use rhai::module_resolvers::FileModuleResolver;
use rhai::{AST, Array, Dynamic, Engine, EvalAltResult, FnPtr, FuncArgs, ImmutableString, Map, Scope};
use tracing::{debug, debug_span, error, info, warn};

use super::{Config, LoginMessage, PasswordIntercept, Plugin, PluginError, PromptProvider};
use crate::args::CmdArgs;
use crate::commands::CommandHandler;
use crate::session::Session;
use crate::vfs::{Identity, Mode, NodeInfo, VfsError};

/// File every plugin directory must contain.
pub const ENTRY_POINT: &str = "main.rhai";

/// Function the entry point must define.
const INSTALL_FN: &str = "install";

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

fn throw(err: VfsError) -> Box<EvalAltResult> {
    err.shell_message().into()
}

/// Load every plugin under `dir`, one per sub-directory, in name order.
pub fn discover(dir: &Path) -> Result<Vec<Box<dyn Plugin>>, PluginError> {
    let io_err = |source| PluginError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if entry.file_type().map_err(io_err)?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();

    dirs.iter()
        .map(|d| ScriptPlugin::open(d).map(|p| Box::new(p) as Box<dyn Plugin>))
        .collect()
}

/// A plugin directory with a Rhai entry point.
#[derive(Debug, Clone)]
pub struct ScriptPlugin {
    name: String,
    dir: PathBuf,
    entry: PathBuf,
}

impl ScriptPlugin {
    /// Open a plugin directory. A missing entry point is an error.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PluginError> {
        let dir = dir.as_ref();
        let entry = dir.join(ENTRY_POINT);
        if !entry.is_file() {
            return Err(PluginError::MissingEntryPoint(dir.to_path_buf()));
        }
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string());
        Ok(Self {
            name,
            dir: dir.to_path_buf(),
            entry,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn script_err(&self, e: impl std::fmt::Display) -> PluginError {
        PluginError::Script {
            plugin: self.name.clone(),
            message: e.to_string(),
        }
    }
}

impl Plugin for ScriptPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn install(&self, config: &mut Config) -> Result<(), PluginError> {
        let _span = debug_span!("plugin.install", plugin = %self.name).entered();

        let source = std::fs::read_to_string(&self.entry).map_err(|source| PluginError::Io {
            path: self.entry.clone(),
            source,
        })?;
        let engine = create_engine(&self.name, &self.dir);
        let mut ast = engine.compile(&source).map_err(|e| self.script_err(e))?;
        ast.set_source(self.entry.display().to_string());

        let has_install = ast
            .iter_functions()
            .any(|f| f.name == INSTALL_FN && f.params.len() == 1);
        if !has_install {
            return Err(PluginError::MissingInstall(self.name.clone()));
        }

        let collector = ScriptConfig::default();
        let mut scope = Scope::new();
        engine
            .call_fn::<Dynamic>(&mut scope, &ast, INSTALL_FN, (collector.clone(),))
            .map_err(|e| self.script_err(e))?;

        let runtime = Arc::new(ScriptRuntime {
            plugin: self.name.clone(),
            engine,
            ast,
        });
        collector.drain_into(&runtime, config);
        debug!(plugin = %self.name, commands = config.commands().len(), "Rhai: install() done");
        Ok(())
    }
}

/// Engine plus compiled plugin, shared by all handlers of one plugin.
struct ScriptRuntime {
    plugin: String,
    engine: Engine,
    ast: AST,
}

impl ScriptRuntime {
    fn call<T: Clone + Send + Sync + 'static>(&self, func: &FnPtr, args: impl FuncArgs) -> anyhow::Result<T> {
        func.call::<T>(&self.engine, &self.ast, args)
            .map_err(|e| anyhow!("plugin {}: {}", self.plugin, e))
    }
}

struct ScriptCommand {
    name: String,
    runtime: Arc<ScriptRuntime>,
    func: FnPtr,
}

impl CommandHandler for ScriptCommand {
    fn call(&self, args: &CmdArgs, session: &Session) -> anyhow::Result<()> {
        let _span = debug_span!(
            "plugin.command",
            plugin = %self.runtime.plugin,
            command = %self.name,
            session = %session.id()
        )
        .entered();
        self.runtime.call::<Dynamic>(
            &self.func,
            (ScriptArgs(args.clone()), ScriptSession(session.clone())),
        )?;
        Ok(())
    }
}

struct ScriptIntercept {
    runtime: Arc<ScriptRuntime>,
    func: FnPtr,
}

impl PasswordIntercept for ScriptIntercept {
    fn intercept(&self, username: &str, password: &str, source_ip: &str) -> anyhow::Result<bool> {
        self.runtime.call::<bool>(
            &self.func,
            (username.to_string(), password.to_string(), source_ip.to_string()),
        )
    }
}

struct ScriptPrompt {
    runtime: Arc<ScriptRuntime>,
    func: FnPtr,
}

impl PromptProvider for ScriptPrompt {
    fn prompt(&self, session: &Session) -> anyhow::Result<String> {
        self.runtime
            .call::<ImmutableString>(&self.func, (ScriptSession(session.clone()),))
            .map(|s| s.to_string())
    }
}

impl LoginMessage for ScriptPrompt {
    fn message(&self, session: &Session) -> anyhow::Result<String> {
        self.prompt(session)
    }
}

#[derive(Default)]
struct Collected {
    commands: Vec<(String, String, FnPtr)>,
    intercepts: Vec<FnPtr>,
    prompt: Option<FnPtr>,
    login_message: Option<FnPtr>,
}

/// The `config` object handed to `install`.
#[derive(Clone, Default)]
struct ScriptConfig(Arc<Mutex<Collected>>);

impl ScriptConfig {
    fn drain_into(&self, runtime: &Arc<ScriptRuntime>, config: &mut Config) {
        let collected = std::mem::take(&mut *self.0.lock());
        for (name, dir, func) in collected.commands {
            let handler = ScriptCommand {
                name: name.clone(),
                runtime: Arc::clone(runtime),
                func,
            };
            config.register_command(name, dir, Arc::new(handler));
        }
        for func in collected.intercepts {
            config.register_password_intercept(Arc::new(ScriptIntercept {
                runtime: Arc::clone(runtime),
                func,
            }));
        }
        if let Some(func) = collected.prompt {
            config.register_prompt(Arc::new(ScriptPrompt {
                runtime: Arc::clone(runtime),
                func,
            }));
        }
        if let Some(func) = collected.login_message {
            config.register_login_message(Arc::new(ScriptPrompt {
                runtime: Arc::clone(runtime),
                func,
            }));
        }
    }
}

/// `session` as scripts see it.
#[derive(Clone)]
struct ScriptSession(Session);

/// `args` as scripts see it.
#[derive(Clone)]
struct ScriptArgs(CmdArgs);

/// Create a configured engine with all functions registered.
fn create_engine(plugin: &str, dir: &Path) -> Engine {
    let mut engine = Engine::new();

    // Configure safety limits
    engine.set_max_expr_depths(64, 64);
    engine.set_max_operations(100_000);
    engine.set_max_call_levels(32);
    engine.set_max_modules(10);
    engine.set_max_string_size(1_000_000);
    engine.set_max_array_size(10_000);
    engine.set_max_map_size(10_000);

    engine.set_module_resolver(FileModuleResolver::new_with_path(dir));

    register_config_functions(&mut engine);
    register_session_functions(&mut engine);
    register_args_functions(&mut engine);
    register_utility_functions(&mut engine, plugin, dir);

    engine
}

fn register_config_functions(engine: &mut Engine) {
    engine.register_type_with_name::<ScriptConfig>("Config");

    engine.register_fn(
        "register_command",
        |config: &mut ScriptConfig, name: String, dir: String, func: FnPtr| {
            config.0.lock().commands.push((name, dir, func));
        },
    );
    engine.register_fn(
        "register_password_intercept",
        |config: &mut ScriptConfig, func: FnPtr| {
            config.0.lock().intercepts.push(func);
        },
    );
    engine.register_fn("register_prompt", |config: &mut ScriptConfig, func: FnPtr| {
        config.0.lock().prompt = Some(func);
    });
    engine.register_fn(
        "register_login_message",
        |config: &mut ScriptConfig, func: FnPtr| {
            config.0.lock().login_message = Some(func);
        },
    );
}

fn info_to_map(info: &NodeInfo) -> Map {
    let mut map = Map::new();
    map.insert("name".into(), info.name.clone().into());
    map.insert("kind".into(), info.kind.as_str().into());
    map.insert("mode".into(), Dynamic::from(i64::from(info.mode.bits())));
    map.insert("perm".into(), Dynamic::from(i64::from(info.mode.perm())));
    map.insert("mode_str".into(), info.mode.to_string().into());
    map.insert("owner".into(), info.owner.clone().into());
    map.insert("group".into(), info.group.clone().into());
    map.insert("size".into(), Dynamic::from(info.size as i64));
    map.insert("nlink".into(), Dynamic::from(i64::from(info.nlink)));
    map.insert("mtime".into(), Dynamic::from(info.mod_time.timestamp()));
    map.insert(
        "link_target".into(),
        info.link_target.clone().map(Dynamic::from).unwrap_or(Dynamic::UNIT),
    );
    map
}

fn register_session_functions(engine: &mut Engine) {
    engine.register_type_with_name::<ScriptSession>("Session");

    // output
    engine.register_fn("write", |s: &mut ScriptSession, text: String| s.0.write(&text));
    engine.register_fn("writeln", |s: &mut ScriptSession, text: String| s.0.writeln(&text));
    engine.register_fn("writeln", |s: &mut ScriptSession| s.0.writeln(""));

    // identity and environment
    engine.register_fn("username", |s: &mut ScriptSession| s.0.username());
    engine.register_fn("login_name", |s: &mut ScriptSession| s.0.login_name().to_string());
    engine.register_fn("group", |s: &mut ScriptSession| s.0.group());
    engine.register_fn("hostname", |s: &mut ScriptSession| s.0.hostname().to_string());
    engine.register_fn("remote_ip", |s: &mut ScriptSession| s.0.remote_ip().to_string());
    engine.register_fn("home", |s: &mut ScriptSession| s.0.home());
    engine.register_fn("pwd", |s: &mut ScriptSession| s.0.display_cwd());
    engine.register_fn("prompt_pwd", |s: &mut ScriptSession| s.0.prompt_cwd());
    engine.register_fn("set_identity", |s: &mut ScriptSession, user: String, group: String| {
        s.0.set_identity(Identity::new(user, group));
    });
    engine.register_fn("history", |s: &mut ScriptSession| -> Array {
        s.0.history().into_iter().map(Dynamic::from).collect()
    });
    engine.register_fn("set_status", |s: &mut ScriptSession, code: i64| {
        s.0.set_status(code as i32);
    });
    engine.register_fn("exit", |s: &mut ScriptSession| s.0.exit());

    // filesystem
    engine.register_fn("chdir", |s: &mut ScriptSession, path: String| -> RhaiResult<()> {
        s.0.chdir(&path).map(|_| ()).map_err(throw)
    });
    engine.register_fn("exists", |s: &mut ScriptSession, path: String| s.0.stat(&path).is_ok());
    engine.register_fn("stat", |s: &mut ScriptSession, path: String| -> RhaiResult<Map> {
        s.0.stat(&path).map(|info| info_to_map(&info)).map_err(throw)
    });
    engine.register_fn("list", |s: &mut ScriptSession, path: String| -> RhaiResult<Array> {
        let entries = s.0.read_dir(&path).map_err(throw)?;
        Ok(entries
            .iter()
            .map(|info| Dynamic::from(info_to_map(info)))
            .collect())
    });
    engine.register_fn("read_file", |s: &mut ScriptSession, path: String| -> RhaiResult<String> {
        s.0.read_file(&path).map_err(throw)
    });
    engine.register_fn("mkdir", |s: &mut ScriptSession, path: String| -> RhaiResult<String> {
        s.0.create_dir(&path, None)
            .map(|p| s.0.display_path(&p))
            .map_err(throw)
    });
    engine.register_fn(
        "mkdir",
        |s: &mut ScriptSession, path: String, perm: i64| -> RhaiResult<String> {
            s.0.create_dir(&path, Some(Mode::dir(perm as u32)))
                .map(|p| s.0.display_path(&p))
                .map_err(throw)
        },
    );
    engine.register_fn(
        "write_file",
        |s: &mut ScriptSession, path: String, contents: String| -> RhaiResult<()> {
            s.0.write_file(&path, &contents).map(|_| ()).map_err(throw)
        },
    );
    engine.register_fn(
        "append_file",
        |s: &mut ScriptSession, path: String, contents: String| -> RhaiResult<()> {
            s.0.append_file(&path, &contents).map(|_| ()).map_err(throw)
        },
    );
    engine.register_fn("remove", |s: &mut ScriptSession, path: String| -> RhaiResult<()> {
        s.0.remove(&path).map(|_| ()).map_err(throw)
    });
    engine.register_fn("display_path", |s: &mut ScriptSession, path: String| {
        s.0.display_path(&path)
    });
    engine.register_fn("realpath", |s: &mut ScriptSession, path: String| -> RhaiResult<String> {
        let ctx = s.0.context();
        s.0.vfs()
            .realpath(&path, &ctx)
            .map(|p| s.0.display_path(&p))
            .map_err(throw)
    });

    // commands
    engine.register_fn("commands", |s: &mut ScriptSession, prefix: String| -> Array {
        s.0.registry()
            .match_prefix(&prefix)
            .into_iter()
            .map(|e| Dynamic::from(e.name))
            .collect()
    });
    engine.register_fn("which", |s: &mut ScriptSession, name: String| -> Dynamic {
        s.0.registry()
            .path_of(&name)
            .map(Dynamic::from)
            .unwrap_or(Dynamic::UNIT)
    });
}

fn register_args_functions(engine: &mut Engine) {
    engine.register_type_with_name::<ScriptArgs>("Args");

    engine.register_fn("get", |a: &mut ScriptArgs, name: String| -> Dynamic {
        a.0.get(&name)
            .map(|v| Dynamic::from(v.to_string()))
            .unwrap_or(Dynamic::UNIT)
    });
    engine.register_fn("has", |a: &mut ScriptArgs, name: String| a.0.has(&name));
    engine.register_fn("raw", |a: &mut ScriptArgs| -> Dynamic {
        a.0.raw()
            .map(|v| Dynamic::from(v.to_string()))
            .unwrap_or(Dynamic::UNIT)
    });
    engine.register_fn("raw_args", |a: &mut ScriptArgs| a.0.raw_args().to_string());
    engine.register_fn("positional", |a: &mut ScriptArgs| -> Array {
        a.0.positional().iter().cloned().map(Dynamic::from).collect()
    });
    engine.register_fn("keys", |a: &mut ScriptArgs| -> Array {
        a.0.keys().map(|k| Dynamic::from(k.to_string())).collect()
    });
    engine.register_fn("is_empty", |a: &mut ScriptArgs| a.0.is_empty());
}

/// Register utility functions.
fn register_utility_functions(engine: &mut Engine, plugin: &str, dir: &Path) {
    let name = plugin.to_string();
    engine.on_print(move |msg| info!(plugin = %name, "[rhai] {}", msg));

    let name = plugin.to_string();
    engine.on_debug(move |msg, _source, pos| debug!(plugin = %name, %pos, "[rhai] {}", msg));

    // log(level, msg)
    let name = plugin.to_string();
    engine.register_fn("log", move |level: String, msg: String| match level.as_str() {
        "debug" => debug!(plugin = %name, "[rhai] {}", msg),
        "warn" => warn!(plugin = %name, "[rhai] {}", msg),
        "error" => error!(plugin = %name, "[rhai] {}", msg),
        _ => info!(plugin = %name, "[rhai] {}", msg),
    });

    // plugin_dir() -> String
    let dir = dir.display().to_string();
    engine.register_fn("plugin_dir", move || dir.clone());

    // now(format) -> String, strftime over UTC
    engine.register_fn("now", |format: String| -> RhaiResult<String> {
        if StrftimeItems::new(&format).any(|item| matches!(item, Item::Error)) {
            return Err(format!("invalid time format: {format}").into());
        }
        Ok(chrono::Utc::now().format(&format).to_string())
    });

    // format_time(unix_seconds, format) -> String
    engine.register_fn("format_time", |ts: i64, format: String| -> RhaiResult<String> {
        if StrftimeItems::new(&format).any(|item| matches!(item, Item::Error)) {
            return Err(format!("invalid time format: {format}").into());
        }
        let time = chrono::DateTime::from_timestamp(ts, 0)
            .ok_or_else(|| format!("timestamp out of range: {ts}"))?;
        Ok(time.format(&format).to_string())
    });

    // format_mode(bits) -> "drwxr-xr-x"
    engine.register_fn("format_mode", |bits: i64| Mode::from_bits(bits as u32).to_string());
}
