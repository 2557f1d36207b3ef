//! Command argument tokenizers.
//!
//! Two flavors. [`CmdArgs::parse`] never fails: `--long` options take the
//! next token as a value when it is not itself an option, and `-abc` sets
//! `abc`, `a`, `b` and `c` as flags. [`CmdArgs::parse_strict`] checks tokens
//! against an allow-list and reports missing values.

use std::collections::BTreeMap;

use thiserror::Error;

/// Argument parsing errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArgsError {
    /// An option declared to take a value has none.
    #[error("option requires an argument -- '{0}'")]
    MalformedArguments(String),

    /// Option not in the allow-list.
    #[error("unrecognized option '{0}'")]
    UnknownOption(String),
}

/// Value of a parsed option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Flag,
    Value(String),
}

/// Allow-list entry for [`CmdArgs::parse_strict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionSpec {
    pub name: &'static str,
    pub takes_value: bool,
}

impl OptionSpec {
    pub const fn flag(name: &'static str) -> Self {
        Self {
            name,
            takes_value: false,
        }
    }

    pub const fn value(name: &'static str) -> Self {
        Self {
            name,
            takes_value: true,
        }
    }
}

/// Parsed arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdArgs {
    options: BTreeMap<String, ArgValue>,
    positional: Vec<String>,
    raw_args: String,
}

fn is_option(token: &str) -> bool {
    token.len() > 1 && token.starts_with('-')
}

impl CmdArgs {
    /// Lenient parse, used for every dispatched command.
    pub fn parse(raw: &str) -> Self {
        let mut args = Self {
            raw_args: raw.trim().to_string(),
            ..Self::default()
        };
        let mut tokens = raw.split_whitespace().peekable();
        let mut options_done = false;

        while let Some(token) = tokens.next() {
            if options_done || !is_option(token) {
                args.positional.push(token.to_string());
            } else if token == "--" {
                options_done = true;
            } else if let Some(long) = token.strip_prefix("--") {
                if let Some((name, value)) = long.split_once('=') {
                    args.set_value(name, value);
                } else if let Some(value) = tokens.next_if(|next| !next.starts_with('-')) {
                    args.set_value(long, value);
                } else {
                    args.set_flag(long);
                }
            } else {
                let cluster = &token[1..];
                args.set_flag(cluster);
                for c in cluster.chars() {
                    args.set_flag(&c.to_string());
                }
            }
        }
        args
    }

    /// Parse against an allow-list.
    ///
    /// Fails with [`ArgsError::MalformedArguments`] when a value-taking option
    /// is the last token or is followed by another option, and with
    /// [`ArgsError::UnknownOption`] for anything not listed.
    pub fn parse_strict(raw: &str, allowed: &[OptionSpec]) -> Result<Self, ArgsError> {
        let lookup = |name: &str| allowed.iter().find(|spec| spec.name == name);
        let mut args = Self {
            raw_args: raw.trim().to_string(),
            ..Self::default()
        };
        let mut tokens = raw.split_whitespace().peekable();
        let mut options_done = false;

        while let Some(token) = tokens.next() {
            if options_done || !is_option(token) {
                args.positional.push(token.to_string());
            } else if token == "--" {
                options_done = true;
            } else if let Some(long) = token.strip_prefix("--") {
                let (name, inline) = match long.split_once('=') {
                    Some((name, value)) => (name, Some(value)),
                    None => (long, None),
                };
                let spec = lookup(name).ok_or_else(|| ArgsError::UnknownOption(token.to_string()))?;
                match (spec.takes_value, inline) {
                    (true, Some(value)) => args.set_value(name, value),
                    (true, None) => {
                        let value = tokens
                            .next_if(|next| !is_option(next))
                            .ok_or_else(|| ArgsError::MalformedArguments(name.to_string()))?;
                        args.set_value(name, value);
                    }
                    (false, Some(_)) => return Err(ArgsError::MalformedArguments(name.to_string())),
                    (false, None) => args.set_flag(name),
                }
            } else {
                let cluster: Vec<char> = token[1..].chars().collect();
                for (idx, c) in cluster.iter().enumerate() {
                    let name = c.to_string();
                    let spec = lookup(&name).ok_or_else(|| ArgsError::UnknownOption(format!("-{c}")))?;
                    if !spec.takes_value {
                        args.set_flag(&name);
                        continue;
                    }
                    if idx + 1 != cluster.len() {
                        return Err(ArgsError::MalformedArguments(name));
                    }
                    let value = tokens
                        .next_if(|next| !is_option(next))
                        .ok_or_else(|| ArgsError::MalformedArguments(name.clone()))?;
                    args.set_value(&name, value);
                }
            }
        }
        Ok(args)
    }

    fn set_flag(&mut self, name: &str) {
        self.options.insert(name.to_string(), ArgValue::Flag);
    }

    fn set_value(&mut self, name: &str, value: &str) {
        self.options
            .insert(name.to_string(), ArgValue::Value(value.to_string()));
    }

    /// Value of `--name value`. `None` for flags and absent options.
    pub fn get(&self, name: &str) -> Option<&str> {
        match self.options.get(name) {
            Some(ArgValue::Value(v)) => Some(v),
            _ => None,
        }
    }

    pub fn option(&self, name: &str) -> Option<&ArgValue> {
        self.options.get(name)
    }

    /// Whether the option was given at all, flag or value.
    pub fn has(&self, name: &str) -> bool {
        self.options.contains_key(name)
    }

    /// The last bare (non-option) token.
    pub fn raw(&self) -> Option<&str> {
        self.positional.last().map(String::as_str)
    }

    /// All bare tokens in order.
    pub fn positional(&self) -> &[String] {
        &self.positional
    }

    /// The untokenized argument string.
    pub fn raw_args(&self) -> &str {
        &self.raw_args
    }

    /// Option names, sorted.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.options.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty() && self.positional.is_empty()
    }
}
