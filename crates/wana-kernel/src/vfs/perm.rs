//! Permission evaluation.

use serde::{Deserialize, Serialize};

use super::mode::Mode;

/// Simulated actor for permission checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    pub group: String,
}

impl Identity {
    pub fn new(username: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            group: group.into(),
        }
    }

    pub fn root() -> Self {
        Self::new("root", "root")
    }
}

/// Result of evaluating a mode against an identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Access {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

/// Pick the owner, group or other bits of `mode` for `who`.
///
/// Owner match wins over group match; no identity means no access at all.
pub fn evaluate(mode: Mode, owner: &str, group: &str, who: Option<&Identity>) -> Access {
    let Some(who) = who else {
        return Access::default();
    };

    let class = if who.username == owner {
        0
    } else if who.group == group {
        1
    } else {
        2
    };
    let bits = mode.class_bits(class);

    Access {
        read: bits & 0o4 != 0,
        write: bits & 0o2 != 0,
        execute: bits & 0o1 != 0,
    }
}
