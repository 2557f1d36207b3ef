//! File mode bits.
//!
//! The layout matches the snapshot format: POSIX permission bits in the low
//! nine bits, type flags in the high bits.

use std::fmt;

use serde::{Deserialize, Serialize};

/// File mode (permission bits plus type flags).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mode(u32);

impl Mode {
    /// Directory flag.
    pub const DIR: u32 = 1 << 31;
    /// Symbolic link flag.
    pub const SYMLINK: u32 = 1 << 27;
    /// Setuid bit (stored, never enforced).
    pub const SETUID: u32 = 1 << 23;
    /// Setgid bit (stored, never enforced).
    pub const SETGID: u32 = 1 << 22;
    /// Sticky bit (stored, never enforced).
    pub const STICKY: u32 = 1 << 20;
    /// Owner/group/other permission bits.
    pub const PERM_MASK: u32 = 0o777;

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Permissions for a regular file.
    pub const fn file(perm: u32) -> Self {
        Self(perm & Self::PERM_MASK)
    }

    /// Permissions for a directory; the directory flag is set.
    pub const fn dir(perm: u32) -> Self {
        Self(Self::DIR | (perm & Self::PERM_MASK))
    }

    pub const fn symlink() -> Self {
        Self(Self::SYMLINK | 0o777)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn perm(self) -> u32 {
        self.0 & Self::PERM_MASK
    }

    pub const fn is_dir(self) -> bool {
        self.0 & Self::DIR != 0
    }

    pub const fn is_symlink(self) -> bool {
        self.0 & Self::SYMLINK != 0
    }

    /// Returns a copy with the directory flag set.
    pub const fn with_dir_flag(self) -> Self {
        Self(self.0 | Self::DIR)
    }

    /// Replace the permission bits, keeping type and special flags.
    pub const fn with_perm(self, perm: u32) -> Self {
        Self((self.0 & !Self::PERM_MASK) | (perm & Self::PERM_MASK))
    }

    /// The three bits for owner (`0`), group (`1`) or other (`2`).
    pub(crate) const fn class_bits(self, class: u32) -> u32 {
        (self.0 >> (6 - 3 * class)) & 0o7
    }
}

impl fmt::Display for Mode {
    /// `ls -l` style rendering, e.g. `drwxr-xr-x`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_dir() {
            'd'
        } else if self.is_symlink() {
            'l'
        } else {
            '-'
        };
        let mut out = String::with_capacity(10);
        out.push(kind);
        for class in 0..3 {
            let bits = self.class_bits(class);
            out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            let exec = bits & 0o1 != 0;
            let special = match class {
                0 => self.0 & Self::SETUID != 0,
                1 => self.0 & Self::SETGID != 0,
                _ => self.0 & Self::STICKY != 0,
            };
            out.push(match (special, exec, class) {
                (true, true, 2) => 't',
                (true, false, 2) => 'T',
                (true, true, _) => 's',
                (true, false, _) => 'S',
                (false, true, _) => 'x',
                (false, false, _) => '-',
            });
        }
        f.write_str(&out)
    }
}

impl From<u32> for Mode {
    fn from(bits: u32) -> Self {
        Self(bits)
    }
}
