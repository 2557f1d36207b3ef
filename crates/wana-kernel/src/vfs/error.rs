//! VFS error types.

use thiserror::Error;

/// VFS error type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VfsError {
    /// A path segment is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// A non-final segment is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Mode bits deny the operation for the requester.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// An entry already occupies the name.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Invalid path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl VfsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// The text a shell prints for this error, e.g. `No such file or directory`.
    pub fn shell_message(&self) -> &str {
        match self {
            VfsError::NotFound(_) => "No such file or directory",
            VfsError::NotADirectory(_) => "Not a directory",
            VfsError::PermissionDenied(_) => "Permission denied",
            VfsError::AlreadyExists(_) => "File exists",
            VfsError::IsADirectory(_) => "Is a directory",
            VfsError::InvalidPath(_) => "Invalid argument",
            VfsError::Other(msg) => msg,
        }
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;
