use thiserror::Error;

/// Errors from filesystem operations.
#[derive(Error, Debug)]
pub enum FilesystemError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("no space left: {0}")]
    NoSpace(String),

    #[error("corrupt filesystem: {0}")]
    Corrupt(String),

    #[error("filesystem is read-only: {0}")]
    ReadOnly(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}
