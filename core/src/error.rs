use thiserror::Error;

/// Error taxonomy shared across the cvmboot workspace. Each variant maps to
/// one of the kinds named in the error-handling design: `InvalidArgument`,
/// `NotFound`, `OutOfRange`/`OutOfSpace`, `IoError`, `CorruptFormat`,
/// `HashMismatch`, `ExternalToolFailure`, `LifecycleError`.
#[derive(Debug, Error)]
pub enum CvmbootError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("out of space: {0}")]
    OutOfSpace(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("corrupt format: {0}")]
    CorruptFormat(String),

    #[error("hash mismatch: {0}")]
    HashMismatch(String),

    #[error("external tool failed: {0}")]
    ExternalToolFailure(String),

    #[error("illegal operation for current image state: {0}")]
    LifecycleError(String),
}

pub type Result<T> = std::result::Result<T, CvmbootError>;
