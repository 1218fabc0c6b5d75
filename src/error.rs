// src/error.rs - Error taxonomy for device and stream selection
use crate::device::{DeviceIndex, DeviceType};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AccelError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccelError {
    /// The crate was built without support for the requested backend.
    #[error("{kind} support was not compiled in")]
    NotCompiled { kind: DeviceType },

    /// A device reference or option could not be mapped to anything meaningful.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid device index {index} (device count is {count})")]
    InvalidDevice { index: DeviceIndex, count: usize },

    /// The backend was initialized in a parent process and this is a forked child.
    #[error(
        "Cannot re-initialize {kind} in forked subprocess. To use {kind} with \
         multiprocessing, you must use the 'spawn' start method"
    )]
    BadFork { kind: DeviceType },

    #[error("{operation} failed: {message}")]
    Backend { operation: &'static str, message: String },
}

impl AccelError {
    pub fn backend(operation: &'static str, message: impl std::fmt::Display) -> Self {
        AccelError::Backend {
            operation,
            message: message.to_string(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        AccelError::InvalidArgument(message.into())
    }

    /// Fatal errors cannot be cleared by retrying within this process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AccelError::BadFork { .. } | AccelError::NotCompiled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(AccelError::BadFork { kind: DeviceType::Xpu }.is_fatal());
        assert!(AccelError::NotCompiled { kind: DeviceType::Cuda }.is_fatal());
        assert!(!AccelError::InvalidDevice { index: 4, count: 2 }.is_fatal());
        assert!(!AccelError::invalid_argument("nope").is_fatal());
    }

    #[test]
    fn test_bad_fork_message_names_backend() {
        let msg = AccelError::BadFork { kind: DeviceType::Xpu }.to_string();
        assert!(msg.starts_with("Cannot re-initialize xpu in forked subprocess"));
        assert!(msg.contains("'spawn'"));
    }
}
