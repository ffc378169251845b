//! Structured error types for stacksnap
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! [`CaptureError`] is `Copy` and carries no heap data: it is produced while a
//! thread is suspended and is only formatted after resume.

use super::types::Tid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("Failed to install {signal} handler: {source}")]
    SignalHandlerInstallFailed {
        signal: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to query stack bounds of {0}")]
    StackBoundsUnavailable(Tid),

    #[error("Failed to open thread handle for {tid}: {source}")]
    ThreadHandleFailed {
        tid: Tid,
        #[source]
        source: std::io::Error,
    },

    #[error("Stack sampling is not supported on this platform")]
    UnsupportedPlatform,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why a single sample came back empty
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Thread could not be suspended")]
    SuspendFailed,

    #[error("Register context of the suspended thread is unavailable")]
    ContextUnavailable,

    #[error("Corrupted stack bounds: sp 0x{stack_pointer:x} is not below stack base 0x{stack_base:x}")]
    CorruptedBounds { stack_pointer: usize, stack_base: usize },

    #[error("Live stack of {needed} bytes exceeds the {capacity} byte buffer")]
    StackTooLarge { needed: usize, capacity: usize },
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to write profile file: {0}")]
    WriteFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_too_large_display() {
        let err = CaptureError::StackTooLarge { needed: 1025, capacity: 1024 };
        assert_eq!(
            err.to_string(),
            "Live stack of 1025 bytes exceeds the 1024 byte buffer"
        );
    }

    #[test]
    fn test_thread_handle_error() {
        let err = SamplerError::ThreadHandleFailed {
            tid: Tid(4242),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(err.to_string().contains("TID:4242"));
    }

    #[test]
    fn test_corrupted_bounds_display() {
        let err = CaptureError::CorruptedBounds { stack_pointer: 0x2000, stack_base: 0x1000 };
        assert!(err.to_string().contains("0x2000"));
        assert!(err.to_string().contains("0x1000"));
    }
}
