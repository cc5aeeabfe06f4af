//! Error types for device discovery, validation and imaging.

use std::io;
use thiserror::Error;

/// Result type used throughout `driveflash-core`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Reasons a capacity check can reject a device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The device did not report a capacity, so the image cannot be checked against it.
    #[error("device capacity is unknown")]
    CapacityUnknown,

    #[error("image is {image_size} bytes but the device only holds {capacity} bytes")]
    InsufficientCapacity { image_size: u64, capacity: u64 },
}

/// Errors produced by the platform probe, the write stages and the orchestrator.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad image path, empty device identifier, or a device that is not a listed removable disk.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The platform could not report a definite size for the device.
    #[error("capacity of {0} is unavailable")]
    CapacityUnavailable(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Another job already targets this device.
    #[error("a write to {0} is already in progress")]
    AlreadyInProgress(String),

    #[error("failed to clear device: {0}")]
    EraseFailed(#[source] io::Error),

    #[error("failed to write image: {0}")]
    WriteFailed(#[source] io::Error),

    /// The job was cancelled. Bytes already written to the device are not rolled back.
    #[error("operation cancelled by user")]
    Cancelled,

    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(&'static str),

    #[error("failed to enumerate devices: {0}")]
    EnumerationFailed(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Builds an [`Error::EraseFailed`] from a message, for failures that are not `io::Error`s
    /// (e.g. a disk utility exiting non-zero).
    pub(crate) fn erase_failed(msg: impl Into<String>) -> Self {
        Error::EraseFailed(io::Error::other(msg.into()))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_converts_transparently() {
        let err: Error = ValidationError::InsufficientCapacity {
            image_size: 10,
            capacity: 9,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "image is 10 bytes but the device only holds 9 bytes"
        );
    }

    #[test]
    fn test_erase_failed_carries_message() {
        let err = Error::erase_failed("diskpart exited with status 1");
        assert_eq!(
            err.to_string(),
            "failed to clear device: diskpart exited with status 1"
        );
        assert!(!err.is_cancelled());
        assert!(Error::Cancelled.is_cancelled());
    }
}
