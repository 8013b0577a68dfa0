//! Unified error handling for TensorForge
//!
//! This module provides a centralized error type that consolidates the
//! error kinds surfaced by the runtime:
//! - Caller errors (type/shape misuse, actionable by the calling layer)
//! - Recoverable errors (size/capacity/lookup conditions a caller can react to)
//! - Device errors (allocator refused a request)
//! - Internal errors (bugs, poisoned locks)

use std::fmt;

use crate::device::DeviceKind;

/// Unified error type for TensorForge
///
/// All fallible operations in the crate return this type through the
/// [`ForgeResult`] alias. Variants carry enough context (tensor name,
/// requested vs. actual) to diagnose a failure without re-running.
#[derive(Debug, thiserror::Error)]
pub enum TensorForgeError {
    /// Device allocator refused a request. Fatal to the requesting
    /// operation, not the process; not retried at this layer.
    #[error("allocation of {nbytes} bytes failed on {device}: {reason}")]
    AllocationFailed {
        nbytes: usize,
        device: DeviceKind,
        reason: String,
    },

    /// Typed access against an incompatible bound type
    #[error("tensor '{tensor}' holds {expected}, requested {requested}")]
    TypeMismatch {
        tensor: String,
        expected: &'static str,
        requested: &'static str,
    },

    /// Element-count mismatch between tensors in a copy
    #[error("tensor '{tensor}' size mismatch: expected {expected} elements, got {actual}")]
    SizeMismatch {
        tensor: String,
        expected: usize,
        actual: usize,
    },

    /// Shared memory too small to satisfy a share request
    #[error("shared memory too small: required {required} bytes, available {available}")]
    CapacityExceeded { required: usize, available: usize },

    /// Tensor not found in the workspace
    #[error("tensor '{0}' is not in the workspace")]
    TensorNotFound(String),

    /// Executable unit not found under a cache key
    #[error("executable unit '{0}' is not cached in the workspace")]
    UnitNotFound(String),

    /// Negative dimension or malformed reshape
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// Typed access before any element type was bound
    #[error("tensor '{0}' has no element type bound")]
    UntypedAccess(String),

    /// Data access before any memory was bound
    #[error("tensor '{0}' has no memory bound")]
    MemoryNotSet(String),

    /// Lock poisoned (indicates a bug or concurrent access issue)
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(String),

    /// Internal error (indicates a bug)
    #[error("internal error: {0}")]
    Internal(String),
}

impl TensorForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            TensorForgeError::TypeMismatch { .. }
            | TensorForgeError::InvalidShape(_)
            | TensorForgeError::UntypedAccess(_)
            | TensorForgeError::MemoryNotSet(_) => ErrorCategory::Caller,

            TensorForgeError::SizeMismatch { .. }
            | TensorForgeError::CapacityExceeded { .. }
            | TensorForgeError::TensorNotFound(_)
            | TensorForgeError::UnitNotFound(_) => ErrorCategory::Recoverable,

            TensorForgeError::AllocationFailed { .. } => ErrorCategory::Device,

            TensorForgeError::LockPoisoned(_) | TensorForgeError::Internal(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Check if the caller may react and retry (after freeing memory,
    /// fixing a name, or resizing)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Recoverable | ErrorCategory::Device
        )
    }

    /// Check if this is a caller bug (type/shape misuse)
    pub fn is_caller_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Caller)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller bug - type or shape misuse
    Caller,
    /// Recoverable - the caller can free, rename or resize and retry
    Recoverable,
    /// Device - accelerator allocator failure
    Device,
    /// Internal - indicates a bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Caller => write!(f, "Caller"),
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Device => write!(f, "Device"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for TensorForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        TensorForgeError::LockPoisoned(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type ForgeResult<T> = std::result::Result<T, TensorForgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            TensorForgeError::TypeMismatch {
                tensor: "x".into(),
                expected: "f32",
                requested: "i64",
            }
            .category(),
            ErrorCategory::Caller
        );
        assert_eq!(
            TensorForgeError::TensorNotFound("x".into()).category(),
            ErrorCategory::Recoverable
        );
        assert_eq!(
            TensorForgeError::AllocationFailed {
                nbytes: 64,
                device: DeviceKind::Accelerator(0),
                reason: "oom".into(),
            }
            .category(),
            ErrorCategory::Device
        );
        assert_eq!(
            TensorForgeError::LockPoisoned("x".into()).category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_is_recoverable() {
        assert!(TensorForgeError::CapacityExceeded {
            required: 8,
            available: 4
        }
        .is_recoverable());
        assert!(TensorForgeError::AllocationFailed {
            nbytes: 8,
            device: DeviceKind::Host,
            reason: "oom".into(),
        }
        .is_recoverable());
        assert!(!TensorForgeError::InvalidShape("x".into()).is_recoverable());
        assert!(!TensorForgeError::Internal("x".into()).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = TensorForgeError::SizeMismatch {
            tensor: "loss".into(),
            expected: 6,
            actual: 4,
        };
        assert_eq!(
            err.to_string(),
            "tensor 'loss' size mismatch: expected 6 elements, got 4"
        );

        let err = TensorForgeError::AllocationFailed {
            nbytes: 1024,
            device: DeviceKind::Accelerator(1),
            reason: "out of memory".into(),
        };
        assert_eq!(
            err.to_string(),
            "allocation of 1024 bytes failed on accelerator:1: out of memory"
        );
    }

    #[test]
    fn test_poison_error_conversion() {
        use std::sync::PoisonError;

        fn convert<T>(err: PoisonError<T>) -> TensorForgeError {
            TensorForgeError::from(err)
        }
        let _ = convert::<i32> as fn(PoisonError<i32>) -> TensorForgeError;
    }

    #[test]
    fn test_error_category_display() {
        assert_eq!(ErrorCategory::Caller.to_string(), "Caller");
        assert_eq!(ErrorCategory::Recoverable.to_string(), "Recoverable");
        assert_eq!(ErrorCategory::Device.to_string(), "Device");
        assert_eq!(ErrorCategory::Internal.to_string(), "Internal");
    }
}
