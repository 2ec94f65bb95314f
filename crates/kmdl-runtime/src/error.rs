//! The runtime error taxonomy
//!
//! A closed set of error kinds threaded through every fallible call; no
//! panics cross the runtime boundary. Each variant carries a human-readable
//! reason for diagnostics while [`ErrorKind`] stays a closed, matchable
//! classification.

use thiserror::Error;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Closed classification of runtime errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad shape/type/cardinality at the API boundary
    InvalidArgument,
    /// Malformed bytecode or model, or a failed decode inside the VM
    InvalidProgram,
    /// Lifecycle violation (unmap without map, double free)
    InvalidOperation,
    /// Missing module/function/section/name
    NotFound,
    /// Valid request this build cannot service
    NotSupported,
    /// Options lookup miss
    ResultOutOfRange,
    /// Streamed read failed
    IOError,
    /// Allocator failure
    OutOfMemory,
}

/// Errors that can occur in the runtime
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Bad shape/type/cardinality at the API boundary
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Reason for the rejection
        reason: String,
    },

    /// Malformed bytecode or model image
    #[error("Invalid program: {reason}")]
    InvalidProgram {
        /// Reason for the rejection
        reason: String,
    },

    /// Lifecycle violation
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Reason for the rejection
        reason: String,
    },

    /// Missing named entity
    #[error("Not found: {what}")]
    NotFound {
        /// What was looked up
        what: String,
    },

    /// Valid request this build cannot service
    #[error("Not supported: {what}")]
    NotSupported {
        /// The unsupported request
        what: String,
    },

    /// Options lookup miss
    #[error("Result out of range: {what}")]
    ResultOutOfRange {
        /// The missing key
        what: String,
    },

    /// Streamed read failure
    #[error("I/O error: {reason}")]
    IOError {
        /// Reason for the failure
        reason: String,
    },

    /// Allocator failure
    #[error("Out of memory allocating {bytes} bytes")]
    OutOfMemory {
        /// Requested allocation size
        bytes: usize,
    },
}

impl RuntimeError {
    /// The closed classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            RuntimeError::InvalidProgram { .. } => ErrorKind::InvalidProgram,
            RuntimeError::InvalidOperation { .. } => ErrorKind::InvalidOperation,
            RuntimeError::NotFound { .. } => ErrorKind::NotFound,
            RuntimeError::NotSupported { .. } => ErrorKind::NotSupported,
            RuntimeError::ResultOutOfRange { .. } => ErrorKind::ResultOutOfRange,
            RuntimeError::IOError { .. } => ErrorKind::IOError,
            RuntimeError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
        }
    }

    /// Create an invalid-argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create an invalid-program error
    pub fn invalid_program(reason: impl Into<String>) -> Self {
        Self::InvalidProgram {
            reason: reason.into(),
        }
    }

    /// Create an invalid-operation error
    pub fn invalid_operation(reason: impl Into<String>) -> Self {
        Self::InvalidOperation {
            reason: reason.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a not-supported error
    pub fn not_supported(what: impl Into<String>) -> Self {
        Self::NotSupported { what: what.into() }
    }

    /// Create an out-of-range error
    pub fn out_of_range(what: impl Into<String>) -> Self {
        Self::ResultOutOfRange { what: what.into() }
    }
}

impl From<kmdl_model::FormatError> for RuntimeError {
    fn from(err: kmdl_model::FormatError) -> Self {
        use kmdl_model::FormatError;
        match err {
            FormatError::Io { source } => RuntimeError::IOError {
                reason: source.to_string(),
            },
            FormatError::SectionNotFound { name } => RuntimeError::NotFound {
                what: format!("section '{}'", name),
            },
            other => RuntimeError::InvalidProgram {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            RuntimeError::invalid_argument("bad").kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(RuntimeError::OutOfMemory { bytes: 16 }.kind(), ErrorKind::OutOfMemory);
    }

    #[test]
    fn test_format_error_mapping() {
        let err: RuntimeError = kmdl_model::FormatError::UnsupportedVersion {
            version: 5,
            supported: 7,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::InvalidProgram);

        let err: RuntimeError = kmdl_model::FormatError::section_not_found(".text").into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_display() {
        let err = RuntimeError::invalid_operation("unmap without map");
        assert!(err.to_string().contains("unmap without map"));
    }
}
