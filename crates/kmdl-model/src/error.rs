//! Error types for the model format layer

use thiserror::Error;

/// Result type for format operations
pub type Result<T> = std::result::Result<T, FormatError>;

/// Errors that can occur while encoding or decoding model images
#[derive(Error, Debug)]
pub enum FormatError {
    /// Wrong magic identifier at the start of the image
    #[error("Invalid model identifier: expected {expected:#010x}, found {found:#010x}")]
    InvalidIdentifier {
        /// Expected identifier
        expected: u32,
        /// Found identifier
        found: u32,
    },

    /// Unsupported model version
    #[error("Unsupported model version: {version}, supported: {supported}")]
    UnsupportedVersion {
        /// Version found in the header
        version: u32,
        /// Version this build supports
        supported: u32,
    },

    /// Read past the end of the image or a record
    #[error("Unexpected end of model data: needed {needed} bytes, {available} available")]
    UnexpectedEof {
        /// Bytes the read required
        needed: usize,
        /// Bytes that were available
        available: usize,
    },

    /// Structurally invalid image
    #[error("Invalid model format: {reason}")]
    InvalidFormat {
        /// Reason for the failure
        reason: String,
    },

    /// A named section is missing
    #[error("Section '{name}' not found")]
    SectionNotFound {
        /// Name of the missing section
        name: String,
    },

    /// I/O error from a streamed read
    #[error("I/O error: {source}")]
    Io {
        #[from]
        /// Source I/O error
        source: std::io::Error,
    },
}

impl FormatError {
    /// Create an invalid format error
    pub fn invalid_format(reason: impl Into<String>) -> Self {
        Self::InvalidFormat {
            reason: reason.into(),
        }
    }

    /// Create a section-not-found error
    pub fn section_not_found(name: impl Into<String>) -> Self {
        Self::SectionNotFound { name: name.into() }
    }
}
