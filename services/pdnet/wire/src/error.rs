//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes remain than the frame or field declares
    #[error("incomplete data: need {needed} bytes, {available} available")]
    Incomplete {
        /// Bytes required to continue
        needed: usize,
        /// Bytes actually left in the buffer
        available: usize,
    },

    /// Frame declares a zero length (no room for the header byte)
    #[error("zero-length frame")]
    EmptyFrame,

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// No reader registered for the header
    #[error("no handler for header {0}")]
    UnknownHeader(u8),

    /// A reader is already registered for the header
    #[error("duplicate reader for header {0}")]
    DuplicateHeader(u8),

    /// String field is not valid UTF-8
    #[error("string field is not valid utf-8")]
    Utf8,

    /// String length prefix is malformed
    #[error("malformed string length")]
    VarLen,

    /// Unknown error code
    #[error("unknown code {0}")]
    Code(u8),

    /// Body does not match the expected layout
    #[error("malformed body: {0}")]
    Malformed(String),
}
