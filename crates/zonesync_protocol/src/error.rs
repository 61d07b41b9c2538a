//! Error types for protocol encoding and decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// CBOR encoding failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// CBOR decoding failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// The encoded value has a format version this build cannot read.
    #[error("unsupported format version {found}, expected {expected}")]
    UnsupportedVersion {
        /// Version found in the encoded data.
        found: u32,
        /// Version this build writes.
        expected: u32,
    },

    /// Decoded data is well-formed CBOR but structurally invalid.
    #[error("invalid structure: {0}")]
    InvalidStructure(String),
}

impl ProtocolError {
    /// Creates an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure(message.into())
    }
}

impl<E: std::fmt::Debug> From<ciborium::ser::Error<E>> for ProtocolError {
    fn from(err: ciborium::ser::Error<E>) -> Self {
        Self::Encode(format!("{err:?}"))
    }
}

impl<E: std::fmt::Debug> From<ciborium::de::Error<E>> for ProtocolError {
    fn from(err: ciborium::de::Error<E>) -> Self {
        Self::Decode(format!("{err:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::UnsupportedVersion {
            found: 7,
            expected: 1,
        };
        assert_eq!(
            err.to_string(),
            "unsupported format version 7, expected 1"
        );

        let err = ProtocolError::invalid_structure("missing zone");
        assert!(err.to_string().contains("missing zone"));
    }
}
