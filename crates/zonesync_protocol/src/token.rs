//! Opaque change tokens.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque cursor issued and validated by the remote store.
///
/// The engine never interprets the bytes; it only stores a token and hands it
/// back on the next fetch. A missing token (`None` wherever a token is
/// optional) means "fetch everything from the beginning".
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeToken(Bytes);

impl ChangeToken {
    /// Wraps raw token bytes.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the token length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the token carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeToken(")?;
        for byte in self.0.iter().take(8) {
            write!(f, "{byte:02x}")?;
        }
        if self.0.len() > 8 {
            write!(f, "..")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_is_truncated() {
        let token = ChangeToken::from_bytes(vec![0xAB; 32]);
        let rendered = format!("{token:?}");
        assert!(rendered.starts_with("ChangeToken(abab"));
        assert!(rendered.ends_with("..)"));
        assert_eq!(token.len(), 32);
    }
}
