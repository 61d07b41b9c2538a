//! Persistent change-token ledger.

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{DatabaseScope, ZoneId};
use crate::token::ChangeToken;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Format version written by [`TokenLedger::encode`].
pub const LEDGER_FORMAT_VERSION: u32 = 1;

/// Change tokens keyed by database scope and by zone.
///
/// A missing entry means "no token yet": the next fetch starts from the
/// beginning. The ledger is a plain value; callers persist the encoded form in
/// the same local transaction as the data the tokens describe.
///
/// # Invariants
///
/// - A zone token is only replaced once the changes it covers are committed
/// - Resetting a zone removes only that zone's token
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenLedger {
    by_scope: BTreeMap<DatabaseScope, ChangeToken>,
    by_zone: BTreeMap<ZoneId, ChangeToken>,
}

#[derive(Serialize, Deserialize)]
struct EncodedLedger {
    version: u32,
    scopes: Vec<ScopeEntry>,
    zones: Vec<ZoneEntry>,
}

#[derive(Serialize, Deserialize)]
struct ScopeEntry {
    scope: u8,
    token: ChangeToken,
}

#[derive(Serialize, Deserialize)]
struct ZoneEntry {
    zone: ZoneId,
    token: ChangeToken,
}

impl TokenLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token of a database scope.
    pub fn scope_token(&self, scope: DatabaseScope) -> Option<&ChangeToken> {
        self.by_scope.get(&scope)
    }

    /// Stores or clears the token of a database scope.
    pub fn set_scope_token(&mut self, scope: DatabaseScope, token: Option<ChangeToken>) {
        match token {
            Some(token) => {
                self.by_scope.insert(scope, token);
            }
            None => {
                self.by_scope.remove(&scope);
            }
        }
    }

    /// Returns the token of a zone.
    pub fn zone_token(&self, zone: &ZoneId) -> Option<&ChangeToken> {
        self.by_zone.get(zone)
    }

    /// Stores or clears the token of a zone.
    pub fn set_zone_token(&mut self, zone: &ZoneId, token: Option<ChangeToken>) {
        match token {
            Some(token) => {
                self.by_zone.insert(zone.clone(), token);
            }
            None => {
                self.by_zone.remove(zone);
            }
        }
    }

    /// Clears the token of a zone so its next pull starts from scratch.
    ///
    /// Returns true if a token was removed.
    pub fn reset_zone(&mut self, zone: &ZoneId) -> bool {
        self.by_zone.remove(zone).is_some()
    }

    /// Clears the token of a database scope.
    pub fn reset_scope(&mut self, scope: DatabaseScope) -> bool {
        self.by_scope.remove(&scope).is_some()
    }

    /// Replaces zone tokens with the given ones, leaving other zones alone.
    pub fn merge_zone_tokens<I>(&mut self, tokens: I)
    where
        I: IntoIterator<Item = (ZoneId, ChangeToken)>,
    {
        self.by_zone.extend(tokens);
    }

    /// Iterates over zones that have a token.
    pub fn zones(&self) -> impl Iterator<Item = &ZoneId> {
        self.by_zone.keys()
    }

    /// Returns true if the ledger holds no tokens.
    pub fn is_empty(&self) -> bool {
        self.by_scope.is_empty() && self.by_zone.is_empty()
    }

    /// Encodes the ledger to versioned CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let encoded = EncodedLedger {
            version: LEDGER_FORMAT_VERSION,
            scopes: self
                .by_scope
                .iter()
                .map(|(scope, token)| ScopeEntry {
                    scope: scope.to_code(),
                    token: token.clone(),
                })
                .collect(),
            zones: self
                .by_zone
                .iter()
                .map(|(zone, token)| ZoneEntry {
                    zone: zone.clone(),
                    token: token.clone(),
                })
                .collect(),
        };
        let mut buf = Vec::new();
        ciborium::into_writer(&encoded, &mut buf)?;
        Ok(buf)
    }

    /// Decodes a ledger written by [`TokenLedger::encode`].
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedVersion` for a ledger written by another format
    /// version and `InvalidStructure` for unknown scope codes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let encoded: EncodedLedger = ciborium::from_reader(bytes)?;
        if encoded.version != LEDGER_FORMAT_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                found: encoded.version,
                expected: LEDGER_FORMAT_VERSION,
            });
        }

        let mut ledger = Self::new();
        for entry in encoded.scopes {
            let scope = DatabaseScope::from_code(entry.scope).ok_or_else(|| {
                ProtocolError::invalid_structure(format!("unknown scope code {}", entry.scope))
            })?;
            ledger.by_scope.insert(scope, entry.token);
        }
        for entry in encoded.zones {
            ledger.by_zone.insert(entry.zone, entry.token);
        }
        Ok(ledger)
    }
}
