//! Session identifiers: printable strings in `[0-9a-zA-Z_-]`, 1..=64 bytes.
//!
//! Two shapes are accepted on input: the canonical UUIDv4 shape this core
//! generates for new sessions, and a looser "legacy" shape that is anything
//! else matching the same character class. The validator deliberately does
//! not require UUID form — a client-supplied id like `my-build-box` is just
//! as valid as a generated one, matching the source's lenient fallthrough
//! (see DESIGN.md open question ii).

use std::fmt;

use crate::error::SessionError;

const MAX_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a canonical UUIDv4-shaped id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Validate and wrap a client- or disk-supplied id.
    pub fn parse(raw: impl Into<String>) -> Result<Self, SessionError> {
        let raw = raw.into();
        if is_valid(&raw) {
            Ok(Self(raw))
        } else {
            Err(SessionError::InvalidId { id: raw })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// `true` iff `s` is 1..=64 bytes of `[0-9a-zA-Z_-]`. Covers both the
/// canonical UUID shape (36 chars, hyphens at 8/13/18/23) and the legacy
/// shape (anything else in the same character class) — both are accepted
/// without distinguishing between them, per the spec's lenient policy.
fn is_valid(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_LEN
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// `true` iff `s` has the canonical UUIDv4 textual shape. Not required for
/// validity; used only where callers want to distinguish generated ids from
/// client-supplied legacy ones (e.g. diagnostics).
pub fn is_canonical_uuid_shape(s: &str) -> bool {
    const HYPHENS: [usize; 4] = [8, 13, 18, 23];
    let bytes = s.as_bytes();
    bytes.len() == 36
        && bytes.iter().enumerate().all(|(i, &b)| {
            if HYPHENS.contains(&i) {
                b == b'-'
            } else {
                b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
            }
        })
}
