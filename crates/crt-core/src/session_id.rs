//! Session identifiers.
//!
//! Sessions are addressed on the wire by a 36-character version-4 UUID in
//! the canonical `8-4-4-4-12` hyphenated form. Validation is strict: any
//! other length, a misplaced hyphen, or a non-hex digit is rejected, so a
//! raw payload slice can be trusted as an identifier once parsed.

use std::fmt;

use uuid::Uuid;
use zeroize::Zeroize;

/// Length of the textual form.
pub const SESSION_ID_LEN: usize = 36;

/// Positions of the four hyphens in the textual form.
const HYPHENS: [usize; 4] = [8, 13, 18, 23];

/// Invalid session identifier text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid session id: expected 36-character hyphenated UUID")]
pub struct SessionIdError;

/// A validated session identifier.
///
/// The inner string is always exactly [`SESSION_ID_LEN`] bytes of ASCII.
/// Comparison is byte-wise, matching the wire encoding; the daemon only
/// ever generates lowercase identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh random identifier.
    ///
    /// The version nibble and variant bits are fixed by the version-4
    /// construction; the remaining 122 bits come from the OS random source.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    /// Parses and validates a textual identifier.
    ///
    /// # Errors
    ///
    /// Returns [`SessionIdError`] unless `text` is exactly 36 characters
    /// with hyphens at positions 8, 13, 18 and 23 and hex digits (either
    /// case) everywhere else.
    pub fn parse(text: &str) -> Result<Self, SessionIdError> {
        if !Self::is_valid(text) {
            return Err(SessionIdError);
        }
        Ok(Self(text.to_owned()))
    }

    /// Parses an identifier from the leading 36 bytes of a payload.
    ///
    /// # Errors
    ///
    /// Returns [`SessionIdError`] if the bytes are not valid identifier
    /// text.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, SessionIdError> {
        if bytes.len() != SESSION_ID_LEN {
            return Err(SessionIdError);
        }
        let text = std::str::from_utf8(bytes).map_err(|_| SessionIdError)?;
        Self::parse(text)
    }

    /// Checks the canonical textual form without allocating.
    #[must_use]
    pub fn is_valid(text: &str) -> bool {
        let bytes = text.as_bytes();
        if bytes.len() != SESSION_ID_LEN {
            return false;
        }
        for (i, &b) in bytes.iter().enumerate() {
            if HYPHENS.contains(&i) {
                if b != b'-' {
                    return false;
                }
            } else if !b.is_ascii_hexdigit() {
                return false;
            }
        }
        true
    }

    /// Textual form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wire form: exactly 36 bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Drop for SessionId {
    // Identifiers name scrollback that may hold secrets; wipe them with
    // the same discipline as the ring storage.
    fn drop(&mut self) {
        self.0.zeroize();
    }
}
