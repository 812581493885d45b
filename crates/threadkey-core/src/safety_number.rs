//! Safety numbers: human-comparable fingerprints of a pair of identities.
//!
//! Each identity contributes 30 decimal digits derived from a keyed Blake3
//! hash of its public key. The two halves are sorted before joining, so both
//! peers compute the same 60 digits regardless of who is "local".

use std::fmt;

use crate::error::ValidationError;

const DERIVE_CONTEXT: &str = "threadkey-safety-number-v1";
const CHUNKS_PER_KEY: usize = 6;
const CHUNK_BYTES: usize = 5;
const GROUP_DIGITS: usize = 5;

/// Total digit count of a safety number.
pub const SAFETY_NUMBER_DIGITS: usize = 2 * CHUNKS_PER_KEY * GROUP_DIGITS;

/// A 60-digit safety number.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SafetyNumber(String);

impl SafetyNumber {
    /// Derive the safety number shared by `local` and `remote`.
    ///
    /// Keys are compared case-insensitively; both are normalised to lowercase
    /// before hashing.
    pub fn derive(local: &str, remote: &str) -> Result<Self, ValidationError> {
        let a = fingerprint_half(local)?;
        let b = fingerprint_half(remote)?;
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Ok(Self(format!("{first}{second}")))
    }

    /// Parse a displayed safety number, ignoring whitespace.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        let digits = normalize(s);
        if digits.len() != SAFETY_NUMBER_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ValidationError::InvalidSafetyNumber(s.to_string()));
        }
        Ok(Self(digits))
    }

    /// Bare digits.
    pub fn digits(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SafetyNumber {
    /// Twelve space-separated groups of five digits.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, group) in self.0.as_bytes().chunks(GROUP_DIGITS).enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            // Digits are ASCII by construction.
            f.write_str(std::str::from_utf8(group).map_err(|_| fmt::Error)?)?;
        }
        Ok(())
    }
}

impl fmt::Debug for SafetyNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SafetyNumber({})", self)
    }
}

/// Compare two displayed safety numbers, ignoring whitespace.
///
/// Empty input never matches.
pub fn safety_numbers_match(a: &str, b: &str) -> bool {
    let a = normalize(a);
    let b = normalize(b);
    !a.is_empty() && a == b
}

fn normalize(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

fn fingerprint_half(pubkey: &str) -> Result<String, ValidationError> {
    let key = pubkey.trim().to_ascii_lowercase();
    if key.is_empty() {
        return Err(ValidationError::EmptyIdentifier("pubkey"));
    }

    let mut hasher = blake3::Hasher::new_derive_key(DERIVE_CONTEXT);
    hasher.update(key.as_bytes());
    let mut bytes = [0u8; CHUNKS_PER_KEY * CHUNK_BYTES];
    hasher.finalize_xof().fill(&mut bytes);

    let mut out = String::with_capacity(CHUNKS_PER_KEY * GROUP_DIGITS);
    for chunk in bytes.chunks(CHUNK_BYTES) {
        let value = chunk.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        out.push_str(&format!("{:05}", value % 100_000));
    }
    Ok(out)
}
