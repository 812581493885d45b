//! Asymmetric wrapping of thread keys.
//!
//! A thread key is delivered to a participant by encrypting it under a key
//! agreed between a fresh ephemeral X25519 key and the participant's static
//! X25519 key. The wrapped blob is self-describing:
//!
//! ```text
//! version (1) | ephemeral public (32) | nonce (12) | ciphertext (32) | tag (16)
//! ```
//!
//! and travels as base64url without padding. Decoding accepts standard
//! base64 too, with or without padding.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;

use crate::crypto::{AeadNonce, EphemeralKeyPair, ThreadKey, X25519PublicKey, X25519StaticSecret};
use crate::error::{KeyError, Result};

/// Wire version of [`WrappedKey`].
pub const WRAP_VERSION: u8 = 1;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Encoded length of a wrapped key in bytes.
pub const WRAPPED_KEY_LEN: usize = 1 + KEY_LEN + NONCE_LEN + KEY_LEN + TAG_LEN;

/// A thread key encrypted for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub version: u8,
    pub ephemeral_public: X25519PublicKey,
    pub nonce: AeadNonce,
    pub ciphertext: [u8; KEY_LEN],
    pub tag: [u8; TAG_LEN],
}

impl WrappedKey {
    /// Encrypt `key` for `recipient`.
    pub fn seal(key: &ThreadKey, recipient: &X25519PublicKey) -> Result<Self> {
        let ephemeral = EphemeralKeyPair::generate();
        let ephemeral_public = ephemeral.public_key();
        let shared = ephemeral.diffie_hellman(recipient);
        let wrapping_key = shared.derive_wrapping_key(&kdf_context(&ephemeral_public, recipient));

        let nonce = AeadNonce::generate();
        let sealed = wrapping_key.encrypt(key.as_bytes(), &nonce, &[WRAP_VERSION])?;
        if sealed.len() != KEY_LEN + TAG_LEN {
            return Err(KeyError::Encryption(format!(
                "unexpected sealed length {}",
                sealed.len()
            )));
        }

        let mut ciphertext = [0u8; KEY_LEN];
        let mut tag = [0u8; TAG_LEN];
        ciphertext.copy_from_slice(&sealed[..KEY_LEN]);
        tag.copy_from_slice(&sealed[KEY_LEN..]);

        Ok(Self {
            version: WRAP_VERSION,
            ephemeral_public,
            nonce,
            ciphertext,
            tag,
        })
    }

    /// Decrypt with the recipient's secret.
    pub fn open(&self, recipient_secret: &X25519StaticSecret) -> Result<ThreadKey> {
        if self.version != WRAP_VERSION {
            return Err(KeyError::Decryption(format!(
                "unsupported wrap version {}",
                self.version
            )));
        }

        let shared = recipient_secret.diffie_hellman(&self.ephemeral_public);
        let context = kdf_context(&self.ephemeral_public, &recipient_secret.public_key());
        let wrapping_key = shared.derive_wrapping_key(&context);

        let mut sealed = Vec::with_capacity(KEY_LEN + TAG_LEN);
        sealed.extend_from_slice(&self.ciphertext);
        sealed.extend_from_slice(&self.tag);

        let plain = wrapping_key.decrypt(&sealed, &self.nonce, &[self.version])?;
        let bytes: [u8; KEY_LEN] = plain
            .try_into()
            .map_err(|_| KeyError::Decryption("unwrapped key has wrong length".into()))?;
        Ok(ThreadKey::from_bytes(bytes))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(WRAPPED_KEY_LEN);
        out.push(self.version);
        out.extend_from_slice(self.ephemeral_public.as_bytes());
        out.extend_from_slice(self.nonce.as_bytes());
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != WRAPPED_KEY_LEN {
            return Err(KeyError::Decryption(format!(
                "wrapped key must be {} bytes, got {}",
                WRAPPED_KEY_LEN,
                bytes.len()
            )));
        }

        let (version, rest) = (bytes[0], &bytes[1..]);
        let (eph, rest) = rest.split_at(KEY_LEN);
        let (nonce, rest) = rest.split_at(NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(KEY_LEN);

        let mut eph_arr = [0u8; KEY_LEN];
        let mut nonce_arr = [0u8; NONCE_LEN];
        let mut ct_arr = [0u8; KEY_LEN];
        let mut tag_arr = [0u8; TAG_LEN];
        eph_arr.copy_from_slice(eph);
        nonce_arr.copy_from_slice(nonce);
        ct_arr.copy_from_slice(ciphertext);
        tag_arr.copy_from_slice(tag);

        Ok(Self {
            version,
            ephemeral_public: X25519PublicKey::from_bytes(eph_arr),
            nonce: AeadNonce::from_bytes(nonce_arr),
            ciphertext: ct_arr,
            tag: tag_arr,
        })
    }

    /// Base64url without padding, the transport form.
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.to_bytes())
    }

    /// Standard base64 with padding.
    pub fn encode_standard(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    /// Decode either base64 alphabet, padded or not.
    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = decode_base64_any(encoded)
            .map_err(|e| KeyError::Decryption(format!("corrupt wrapped key encoding: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

/// Wrap `key` for `recipient` and return the transport string.
pub fn wrap_key(key: &ThreadKey, recipient: &X25519PublicKey) -> Result<String> {
    Ok(WrappedKey::seal(key, recipient)?.encode())
}

/// Recover a thread key from a wrapped string in either base64 alphabet.
///
/// Every failure, including bad encoding, is reported as
/// [`KeyError::Decryption`].
pub fn unwrap_key(wrapped: &str, recipient_secret: &X25519StaticSecret) -> Result<ThreadKey> {
    WrappedKey::decode(wrapped)?.open(recipient_secret)
}

/// Normalise base64url or base64 (any padding, embedded whitespace) and decode.
pub(crate) fn decode_base64_any(encoded: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    let normalized: String = encoded
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    STANDARD_NO_PAD.decode(normalized)
}

fn kdf_context(ephemeral: &X25519PublicKey, recipient: &X25519PublicKey) -> [u8; 64] {
    let mut ctx = [0u8; 64];
    ctx[..32].copy_from_slice(ephemeral.as_bytes());
    ctx[32..].copy_from_slice(recipient.as_bytes());
    ctx
}
