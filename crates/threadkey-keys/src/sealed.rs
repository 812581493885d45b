//! Message bodies sealed under a thread key.
//!
//! A sealed body is `version | nonce | ciphertext+tag`, base64url encoded.
//! The thread id is bound as associated data so a body cannot be replayed
//! into another thread that happens to share the key.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::crypto::{AeadNonce, ThreadKey};
use crate::error::{KeyError, Result};
use crate::wrap::decode_base64_any;

/// Format byte of a sealed body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SealFormat {
    /// ChaCha20-Poly1305 with a 256-bit key.
    ChaCha20Poly1305 = 1,
}

const NONCE_LEN: usize = 12;

impl ThreadKey {
    /// Encrypt a message body for `thread_id`.
    pub fn seal(&self, thread_id: &str, plaintext: &[u8]) -> Result<String> {
        let nonce = AeadNonce::generate();
        let ciphertext = self
            .aead_key()
            .encrypt(plaintext, &nonce, thread_id.as_bytes())?;

        let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        out.push(SealFormat::ChaCha20Poly1305 as u8);
        out.extend_from_slice(nonce.as_bytes());
        out.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(out))
    }

    /// Decrypt a body produced by [`ThreadKey::seal`] for the same thread.
    pub fn open(&self, thread_id: &str, sealed: &str) -> Result<Vec<u8>> {
        let bytes = decode_base64_any(sealed)
            .map_err(|e| KeyError::Decryption(format!("corrupt sealed body: {e}")))?;

        match bytes.first() {
            Some(&b) if b == SealFormat::ChaCha20Poly1305 as u8 => {}
            Some(other) => {
                return Err(KeyError::Decryption(format!("unknown seal format {other}")))
            }
            None => return Err(KeyError::Decryption("empty sealed body".into())),
        }
        if bytes.len() < 1 + NONCE_LEN {
            return Err(KeyError::Decryption("sealed body too short".into()));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[1..1 + NONCE_LEN]);
        self.aead_key().decrypt(
            &bytes[1 + NONCE_LEN..],
            &AeadNonce::from_bytes(nonce),
            thread_id.as_bytes(),
        )
    }
}
