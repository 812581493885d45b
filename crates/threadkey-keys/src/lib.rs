//! # Threadkey Keys
//!
//! Delivery and use of per-thread symmetric keys.
//!
//! ## Encryption Model
//!
//! Every thread has one [`ThreadKey`]:
//!
//! 1. **Wrapping**: the key is delivered to a participant by X25519 ECDH with
//!    a fresh ephemeral key, Blake3 key derivation and ChaCha20-Poly1305
//!    (see [`wrap`]).
//! 2. **Invites**: a wrapped key travels inside a signed, expiring
//!    [`InvitePayload`] shared as a link.
//! 3. **Sealing**: message bodies are encrypted under the thread key with the
//!    thread id as associated data.
//!
//! Whether a participant may still use the key is decided elsewhere, by
//! resolving their data token against the thread's control token.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use threadkey_keys::{unwrap_key, wrap_key, ThreadKey, X25519StaticSecret};
//!
//! let recipient = X25519StaticSecret::generate();
//! let key = ThreadKey::generate();
//!
//! let wrapped = wrap_key(&key, &recipient.public_key()).unwrap();
//! let recovered = unwrap_key(&wrapped, &recipient).unwrap();
//! assert_eq!(recovered, key);
//! ```

pub mod crypto;
pub mod error;
pub mod invite;
pub mod sealed;
pub mod wrap;

pub use crypto::{
    AeadKey, AeadNonce, EphemeralKeyPair, SharedKey, ThreadKey, X25519PublicKey,
    X25519StaticSecret,
};
pub use error::{KeyError, Result};
pub use invite::{InvitePayload, InviteRequest, INVITE_PROTO, INVITE_VERSION};
pub use sealed::SealFormat;
pub use wrap::{unwrap_key, wrap_key, WrappedKey, WRAPPED_KEY_LEN, WRAP_VERSION};
