//! Invite payloads.
//!
//! An invite hands a thread key to one prospective participant. It carries
//! the key wrapped for the invitee's X25519 key, is signed by the inviter's
//! identity key, and expires. On the wire it is `base64url(JSON)` placed as a
//! single path segment of a shareable link: `{base}/join/{segment}`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use threadkey_core::{IdentityKeypair, IdentityKind, IdentityPublicKey, IdentitySignature, ThreadId};

use crate::crypto::{ThreadKey, X25519PublicKey, X25519StaticSecret};
use crate::error::{KeyError, Result};
use crate::wrap::{decode_base64_any, unwrap_key, wrap_key};

/// Protocol tag of invite payloads.
pub const INVITE_PROTO: &str = "threadkey";
/// Current invite payload version.
pub const INVITE_VERSION: u8 = 1;
const INVITE_TYPE: &str = "invite";
const SIGNING_DOMAIN: &[u8] = b"threadkey-invite-v1:";
const JOIN_PATH: &str = "/join/";

/// A signed invite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitePayload {
    pub proto: String,
    pub v: u8,
    pub t: String,
    pub thread_id: ThreadId,
    /// Inviter identity public key, hex.
    pub inviter: String,
    #[serde(default)]
    pub inviter_name: Option<String>,
    pub policy: IdentityKind,
    /// Base64url [`crate::WrappedKey`].
    pub wrap: String,
    /// Base64url Ed25519 signature.
    pub sig: String,
    /// Expiry, unix seconds.
    pub exp: u64,
}

/// Every field except the signature, in wire order.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedFields<'a> {
    proto: &'a str,
    v: u8,
    t: &'a str,
    thread_id: &'a ThreadId,
    inviter: &'a str,
    inviter_name: &'a Option<String>,
    policy: IdentityKind,
    wrap: &'a str,
    exp: u64,
}

/// What to invite whom to.
#[derive(Debug)]
pub struct InviteRequest<'a> {
    pub thread_id: ThreadId,
    pub thread_key: &'a ThreadKey,
    pub invitee: &'a X25519PublicKey,
    pub policy: IdentityKind,
    pub inviter_name: Option<String>,
    /// Expiry, unix seconds.
    pub expires_at: u64,
}

impl InvitePayload {
    /// Wrap the thread key for the invitee and sign the result.
    pub fn create(inviter: &IdentityKeypair, request: InviteRequest<'_>) -> Result<Self> {
        let wrap = wrap_key(request.thread_key, request.invitee)?;
        let mut invite = Self {
            proto: INVITE_PROTO.to_string(),
            v: INVITE_VERSION,
            t: INVITE_TYPE.to_string(),
            thread_id: request.thread_id,
            inviter: inviter.public_key().to_hex(),
            inviter_name: request.inviter_name,
            policy: request.policy,
            wrap,
            sig: String::new(),
            exp: request.expires_at,
        };

        let signature = inviter.sign(&invite.signing_bytes()?);
        invite.sig = URL_SAFE_NO_PAD.encode(signature.as_bytes());
        Ok(invite)
    }

    fn signing_bytes(&self) -> Result<Vec<u8>> {
        let fields = SignedFields {
            proto: &self.proto,
            v: self.v,
            t: &self.t,
            thread_id: &self.thread_id,
            inviter: &self.inviter,
            inviter_name: &self.inviter_name,
            policy: self.policy,
            wrap: &self.wrap,
            exp: self.exp,
        };
        let json =
            serde_json::to_vec(&fields).map_err(|e| KeyError::Serialization(e.to_string()))?;

        let mut out = Vec::with_capacity(SIGNING_DOMAIN.len() + json.len());
        out.extend_from_slice(SIGNING_DOMAIN);
        out.extend_from_slice(&json);
        Ok(out)
    }

    /// Encode as a single link path segment.
    pub fn to_link_segment(&self) -> Result<String> {
        let json = serde_json::to_vec(self).map_err(|e| KeyError::Serialization(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Decode a link path segment (either base64 alphabet).
    pub fn from_link_segment(segment: &str) -> Result<Self> {
        let json = decode_base64_any(segment)
            .map_err(|e| KeyError::InvalidInvite(format!("bad segment encoding: {e}")))?;
        serde_json::from_slice(&json).map_err(|e| KeyError::InvalidInvite(e.to_string()))
    }

    /// The shareable link under `base`.
    pub fn to_link(&self, base: &str) -> Result<String> {
        Ok(format!(
            "{}{}{}",
            base.trim_end_matches('/'),
            JOIN_PATH,
            self.to_link_segment()?
        ))
    }

    /// Parse a shareable link, or a bare segment.
    pub fn from_link(link: &str) -> Result<Self> {
        let link = link.trim();
        let tail = match link.rfind(JOIN_PATH) {
            Some(idx) => &link[idx + JOIN_PATH.len()..],
            None => link.rsplit('/').next().unwrap_or(link),
        };
        let segment = tail.split(['?', '#']).next().unwrap_or(tail);
        if segment.is_empty() {
            return Err(KeyError::InvalidInvite("link has no invite segment".into()));
        }
        Self::from_link_segment(segment)
    }

    /// Check protocol tags, expiry and signature.
    pub fn verify(&self, now_secs: u64) -> Result<()> {
        if self.proto != INVITE_PROTO {
            return Err(KeyError::InvalidInvite(format!("unknown proto {}", self.proto)));
        }
        if self.v != INVITE_VERSION {
            return Err(KeyError::InvalidInvite(format!("unsupported version {}", self.v)));
        }
        if self.t != INVITE_TYPE {
            return Err(KeyError::InvalidInvite(format!("unexpected type {}", self.t)));
        }
        if self.thread_id.is_empty() {
            return Err(KeyError::InvalidInvite("empty threadId".into()));
        }
        if now_secs >= self.exp {
            return Err(KeyError::InviteExpired {
                exp: self.exp,
                now: now_secs,
            });
        }

        let inviter = self.inviter_key()?;
        let sig_bytes = decode_base64_any(&self.sig)
            .map_err(|e| KeyError::InvalidInvite(format!("bad signature encoding: {e}")))?;
        let signature = IdentitySignature::from_slice(&sig_bytes)?;
        inviter.verify(&self.signing_bytes()?, &signature)?;
        Ok(())
    }

    /// Verify, then unwrap the thread key with the invitee's secret.
    pub fn accept(&self, invitee_secret: &X25519StaticSecret, now_secs: u64) -> Result<ThreadKey> {
        self.verify(now_secs)?;
        unwrap_key(&self.wrap, invitee_secret)
    }

    pub fn inviter_key(&self) -> Result<IdentityPublicKey> {
        Ok(IdentityPublicKey::from_hex(&self.inviter)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn invite_for(invitee: &X25519StaticSecret, key: &ThreadKey) -> (IdentityKeypair, InvitePayload) {
        let inviter = IdentityKeypair::from_seed(&[1u8; 32]);
        let pk = invitee.public_key();
        let invite = InvitePayload::create(
            &inviter,
            InviteRequest {
                thread_id: ThreadId::new("t1"),
                thread_key: key,
                invitee: &pk,
                policy: IdentityKind::Guest,
                inviter_name: Some("alice".into()),
                expires_at: NOW + 3600,
            },
        )
        .unwrap();
        (inviter, invite)
    }

    #[test]
    fn test_link_roundtrip_and_accept() {
        let invitee = X25519StaticSecret::generate();
        let key = ThreadKey::generate();
        let (inviter, invite) = invite_for(&invitee, &key);

        let link = invite.to_link("https://threadkey.app/").unwrap();
        assert!(link.starts_with("https://threadkey.app/join/"));

        let parsed = InvitePayload::from_link(&link).unwrap();
        assert_eq!(parsed, invite);
        assert_eq!(parsed.inviter, inviter.public_key().to_hex());
        assert_eq!(parsed.accept(&invitee, NOW).unwrap(), key);
    }

    #[test]
    fn test_wire_shape() {
        let invitee = X25519StaticSecret::generate();
        let (_, invite) = invite_for(&invitee, &ThreadKey::generate());
        let json = serde_json::to_value(&invite).unwrap();

        assert_eq!(json["proto"], INVITE_PROTO);
        assert_eq!(json["v"], 1);
        assert_eq!(json["t"], "invite");
        assert_eq!(json["threadId"], "t1");
        assert_eq!(json["inviterName"], "alice");
        assert_eq!(json["policy"], "guest");
    }

    #[test]
    fn test_expired_invite_rejected() {
        let invitee = X25519StaticSecret::generate();
        let (_, invite) = invite_for(&invitee, &ThreadKey::generate());
        assert!(matches!(
            invite.accept(&invitee, NOW + 3600),
            Err(KeyError::InviteExpired { .. })
        ));
    }

    #[test]
    fn test_tampered_policy_breaks_signature() {
        let invitee = X25519StaticSecret::generate();
        let (_, mut invite) = invite_for(&invitee, &ThreadKey::generate());
        invite.policy = IdentityKind::Holder;
        assert!(matches!(invite.verify(NOW), Err(KeyError::Signature(_))));
    }

    #[test]
    fn test_link_with_query_and_bare_segment() {
        let invitee = X25519StaticSecret::generate();
        let (_, invite) = invite_for(&invitee, &ThreadKey::generate());
        let segment = invite.to_link_segment().unwrap();

        let with_query = format!("https://x.test/join/{segment}?ref=qr#top");
        assert_eq!(InvitePayload::from_link(&with_query).unwrap(), invite);
        assert_eq!(InvitePayload::from_link(&segment).unwrap(), invite);
        assert!(InvitePayload::from_link("https://x.test/join/").is_err());
    }

    #[test]
    fn test_wrong_invitee_cannot_accept() {
        let invitee = X25519StaticSecret::generate();
        let (_, invite) = invite_for(&invitee, &ThreadKey::generate());
        let stranger = X25519StaticSecret::generate();
        assert!(matches!(
            invite.accept(&stranger, NOW),
            Err(KeyError::Decryption(_))
        ));
    }
}
