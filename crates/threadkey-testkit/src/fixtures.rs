//! Test fixtures and helpers.
//!
//! Common setup code for integration tests: deterministic participants, a
//! thread whose receipt names every member, and clients wired to a shared
//! in-process relay.

use std::sync::Arc;

use threadkey::{ClientConfig, ThreadClient};
use threadkey_core::{BurnProof, DtIssuance, IdentityKeypair, IdentityKind, JoinReceipt, ThreadId};
use threadkey_keys::{InvitePayload, InviteRequest, ThreadKey, X25519StaticSecret};
use threadkey_relay::{MemoryRelay, MemoryTransportFactory, RelayMode, TransportConfig, TransportManager};
use threadkey_store::MemoryStore;

/// Far-future expiry for fixture invites (2100-01-01).
pub const FIXTURE_INVITE_EXP: u64 = 4_102_444_800;

/// A client over [`MemoryStore`] and the in-process relay.
pub type MemoryClient = ThreadClient<MemoryStore, MemoryTransportFactory>;

/// One participant's secrets.
pub struct TestParticipant {
    pub identity: IdentityKeypair,
    pub exchange: X25519StaticSecret,
    seed: [u8; 32],
}

impl TestParticipant {
    /// Create with deterministic keys from seed.
    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self {
            identity: IdentityKeypair::from_seed(&seed),
            exchange: X25519StaticSecret::from_bytes(exchange_seed(&seed)),
            seed,
        }
    }

    /// Hex identity public key.
    pub fn pubkey(&self) -> String {
        self.identity.public_key().to_hex()
    }

    /// A client for this participant with its own store and manager.
    pub fn client(&self, relay: &Arc<MemoryRelay>, mode: RelayMode) -> MemoryClient {
        let config = ClientConfig {
            transport: TransportConfig::new(mode, "relay.test", self.pubkey()),
            ..ClientConfig::default()
        };
        let manager = Arc::new(TransportManager::new(MemoryTransportFactory::new(Arc::clone(relay))));
        match ThreadClient::new(
            IdentityKeypair::from_seed(&self.seed),
            X25519StaticSecret::from_bytes(exchange_seed(&self.seed)),
            MemoryStore::new(),
            manager,
            config,
        ) {
            Ok(client) => client,
            Err(err) => panic!("fixture client rejected its config: {err}"),
        }
    }
}

/// Exchange secret seed, distinct from the identity seed.
fn exchange_seed(seed: &[u8; 32]) -> [u8; 32] {
    let mut out = *seed;
    out.reverse();
    out[0] ^= 0x5a;
    out
}

/// A thread with a control token and one DT per member.
pub struct ThreadFixture {
    pub thread_id: ThreadId,
    pub key: ThreadKey,
    pub members: Vec<TestParticipant>,
}

impl ThreadFixture {
    /// A thread shared by `count` deterministic members.
    pub fn new(name: &str, count: usize) -> Self {
        Self {
            thread_id: ThreadId::new(name),
            key: ThreadKey::generate(),
            members: multi_party(count),
        }
    }

    /// A thread with a random id.
    pub fn random(count: usize) -> Self {
        let id = hex::encode(rand::random::<[u8; 8]>());
        Self::new(&format!("thread-{id}"), count)
    }

    pub fn member(&self, index: usize) -> &TestParticipant {
        &self.members[index]
    }

    /// Receipt naming every member in one issuance (vout = index + 1).
    pub fn receipt(&self) -> JoinReceipt {
        let outputs = self
            .members
            .iter()
            .enumerate()
            .map(|(i, m)| (m.pubkey(), i as u32 + 1));
        JoinReceipt::new(self.thread_id.clone(), IdentityKind::Guest)
            .with_control_token(format!("ct-{}", self.thread_id), 0)
            .with_issuance(DtIssuance::new(format!("dt-{}", self.thread_id), outputs))
    }

    /// The receipt after the first member burned the CT.
    pub fn burned_receipt(&self) -> JoinReceipt {
        let mut receipt = self.receipt();
        receipt.record_burn(BurnProof {
            burn_txid: format!("burn-{}", self.thread_id),
            burned_at: 1_700_000_000_000,
            burned_by: self.member(0).pubkey(),
        });
        receipt
    }

    /// Invite signed by `inviter` carrying the thread key for `invitee`.
    pub fn invite(&self, inviter: usize, invitee: usize) -> InvitePayload {
        let invitee = self.member(invitee).exchange.public_key();
        let request = InviteRequest {
            thread_id: self.thread_id.clone(),
            thread_key: &self.key,
            invitee: &invitee,
            policy: IdentityKind::Guest,
            inviter_name: None,
            expires_at: FIXTURE_INVITE_EXP,
        };
        match InvitePayload::create(&self.member(inviter).identity, request) {
            Ok(invite) => invite,
            Err(err) => panic!("fixture invite failed: {err}"),
        }
    }
}

/// Create multiple participants for multi-party tests.
pub fn multi_party(count: usize) -> Vec<TestParticipant> {
    (0..count)
        .map(|i| {
            let mut seed = [0u8; 32];
            seed[0] = i as u8 + 1;
            TestParticipant::with_seed(seed)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadkey_core::{validate_thread_access, AccessReason};

    #[test]
    fn test_every_member_has_access() {
        let fixture = ThreadFixture::new("t1", 3);
        let receipt = fixture.receipt();
        for member in &fixture.members {
            let decision = validate_thread_access(&fixture.thread_id, &member.pubkey(), &receipt);
            assert_eq!(decision.reason, AccessReason::ValidDt);
        }
    }

    #[test]
    fn test_burned_receipt_denies_everyone() {
        let fixture = ThreadFixture::new("t1", 2);
        let receipt = fixture.burned_receipt();
        let decision = validate_thread_access(&fixture.thread_id, &fixture.member(1).pubkey(), &receipt);
        assert_eq!(decision.reason, AccessReason::CtBurned);
    }

    #[test]
    fn test_invite_carries_thread_key() {
        let fixture = ThreadFixture::random(2);
        let invite = fixture.invite(0, 1);
        let key = invite.accept(&fixture.member(1).exchange, 1_700_000_000).unwrap();
        assert_eq!(key, fixture.key);
    }

    #[test]
    fn test_multi_party_keys_differ() {
        let parties = multi_party(3);
        assert_ne!(parties[0].pubkey(), parties[1].pubkey());
        assert_ne!(parties[1].pubkey(), parties[2].pubkey());
        assert_ne!(
            parties[0].exchange.public_key(),
            parties[1].exchange.public_key()
        );
    }

    #[tokio::test]
    async fn test_client_is_wired_to_member_identity() {
        let relay = MemoryRelay::new();
        let fixture = ThreadFixture::new("t1", 1);
        let client = fixture.member(0).client(&relay, RelayMode::DirectRelay);
        assert_eq!(client.identity_key(), fixture.member(0).pubkey());
        assert_eq!(client.exchange_public_key(), fixture.member(0).exchange.public_key());
    }
}
