//! Proptest generators for Threadkey types.

use proptest::prelude::*;

use threadkey_core::{BurnProof, DtIssuance, IdentityKeypair, IdentityKind, JoinReceipt, ThreadId};
use threadkey_keys::{ThreadKey, X25519StaticSecret};

/// Generate a random identity keypair.
pub fn identity() -> impl Strategy<Value = IdentityKeypair> {
    any::<[u8; 32]>().prop_map(|seed| IdentityKeypair::from_seed(&seed))
}

/// Generate a hex public key (64 lowercase hex chars).
pub fn pubkey_hex() -> impl Strategy<Value = String> {
    any::<[u8; 32]>().prop_map(hex::encode)
}

/// Generate a transaction id.
pub fn txid() -> impl Strategy<Value = String> {
    any::<[u8; 32]>().prop_map(hex::encode)
}

pub fn thread_id() -> impl Strategy<Value = ThreadId> {
    "[a-z0-9][a-z0-9-]{0,23}".prop_map(ThreadId::new)
}

pub fn identity_kind() -> impl Strategy<Value = IdentityKind> {
    prop_oneof![Just(IdentityKind::Guest), Just(IdentityKind::Holder)]
}

pub fn thread_key() -> impl Strategy<Value = ThreadKey> {
    any::<[u8; 32]>().prop_map(ThreadKey::from_bytes)
}

pub fn exchange_secret() -> impl Strategy<Value = X25519StaticSecret> {
    any::<[u8; 32]>().prop_map(X25519StaticSecret::from_bytes)
}

/// Generate one DT issuance with up to `max_outputs` recipients.
pub fn dt_issuance(max_outputs: usize) -> impl Strategy<Value = DtIssuance> {
    (
        txid(),
        prop::collection::vec((pubkey_hex(), 0u32..16), 0..=max_outputs),
    )
        .prop_map(|(txid, outputs)| DtIssuance::new(txid, outputs))
}

/// Parameters for generating a receipt.
#[derive(Debug, Clone)]
pub struct ReceiptParams {
    pub thread_id: ThreadId,
    pub kind: IdentityKind,
    pub ct: Option<(String, u32)>,
    pub issuances: Vec<DtIssuance>,
    pub burn: Option<BurnProof>,
}

impl Arbitrary for ReceiptParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            thread_id(),
            identity_kind(),
            proptest::option::of((txid(), 0u32..4)),
            prop::collection::vec(dt_issuance(4), 0..4),
            proptest::option::of((txid(), 0i64..=1_700_000_000_000i64, pubkey_hex())),
        )
            .prop_map(|(thread_id, kind, ct, issuances, burn)| ReceiptParams {
                thread_id,
                kind,
                ct,
                issuances,
                burn: burn.map(|(burn_txid, burned_at, burned_by)| BurnProof {
                    burn_txid,
                    burned_at,
                    burned_by,
                }),
            })
            .boxed()
    }
}

impl ReceiptParams {
    /// Every recipient named by any issuance, in issuance order.
    pub fn recipients(&self) -> Vec<String> {
        self.issuances
            .iter()
            .flat_map(|issuance| issuance.outputs.iter().map(|o| o.recipient_pubkey.clone()))
            .collect()
    }
}

/// Build a receipt from parameters.
pub fn receipt_from_params(params: &ReceiptParams) -> JoinReceipt {
    let mut receipt = JoinReceipt::new(params.thread_id.clone(), params.kind);
    if let Some((txid, vout)) = &params.ct {
        receipt = receipt.with_control_token(txid.clone(), *vout);
    }
    for issuance in &params.issuances {
        receipt.record_issuance(issuance.clone());
    }
    if let Some(proof) = &params.burn {
        receipt.record_burn(proof.clone());
    }
    receipt
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadkey_core::{validate_thread_access, AccessReason};

    proptest! {
        #[test]
        fn test_access_follows_recipients_and_burn(params: ReceiptParams, outsider in pubkey_hex()) {
            let receipt = receipt_from_params(&params);
            let recipients = params.recipients();

            for user in recipients.iter().chain(std::iter::once(&outsider)) {
                let decision = validate_thread_access(&params.thread_id, user, &receipt);
                let expected = if params.burn.is_some() {
                    AccessReason::CtBurned
                } else if recipients.contains(user) {
                    AccessReason::ValidDt
                } else {
                    AccessReason::NoDtFound
                };
                prop_assert_eq!(decision.reason, expected);
                prop_assert_eq!(decision.has_access, expected == AccessReason::ValidDt);
                prop_assert_eq!(decision.ct_outpoint.is_some(), params.ct.is_some());
            }
        }

        #[test]
        fn test_sealed_body_is_bound_to_thread(
            key in thread_key(),
            a in thread_id(),
            b in thread_id(),
            body in prop::collection::vec(any::<u8>(), 0..256),
        ) {
            prop_assume!(a != b);
            let sealed = key.seal(a.as_str(), &body).unwrap();
            prop_assert_eq!(key.open(a.as_str(), &sealed).unwrap(), body);
            prop_assert!(key.open(b.as_str(), &sealed).is_err());
        }

        #[test]
        fn test_wrap_only_opens_for_recipient(
            key in thread_key(),
            recipient in exchange_secret(),
            other in exchange_secret(),
        ) {
            prop_assume!(recipient.public_key() != other.public_key());
            let wrapped = threadkey_keys::wrap_key(&key, &recipient.public_key()).unwrap();
            prop_assert_eq!(threadkey_keys::unwrap_key(&wrapped, &recipient).unwrap(), key);
            prop_assert!(threadkey_keys::unwrap_key(&wrapped, &other).is_err());
        }
    }
}
