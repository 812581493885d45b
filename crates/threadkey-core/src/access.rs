//! Thread access decisions.
//!
//! [`validate_thread_access`] interprets a [`JoinReceipt`] into an allow or
//! deny verdict together with the outpoints and burn proof that justify it.
//! It never fails: "no access" is an ordinary outcome that callers branch on.

use serde::{Deserialize, Serialize};

use crate::receipt::{BurnProof, JoinReceipt, ReceiptStatus};
use crate::types::{Outpoint, ThreadId};

/// Why access was granted or refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessReason {
    /// A DT issued to the user resolves against a live CT.
    ValidDt,
    /// No DT output names the user.
    NoDtFound,
    /// The thread's CT was burned.
    CtBurned,
}

impl AccessReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessReason::ValidDt => "VALID_DT",
            AccessReason::NoDtFound => "NO_DT_FOUND",
            AccessReason::CtBurned => "CT_BURNED",
        }
    }
}

/// Verdict of an access check, with proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessDecision {
    pub has_access: bool,
    pub reason: AccessReason,
    pub details: String,
    pub ct_outpoint: Option<Outpoint>,
    /// Set only when a matching DT was found.
    pub dt_outpoint: Option<Outpoint>,
    /// Set only when `reason` is [`AccessReason::CtBurned`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burn_proof: Option<BurnProof>,
}

/// Decide whether `user_public_key` may read and write `thread_id`.
///
/// Rules, first match wins:
///
/// 1. burned receipt: denied with [`AccessReason::CtBurned`] and the burn proof;
/// 2. the first issuance (in order) with an output whose recipient equals the
///    user key exactly: granted with [`AccessReason::ValidDt`];
/// 3. otherwise denied with [`AccessReason::NoDtFound`].
///
/// The CT outpoint is reported whenever the receipt has one, whatever the
/// outcome. Blocked receipts follow rules 2 and 3.
pub fn validate_thread_access(
    thread_id: &ThreadId,
    user_public_key: &str,
    receipt: &JoinReceipt,
) -> AccessDecision {
    let ct_outpoint = receipt.ct_outpoint.clone();

    if let ReceiptStatus::Burned(proof) = &receipt.status {
        return AccessDecision {
            has_access: false,
            reason: AccessReason::CtBurned,
            details: format!(
                "control token for thread {} was burned in {} by {}",
                thread_id, proof.burn_txid, proof.burned_by
            ),
            ct_outpoint,
            dt_outpoint: None,
            burn_proof: Some(proof.clone()),
        };
    }

    let found = receipt.dt_issuances.iter().find_map(|issuance| {
        issuance
            .outputs
            .iter()
            .find(|output| output.recipient_pubkey == user_public_key)
            .map(|output| Outpoint::new(issuance.txid.clone(), output.vout))
    });

    match found {
        Some(dt_outpoint) => AccessDecision {
            has_access: true,
            reason: AccessReason::ValidDt,
            details: format!(
                "data token {} resolves against control token {}",
                dt_outpoint,
                ct_label(ct_outpoint.as_ref())
            ),
            ct_outpoint,
            dt_outpoint: Some(dt_outpoint),
            burn_proof: None,
        },
        None => AccessDecision {
            has_access: false,
            reason: AccessReason::NoDtFound,
            details: format!(
                "no data token for {} in thread {}",
                user_public_key, thread_id
            ),
            ct_outpoint,
            dt_outpoint: None,
            burn_proof: None,
        },
    }
}

fn ct_label(ct: Option<&Outpoint>) -> String {
    ct.map(ToString::to_string)
        .unwrap_or_else(|| "(unminted)".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receipt::{DtIssuance, IdentityKind};
    use proptest::prelude::*;

    fn thread() -> ThreadId {
        ThreadId::new("t1")
    }

    #[test]
    fn test_valid_dt_example() {
        let receipt = JoinReceipt::new("t1", IdentityKind::Guest)
            .with_control_token("ct1", 1)
            .with_issuance(DtIssuance::new("dt1", [("U", 0)]));

        let decision = validate_thread_access(&thread(), "U", &receipt);
        assert!(decision.has_access);
        assert_eq!(decision.reason, AccessReason::ValidDt);
        assert_eq!(decision.ct_outpoint, Some(Outpoint::new("ct1", 1)));
        assert_eq!(decision.dt_outpoint, Some(Outpoint::new("dt1", 0)));
        assert!(decision.burn_proof.is_none());
    }

    #[test]
    fn test_first_matching_issuance_wins() {
        let receipt = JoinReceipt::new("t1", IdentityKind::Holder)
            .with_control_token("ct1", 0)
            .with_issuance(DtIssuance::new("dt1", [("A", 0), ("U", 2)]))
            .with_issuance(DtIssuance::new("dt2", [("U", 0)]));

        let decision = validate_thread_access(&thread(), "U", &receipt);
        assert_eq!(decision.dt_outpoint, Some(Outpoint::new("dt1", 2)));
    }

    #[test]
    fn test_match_is_exact() {
        let receipt = JoinReceipt::new("t1", IdentityKind::Guest)
            .with_control_token("ct1", 0)
            .with_issuance(DtIssuance::new("dt1", [("abcd", 0)]));

        let decision = validate_thread_access(&thread(), "ABCD", &receipt);
        assert_eq!(decision.reason, AccessReason::NoDtFound);
        assert!(decision.dt_outpoint.is_none());
    }

    #[test]
    fn test_blocked_receipt_still_resolves_dt() {
        let mut receipt = JoinReceipt::new("t1", IdentityKind::Guest)
            .with_issuance(DtIssuance::new("dt1", [("U", 0)]));
        receipt.block();

        let decision = validate_thread_access(&thread(), "U", &receipt);
        assert!(decision.has_access);
        assert!(decision.ct_outpoint.is_none());
    }

    #[test]
    fn test_decision_serializes_reason_in_wire_form() {
        let receipt = JoinReceipt::new("t1", IdentityKind::Guest);
        let decision = validate_thread_access(&thread(), "U", &receipt);
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["reason"], "NO_DT_FOUND");
        assert_eq!(json["hasAccess"], false);
        assert!(json.get("burnProof").is_none());
    }

    fn arb_issuances() -> impl Strategy<Value = Vec<DtIssuance>> {
        prop::collection::vec(
            (
                "[a-f0-9]{8}",
                prop::collection::vec(("[A-Z]{1,3}", 0u32..8), 0..4),
            )
                .prop_map(|(txid, outputs)| DtIssuance::new(txid, outputs)),
            0..5,
        )
    }

    proptest! {
        #[test]
        fn prop_burned_always_denies(
            issuances in arb_issuances(),
            user in "[A-Z]{1,3}",
            burn_txid in "[a-f0-9]{8}",
            burned_at in any::<i64>(),
            burned_by in "[a-z]{1,8}",
        ) {
            let mut receipt = JoinReceipt::new("t1", IdentityKind::Holder)
                .with_control_token("ct1", 0);
            for issuance in issuances {
                receipt.record_issuance(issuance);
            }
            let proof = BurnProof { burn_txid, burned_at, burned_by };
            receipt.record_burn(proof.clone());

            let decision = validate_thread_access(&thread(), &user, &receipt);
            prop_assert!(!decision.has_access);
            prop_assert_eq!(decision.reason, AccessReason::CtBurned);
            prop_assert_eq!(decision.burn_proof, Some(proof));
            prop_assert!(decision.dt_outpoint.is_none());
            prop_assert_eq!(decision.ct_outpoint, Some(Outpoint::new("ct1", 0)));
        }

        #[test]
        fn prop_unlisted_user_never_has_access(issuances in arb_issuances()) {
            // Generated recipients are uppercase; a lowercase user never matches.
            let mut receipt = JoinReceipt::new("t1", IdentityKind::Guest);
            for issuance in issuances {
                receipt.record_issuance(issuance);
            }

            let decision = validate_thread_access(&thread(), "nobody", &receipt);
            prop_assert!(!decision.has_access);
            prop_assert_eq!(decision.reason, AccessReason::NoDtFound);
            prop_assert!(decision.dt_outpoint.is_none());
        }
    }
}
