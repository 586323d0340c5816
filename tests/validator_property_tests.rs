//! Property-based tests for the agreement transition rules
//!
//! Parties are derived from random seeds and records are built in whichever status
//! the rule under test needs. Each property must hold for every generated case,
//! not just the happy path.

use proptest::prelude::*;
use sale_agreement::{
    agreement::{AgreementRecord, DataHash, Status},
    error::ValidationError,
    identity::{Identity, Party},
    validator::{TransitionKind, validate},
};

// PROPERTY TEST STRATEGIES

/// Strategy to generate a party from a random 32 byte seed
fn party_strategy() -> impl Strategy<Value = Party> {
    any::<[u8; 32]>().prop_map(|seed| Party::from_seed("party", seed).unwrap())
}

/// Strategy to generate opaque payload hashes
fn data_hash_strategy() -> impl Strategy<Value = DataHash> {
    "[0-9a-f]{64}".prop_map(DataHash::new)
}

/// Strategy to pick one of the three possible statuses
fn status_strategy() -> impl Strategy<Value = Status> {
    prop_oneof![
        Just(Status::Proposed),
        Just(Status::Accepted),
        Just(Status::Rejected),
    ]
}

/// Build a record in `status` by deciding a fresh proposal.
fn record_in(status: Status, buyer: &Identity, seller: &Identity, hash: DataHash) -> AgreementRecord {
    let proposed = AgreementRecord::propose(buyer.clone(), seller.clone(), hash).unwrap();
    match status {
        Status::Proposed => proposed,
        Status::Accepted => proposed.accepted().unwrap(),
        Status::Rejected => proposed.rejected().unwrap(),
    }
}

// PROPERTY TESTS
proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: a seller-authorised create succeeds iff the parties differ and the
    /// output is proposed
    ///
    /// Buyer and seller are drawn independently, and half of the cases reuse the
    /// seller as buyer to exercise the self-dealing rule.
    #[test]
    fn create_succeeds_iff_distinct_and_proposed(
        buyer in party_strategy(),
        seller in party_strategy(),
        self_dealing in any::<bool>(),
        status in status_strategy(),
        hash in data_hash_strategy(),
    ) {
        let buyer_id = if self_dealing { seller.identity().clone() } else { buyer.identity().clone() };
        let output = record_in(status, &buyer_id, seller.identity(), hash);
        let res = validate(TransitionKind::Create, None, Some(&output), seller.identity());

        let expected_ok = buyer_id != *seller.identity() && status == Status::Proposed;
        prop_assert_eq!(res.is_ok(), expected_ok);
        if buyer_id == *seller.identity() {
            prop_assert_eq!(res, Err(ValidationError::BuyerEqualsSeller));
        }
    }

    /// Property: accepting a proposed contract succeeds iff the buyer authorises it
    ///
    /// Anyone else, including the seller, is turned away with UnauthorizedSigner.
    #[test]
    fn accept_succeeds_iff_buyer_authorises(
        buyer in party_strategy(),
        seller in party_strategy(),
        outsider in party_strategy(),
        who in 0u8..3,
        hash in data_hash_strategy(),
    ) {
        prop_assume!(buyer.identity() != seller.identity());
        let input = record_in(Status::Proposed, buyer.identity(), seller.identity(), hash);
        let output = input.accepted().unwrap();
        let authorizer = match who {
            0 => buyer.identity(),
            1 => seller.identity(),
            _ => outsider.identity(),
        };

        let res = validate(TransitionKind::Accept, Some(&input), Some(&output), authorizer);

        if authorizer == buyer.identity() {
            prop_assert!(res.is_ok());
        } else {
            let unauthorised = matches!(res, Err(ValidationError::UnauthorizedSigner { .. }));
            prop_assert!(unauthorised);
        }
    }

    /// Property: a rejected contract can never be updated
    ///
    /// Whatever output is offered and whoever authorises it, the answer is
    /// RejectedContractImmutable.
    #[test]
    fn rejected_contract_is_immutable(
        buyer in party_strategy(),
        seller in party_strategy(),
        anyone in party_strategy(),
        output_status in status_strategy(),
        first in data_hash_strategy(),
        second in data_hash_strategy(),
    ) {
        prop_assume!(buyer.identity() != seller.identity());
        let input = record_in(Status::Rejected, buyer.identity(), seller.identity(), first);
        let output = record_in(output_status, buyer.identity(), seller.identity(), second);

        for authorizer in [buyer.identity(), seller.identity(), anyone.identity()] {
            let res = validate(TransitionKind::Update, Some(&input), Some(&output), authorizer);
            prop_assert_eq!(res, Err(ValidationError::RejectedContractImmutable));

            let amended = input.amended(DataHash::new("new terms")).unwrap();
            let res = validate(TransitionKind::Update, Some(&input), Some(&amended), authorizer);
            prop_assert_eq!(res, Err(ValidationError::RejectedContractImmutable));
        }
    }

    /// Property: an accepted contract can never be updated
    ///
    /// Amended terms, re-opened proposals and foreign records alike are turned away
    /// with AcceptedContractImmutable, whoever authorises them.
    #[test]
    fn accepted_contract_is_immutable(
        buyer in party_strategy(),
        seller in party_strategy(),
        anyone in party_strategy(),
        output_status in status_strategy(),
        first in data_hash_strategy(),
        second in data_hash_strategy(),
    ) {
        prop_assume!(buyer.identity() != seller.identity());
        let input = record_in(Status::Accepted, buyer.identity(), seller.identity(), first);
        let output = record_in(output_status, buyer.identity(), seller.identity(), second.clone());
        let amended = input.amended(second).unwrap();

        for authorizer in [buyer.identity(), seller.identity(), anyone.identity()] {
            for candidate in [&output, &amended] {
                let res = validate(TransitionKind::Update, Some(&input), Some(candidate), authorizer);
                prop_assert_eq!(res, Err(ValidationError::AcceptedContractImmutable));
            }
        }
    }

    /// Property: decisions only apply to proposed contracts
    ///
    /// Once accepted or rejected, neither accept nor reject can follow, even when the
    /// buyer asks.
    #[test]
    fn terminal_contracts_cannot_be_decided(
        buyer in party_strategy(),
        seller in party_strategy(),
        terminal in prop_oneof![Just(Status::Accepted), Just(Status::Rejected)],
        kind in prop_oneof![Just(TransitionKind::Accept), Just(TransitionKind::Reject)],
        hash in data_hash_strategy(),
    ) {
        prop_assume!(buyer.identity() != seller.identity());
        let input = record_in(terminal, buyer.identity(), seller.identity(), hash);
        let output = match kind {
            TransitionKind::Accept => input.accepted().unwrap(),
            _ => input.rejected().unwrap(),
        };

        let res = validate(kind, Some(&input), Some(&output), buyer.identity());
        prop_assert_eq!(res, Err(ValidationError::StatusNotProposed { found: terminal }));
    }
}
