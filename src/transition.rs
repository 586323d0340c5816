//! A proposed transition and the digest every required party signs
use std::collections::BTreeSet;

use crate::agreement::{AgreementRecord, DataHash, VersionRef};
use crate::error::{CodecError, ValidationError};
use crate::identity::Identity;
use crate::utils;
use crate::validator::{self, TransitionKind};

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Transition {
    #[n(0)]
    pub kind: TransitionKind,
    #[n(1)]
    pub input: Option<AgreementRecord>, // consumed version, none for create
    #[n(2)]
    pub output: AgreementRecord,
    #[n(3)]
    pub authorizer: Identity,
}

#[derive(minicbor::Encode)]
struct DigestPreimage<'a> {
    #[n(0)]
    kind: TransitionKind,
    #[n(1)]
    consumed: Option<&'a VersionRef>,
    #[n(2)]
    produced: &'a VersionRef,
    #[n(3)]
    data_hash: &'a DataHash,
    #[n(4)]
    authorizer: &'a Identity,
}

impl Transition {
    pub fn new(
        kind: TransitionKind,
        input: Option<AgreementRecord>,
        output: AgreementRecord,
        authorizer: Identity,
    ) -> Self {
        Self {
            kind,
            input,
            output,
            authorizer,
        }
    }

    /// Hex sha256 over the transition metadata and the output's version, which in
    /// turn covers the data hash and the rest of the unsigned record.
    pub fn digest(&self) -> Result<String, CodecError> {
        let preimage = DigestPreimage {
            kind: self.kind,
            consumed: self.consumed(),
            produced: self.produced(),
            data_hash: self.output.data_hash(),
            authorizer: &self.authorizer,
        };
        let (hash, _) = utils::digest_cbor("transition digest", &preimage)?;
        Ok(hash)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validator::validate(
            self.kind,
            self.input.as_ref(),
            Some(&self.output),
            &self.authorizer,
        )
    }

    pub fn consumed(&self) -> Option<&VersionRef> {
        self.input.as_ref().map(AgreementRecord::version_ref)
    }

    pub fn produced(&self) -> &VersionRef {
        self.output.version_ref()
    }

    pub fn required_signers(&self) -> BTreeSet<Identity> {
        required_signers(self.kind, &self.output)
    }
}

/// Identities whose signature must be collected before certification.
///
/// For accept and reject the buyer's authorisation is the transition itself, so
/// only the seller countersigns.
pub fn required_signers(kind: TransitionKind, output: &AgreementRecord) -> BTreeSet<Identity> {
    match kind {
        TransitionKind::Create | TransitionKind::Update => {
            BTreeSet::from([output.seller().clone(), output.buyer().clone()])
        }
        TransitionKind::Accept | TransitionKind::Reject => {
            BTreeSet::from([output.seller().clone()])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Party;

    #[test]
    fn digest_binds_kind_and_output() {
        let buyer = Party::from_seed("buyer", [1; 32]).unwrap();
        let seller = Party::from_seed("seller", [2; 32]).unwrap();
        let v1 = AgreementRecord::propose(
            buyer.identity().clone(),
            seller.identity().clone(),
            DataHash::new("h1"),
        )
        .unwrap();

        let accept = Transition::new(
            TransitionKind::Accept,
            Some(v1.clone()),
            v1.accepted().unwrap(),
            buyer.identity().clone(),
        );
        let reject = Transition::new(
            TransitionKind::Reject,
            Some(v1.clone()),
            v1.rejected().unwrap(),
            buyer.identity().clone(),
        );

        assert_ne!(accept.digest().unwrap(), reject.digest().unwrap());
        assert_eq!(accept.digest().unwrap(), accept.clone().digest().unwrap());
        assert_eq!(accept.consumed(), Some(v1.version_ref()));
    }

    #[test]
    fn signature_slots_do_not_change_the_digest() {
        let buyer = Party::from_seed("buyer", [1; 32]).unwrap();
        let seller = Party::from_seed("seller", [2; 32]).unwrap();
        let v1 = AgreementRecord::propose(
            buyer.identity().clone(),
            seller.identity().clone(),
            DataHash::new("h1"),
        )
        .unwrap();
        let unsigned = Transition::new(
            TransitionKind::Create,
            None,
            v1.clone(),
            seller.identity().clone(),
        );
        let digest = unsigned.digest().unwrap();
        let signed = Transition::new(
            TransitionKind::Create,
            None,
            v1.with_signature(&seller.endorse(digest.as_bytes())),
            seller.identity().clone(),
        );

        assert_eq!(digest, signed.digest().unwrap());
    }

    #[test]
    fn required_signers_by_kind() {
        let buyer = Party::from_seed("buyer", [1; 32]).unwrap();
        let seller = Party::from_seed("seller", [2; 32]).unwrap();
        let v1 = AgreementRecord::propose(
            buyer.identity().clone(),
            seller.identity().clone(),
            DataHash::new("h1"),
        )
        .unwrap();

        let create = required_signers(TransitionKind::Create, &v1);
        let accept = required_signers(TransitionKind::Accept, &v1);

        assert_eq!(create.len(), 2);
        assert!(create.contains(buyer.identity()));
        assert_eq!(accept, BTreeSet::from([seller.identity().clone()]));
    }
}
