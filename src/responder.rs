//! Counterparty side of the protocol: veto or countersign, then record finality
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, instrument, warn};

use crate::agreement::{AgreementId, AgreementRecord, VersionRef};
use crate::error::{ConflictError, NegotiationError, StoreError, ValidationError};
use crate::identity::{Identity, Party};
use crate::store::{AgreementStore, Appended, CommittedVersion};
use crate::transport::{SignatureRequest, SignatureResponse};

pub const ANSWER_CACHE_CAPACITY: usize = 1024;

struct Answer {
    consumed: Option<VersionRef>,
    produced: VersionRef,
    response: SignatureResponse,
}

/// Answers already given, keyed by transition digest. Oldest entries go first once
/// the capacity is reached.
struct AnswerCache {
    answers: HashMap<String, Answer>,
    order: VecDeque<String>,
    capacity: usize,
}

impl AnswerCache {
    fn new(capacity: usize) -> Self {
        Self {
            answers: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, digest: &str) -> Option<&SignatureResponse> {
        self.answers.get(digest).map(|answer| &answer.response)
    }

    fn insert(&mut self, digest: String, answer: Answer) {
        if self.answers.insert(digest.clone(), answer).is_none() {
            self.order.push_back(digest);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.answers.remove(&oldest);
            }
        }
    }

    /// Drops every answer about a transition that spent the same input as
    /// `record`, or produced it.
    fn forget_committed(&mut self, record: &AgreementRecord) {
        let consumed = record.previous();
        let produced = record.version_ref();
        self.answers.retain(|_, answer| {
            answer.produced != *produced
                && (consumed.is_none() || answer.consumed.as_ref() != consumed)
        });
        self.order.retain(|digest| self.answers.contains_key(digest));
    }

    fn len(&self) -> usize {
        self.answers.len()
    }
}

pub struct Responder {
    party: Arc<Party>,
    store: AgreementStore,
    notary: Identity,
    answered: Mutex<AnswerCache>,
}

impl Responder {
    pub fn new(party: Arc<Party>, store: AgreementStore, notary: Identity) -> Self {
        Self::with_capacity(party, store, notary, ANSWER_CACHE_CAPACITY)
    }

    pub fn with_capacity(
        party: Arc<Party>,
        store: AgreementStore,
        notary: Identity,
        capacity: usize,
    ) -> Self {
        Self {
            party,
            store,
            notary,
            answered: Mutex::new(AnswerCache::new(capacity)),
        }
    }

    /// Countersigns the transition unless one of the local checks fails.
    /// A repeated request gets the same answer as the first delivery while its
    /// input is still unspent.
    #[instrument(skip_all, fields(party = %self.party.name(), kind = %request.transition.kind))]
    pub fn handle_request(&self, request: &SignatureRequest) -> SignatureResponse {
        let digest = match request.transition.digest() {
            Ok(digest) => digest,
            Err(e) => {
                return SignatureResponse::Refused {
                    reason: format!("malformed transition: {e}"),
                };
            }
        };

        let mut answered = self.answers();
        if let Some(previous) = answered.get(&digest) {
            debug!("duplicate signature request");
            return previous.clone();
        }

        let response = match self.check(request, &digest) {
            Ok(()) => SignatureResponse::Signed(self.party.endorse(digest.as_bytes())),
            Err(reason) => {
                warn!(%reason, "refusing to countersign");
                SignatureResponse::Refused { reason }
            }
        };
        answered.insert(
            digest,
            Answer {
                consumed: request.transition.consumed().cloned(),
                produced: request.transition.produced().clone(),
                response: response.clone(),
            },
        );

        response
    }

    fn check(&self, request: &SignatureRequest, digest: &str) -> Result<(), String> {
        let transition = &request.transition;

        if !transition.output.verify_version_ref() {
            return Err("output does not match its version ref".into());
        }
        if let Some(input) = &transition.input {
            if !input.verify_version_ref() {
                return Err("input does not match its version ref".into());
            }
        }
        if !transition.output.is_participant(self.party.identity()) {
            return Err("not a participant of this agreement".into());
        }
        if request.proposer.signer != transition.authorizer
            || !request.proposer.verify(digest.as_bytes())
        {
            return Err("proposer signature does not verify".into());
        }

        transition.validate().map_err(|e| e.to_string())?;

        if let Some(input) = &transition.input {
            let current = self
                .store
                .load(input.id())
                .map_err(|e| format!("local ledger unavailable: {e}"))?;
            match current {
                Some(current) if current.record.version_ref() == input.version_ref() => {}
                Some(current) => {
                    return Err(format!(
                        "input {} is not the current version {}",
                        input.version_ref(),
                        current.record.version_ref()
                    ));
                }
                None => return Err(format!("unknown agreement {}", input.id())),
            }
        }

        Ok(())
    }

    /// Records a version the notary finalised. Safe to call more than once.
    ///
    /// The version must follow the local current one, be a legal transition from
    /// it, and carry a verifying signature from every required signer and from
    /// its authorizer.
    #[instrument(skip_all, fields(party = %self.party.name(), version = %committed.record.version_ref()))]
    pub fn accept_committed(
        &self,
        committed: &CommittedVersion,
    ) -> Result<Appended, NegotiationError> {
        let record = &committed.record;
        committed.certificate.verify(&self.notary)?;
        if !record.verify_version_ref() {
            return Err(ConflictError::InvalidCertificate(
                "record does not match its version ref".into(),
            )
            .into());
        }
        if committed.certificate.produced != *record.version_ref()
            || committed.certificate.consumed.as_ref() != record.previous()
        {
            return Err(ConflictError::InvalidCertificate(
                "certificate does not cover this version".into(),
            )
            .into());
        }
        if !record.is_participant(self.party.identity()) {
            return Err(ValidationError::NotAParticipant(self.party.identity().clone()).into());
        }
        if self.store.version(record.version_ref())?.is_some() {
            return Ok(Appended::AlreadyPresent);
        }

        let input = match record.previous() {
            Some(previous) => match self.store.load(record.id())? {
                Some(current) if current.record.version_ref() == previous => Some(current.record),
                current => {
                    return Err(StoreError::Stale {
                        id: record.id().clone(),
                        expected: Some(previous.clone()),
                        found: current.map(|c| c.record.version_ref().clone()),
                    }
                    .into());
                }
            },
            None => None,
        };

        let transition = committed.transition(input);
        transition.validate()?;
        let digest = transition.digest()?;
        let mut signers = transition.required_signers();
        signers.insert(transition.authorizer.clone());
        for signer in signers {
            let endorsed = record
                .signature_of(&signer)
                .is_some_and(|signature| signer.verifies(digest.as_bytes(), signature));
            if !endorsed {
                return Err(ValidationError::MissingEndorsement { signer }.into());
            }
        }

        let appended = self.store.append(committed)?;
        self.answers().forget_committed(record);

        Ok(appended)
    }

    /// Applies a lineage fetched from a peer, newest version first as
    /// [`AgreementStore::history`] returns it. Returns how many versions were new.
    pub fn catch_up(&self, lineage: &[CommittedVersion]) -> Result<usize, NegotiationError> {
        let mut recorded = 0;
        for committed in lineage.iter().rev() {
            if self.accept_committed(committed)? == Appended::Recorded {
                recorded += 1;
            }
        }
        Ok(recorded)
    }

    pub fn history(&self, id: &AgreementId) -> Result<Vec<CommittedVersion>, StoreError> {
        self.store.history(id)
    }

    pub fn identity(&self) -> &Identity {
        self.party.identity()
    }

    fn answers(&self) -> MutexGuard<'_, AnswerCache> {
        self.answered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agreement::{DataHash, Status};
    use crate::notary::{Notary, OrderingAuthority};
    use crate::transition::Transition;
    use crate::validator::TransitionKind;

    struct Fixture {
        notary: Notary,
        buyer: Arc<Party>,
        seller: Arc<Party>,
        responder: Responder,
        v1: AgreementRecord,
    }

    fn fixture(capacity: usize) -> Fixture {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let notary = Notary::open(Party::from_seed("notary", [9; 32]).unwrap(), &db).unwrap();
        let buyer = Arc::new(Party::from_seed("buyer", [1; 32]).unwrap());
        let seller = Arc::new(Party::from_seed("seller", [2; 32]).unwrap());
        let responder = Responder::with_capacity(
            buyer.clone(),
            AgreementStore::open(&db, "buyer").unwrap(),
            notary.identity().clone(),
            capacity,
        );
        let v1 = AgreementRecord::propose(
            buyer.identity().clone(),
            seller.identity().clone(),
            DataHash::new("h1"),
        )
        .unwrap();
        Fixture {
            notary,
            buyer,
            seller,
            responder,
            v1,
        }
    }

    async fn certify(
        notary: &Notary,
        transition: &Transition,
        signers: &[&Party],
    ) -> CommittedVersion {
        let digest = transition.digest().unwrap();
        let record = signers.iter().fold(transition.output.clone(), |record, party| {
            record.with_signature(&party.endorse(digest.as_bytes()))
        });
        let certificate = notary
            .certify(transition.consumed().cloned(), transition.produced().clone())
            .await
            .unwrap();
        CommittedVersion {
            record,
            certificate,
            kind: transition.kind,
            authorizer: transition.authorizer.clone(),
        }
    }

    async fn created(f: &Fixture) -> CommittedVersion {
        let create = Transition::new(
            TransitionKind::Create,
            None,
            f.v1.clone(),
            f.seller.identity().clone(),
        );
        certify(&f.notary, &create, &[&f.seller, &f.buyer]).await
    }

    #[tokio::test]
    async fn records_a_fully_signed_lineage() {
        let f = fixture(8);
        let v1 = created(&f).await;
        assert_eq!(f.responder.accept_committed(&v1).unwrap(), Appended::Recorded);

        let accept = Transition::new(
            TransitionKind::Accept,
            Some(f.v1.clone()),
            f.v1.accepted().unwrap(),
            f.buyer.identity().clone(),
        );
        let v2 = certify(&f.notary, &accept, &[&f.buyer, &f.seller]).await;
        assert_eq!(f.responder.accept_committed(&v2).unwrap(), Appended::Recorded);
        assert_eq!(f.responder.accept_committed(&v2).unwrap(), Appended::AlreadyPresent);
        assert_eq!(f.responder.history(f.v1.id()).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn refuses_decisions_the_buyer_never_signed() {
        let f = fixture(8);
        f.responder.accept_committed(&created(&f).await).unwrap();

        // the seller accepting on the buyer's behalf
        let by_seller = Transition::new(
            TransitionKind::Accept,
            Some(f.v1.clone()),
            f.v1.accepted().unwrap(),
            f.seller.identity().clone(),
        );
        let forged = certify(&f.notary, &by_seller, &[&f.seller]).await;
        let res = f.responder.accept_committed(&forged);
        assert!(matches!(
            res,
            Err(NegotiationError::Validation(
                ValidationError::UnauthorizedSigner { .. }
            ))
        ));

        // the same acceptance claimed in the buyer's name carries no buyer signature
        let claimed = CommittedVersion {
            authorizer: f.buyer.identity().clone(),
            ..forged
        };
        let res = f.responder.accept_committed(&claimed);
        assert!(matches!(
            res,
            Err(NegotiationError::Validation(
                ValidationError::MissingEndorsement { .. }
            ))
        ));

        let history = f.responder.history(f.v1.id()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].record.status(), Status::Proposed);
    }

    #[tokio::test]
    async fn version_ahead_of_the_local_ledger_is_stale() {
        let f = fixture(8);
        let v1 = created(&f).await;
        let update = Transition::new(
            TransitionKind::Update,
            Some(f.v1.clone()),
            f.v1.amended(DataHash::new("h2")).unwrap(),
            f.seller.identity().clone(),
        );
        let v2 = certify(&f.notary, &update, &[&f.seller, &f.buyer]).await;

        let res = f.responder.accept_committed(&v2);
        assert!(matches!(
            res,
            Err(NegotiationError::Store(StoreError::Stale { .. }))
        ));

        // newest first, as a peer's history comes back
        assert_eq!(f.responder.catch_up(&[v2.clone(), v1]).unwrap(), 2);
        assert_eq!(f.responder.catch_up(&[v2]).unwrap(), 0);
    }

    #[tokio::test]
    async fn committing_forgets_answers_about_the_spent_input() {
        let f = fixture(8);
        f.responder.accept_committed(&created(&f).await).unwrap();

        let update = Transition::new(
            TransitionKind::Update,
            Some(f.v1.clone()),
            f.v1.amended(DataHash::new("h2")).unwrap(),
            f.seller.identity().clone(),
        );
        let digest = update.digest().unwrap();
        let request = SignatureRequest {
            transition: update.clone(),
            proposer: f.seller.endorse(digest.as_bytes()),
        };
        assert!(matches!(
            f.responder.handle_request(&request),
            SignatureResponse::Signed(_)
        ));
        assert_eq!(f.responder.answers().len(), 1);

        let v2 = certify(&f.notary, &update, &[&f.seller, &f.buyer]).await;
        f.responder.accept_committed(&v2).unwrap();
        assert_eq!(f.responder.answers().len(), 0);
    }

    #[test]
    fn answer_cache_evicts_the_oldest() {
        let mut cache = AnswerCache::new(2);
        for n in 0..3 {
            cache.insert(
                format!("d{n}"),
                Answer {
                    consumed: None,
                    produced: VersionRef::from(format!("v{n}").as_str()),
                    response: SignatureResponse::Refused {
                        reason: format!("r{n}"),
                    },
                },
            );
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.get("d0").is_none());
        assert!(cache.get("d2").is_some());
    }
}
