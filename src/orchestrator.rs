//! Drives one proposal from draft to a certified, recorded version
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::agreement::{AgreementId, AgreementRecord, DataHash};
use crate::collector::SignatureCollector;
use crate::config::NegotiationConfig;
use crate::error::{AbortReason, CollectionError, ConflictError, NegotiationError, StoreError};
use crate::identity::{Identity, IdentityResolver, Party};
use crate::notary::{CommitCertificate, OrderingAuthority};
use crate::responder::Responder;
use crate::store::{AgreementStore, Appended, CommittedVersion};
use crate::transition::Transition;
use crate::transport::{Counterparty, PeerRegistry};
use crate::validator::TransitionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Drafting,
    AwaitingCountersignature,
    AwaitingCertification,
    Committed,
    Aborted(AbortReason),
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted(_))
    }
}

/// What the local party wants to happen to an agreement.
#[derive(Debug, Clone)]
pub enum Proposal {
    Create {
        buyer: Identity,
        seller: Identity,
        data_hash: DataHash,
    },
    Update {
        current: AgreementRecord,
        data_hash: DataHash,
    },
    Accept {
        current: AgreementRecord,
    },
    Reject {
        current: AgreementRecord,
    },
}

impl Proposal {
    pub fn kind(&self) -> TransitionKind {
        match self {
            Self::Create { .. } => TransitionKind::Create,
            Self::Update { .. } => TransitionKind::Update,
            Self::Accept { .. } => TransitionKind::Accept,
            Self::Reject { .. } => TransitionKind::Reject,
        }
    }
}

/// A run executing on its own task.
pub struct RunHandle {
    pub progress: watch::Receiver<RunState>,
    state: Arc<watch::Sender<RunState>>,
    task: JoinHandle<Result<CommittedVersion, NegotiationError>>,
}

impl RunHandle {
    pub async fn outcome(self) -> Result<CommittedVersion, NegotiationError> {
        self.task.await?
    }

    /// Cancels the run and reports `Aborted(Cancelled)` unless it already ended.
    ///
    /// A run cancelled after certification still records and publishes the
    /// certified version; that part runs on its own task.
    pub fn abort(&self) {
        self.task.abort();
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = RunState::Aborted(AbortReason::Cancelled);
            true
        });
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    party: Arc<Party>,
    store: AgreementStore,
    responder: Arc<Responder>,
    notary: Arc<dyn OrderingAuthority>,
    peers: Arc<PeerRegistry>,
    resolver: Arc<dyn IdentityResolver>,
    config: NegotiationConfig,
}

impl Orchestrator {
    /// `responder` must share `store`; certified versions are recorded through it.
    pub fn new(
        party: Arc<Party>,
        store: AgreementStore,
        responder: Arc<Responder>,
        notary: Arc<dyn OrderingAuthority>,
        peers: Arc<PeerRegistry>,
        resolver: Arc<dyn IdentityResolver>,
        config: NegotiationConfig,
    ) -> Self {
        Self {
            party,
            store,
            responder,
            notary,
            peers,
            resolver,
            config,
        }
    }

    pub fn identity(&self) -> &Identity {
        self.party.identity()
    }

    pub async fn propose(&self, proposal: Proposal) -> Result<CommittedVersion, NegotiationError> {
        let (progress, _) = watch::channel(RunState::Drafting);
        self.propose_observed(proposal, &progress).await
    }

    /// Same as [`Orchestrator::propose`], publishing every state change on `progress`.
    #[instrument(skip_all, fields(party = %self.party.name(), kind = %proposal.kind()))]
    pub async fn propose_observed(
        &self,
        proposal: Proposal,
        progress: &watch::Sender<RunState>,
    ) -> Result<CommittedVersion, NegotiationError> {
        progress.send_replace(RunState::Drafting);

        let outcome = self.run(proposal, progress).await;
        match &outcome {
            Ok(committed) => {
                info!(
                    id = %committed.record.id(),
                    version = %committed.record.version_ref(),
                    status = %committed.record.status(),
                    "committed"
                );
                progress.send_replace(RunState::Committed);
            }
            Err(e) => {
                warn!(error = %e, "aborted");
                progress.send_replace(RunState::Aborted(e.abort_reason()));
            }
        }
        outcome
    }

    /// Runs the proposal on its own task.
    pub fn spawn(&self, proposal: Proposal) -> RunHandle {
        let (tx, progress) = watch::channel(RunState::Drafting);
        let state = Arc::new(tx);
        let this = self.clone();
        let tx = state.clone();
        let task = tokio::spawn(async move { this.propose_observed(proposal, &tx).await });

        RunHandle {
            progress,
            state,
            task,
        }
    }

    /// Seller side entry point: offers new terms to the buyer registered as `buyer_name`.
    pub async fn create(
        &self,
        buyer_name: &str,
        data_hash: DataHash,
    ) -> Result<CommittedVersion, NegotiationError> {
        let buyer = self
            .resolver
            .resolve_by_name(buyer_name)
            .ok_or_else(|| NegotiationError::UnknownParty(buyer_name.to_string()))?;

        self.propose(Proposal::Create {
            buyer,
            seller: self.party.identity().clone(),
            data_hash,
        })
        .await
    }

    pub async fn update(
        &self,
        id: &AgreementId,
        data_hash: DataHash,
    ) -> Result<CommittedVersion, NegotiationError> {
        let current = self.reload(id).await?;
        self.propose(Proposal::Update { current, data_hash }).await
    }

    pub async fn accept(&self, id: &AgreementId) -> Result<CommittedVersion, NegotiationError> {
        let current = self.reload(id).await?;
        self.propose(Proposal::Accept { current }).await
    }

    pub async fn reject(&self, id: &AgreementId) -> Result<CommittedVersion, NegotiationError> {
        let current = self.reload(id).await?;
        self.propose(Proposal::Reject { current }).await
    }

    /// Current version of `id` in the local ledger.
    pub fn current(&self, id: &AgreementId) -> Result<AgreementRecord, NegotiationError> {
        self.store
            .load(id)?
            .map(|committed| committed.record)
            .ok_or_else(|| NegotiationError::NotFound(id.clone()))
    }

    /// Brings the local view of `id` up to date with the other participants, then
    /// returns the current version. Peers that cannot be reached are skipped.
    pub async fn reload(&self, id: &AgreementId) -> Result<AgreementRecord, NegotiationError> {
        if let Some(local) = self.store.load(id)? {
            self.catch_up_with(&local.record).await;
        }
        self.current(id)
    }

    /// Pulls the lineage of `id` from `peer` and records every version missing
    /// locally, oldest first. Each version is verified like a delivery would be.
    #[instrument(skip_all, fields(party = %self.party.name(), id = %id, peer = %peer))]
    pub async fn catch_up(
        &self,
        id: &AgreementId,
        peer: &Identity,
    ) -> Result<usize, NegotiationError> {
        let counterparty = self
            .peers
            .get(peer)
            .ok_or_else(|| CollectionError::Unreachable {
                signer: peer.clone(),
                reason: "no route to peer".into(),
            })?;
        let waited = self.config.delivery_timeout;
        let lineage = tokio::time::timeout(waited, counterparty.fetch_history(id.clone()))
            .await
            .map_err(|_| CollectionError::Timeout {
                signer: peer.clone(),
                waited,
            })?
            .map_err(|e| CollectionError::Unreachable {
                signer: peer.clone(),
                reason: e.to_string(),
            })?;

        let recorded = self.responder.catch_up(&lineage)?;
        if recorded > 0 {
            info!(recorded, "caught up");
        }
        Ok(recorded)
    }

    async fn catch_up_with(&self, record: &AgreementRecord) {
        for participant in record.participants() {
            if participant == self.party.identity() {
                continue;
            }
            if let Err(e) = self.catch_up(record.id(), participant).await {
                warn!(%participant, error = %e, "catch-up failed");
            }
        }
    }

    async fn run(
        &self,
        proposal: Proposal,
        progress: &watch::Sender<RunState>,
    ) -> Result<CommittedVersion, NegotiationError> {
        let transition = self.draft(proposal)?;
        transition.validate()?;

        progress.send_replace(RunState::AwaitingCountersignature);
        self.share_input(&transition).await;
        let collector = SignatureCollector::new(
            self.party.clone(),
            self.peers.clone(),
            self.config.countersign_timeout,
        );
        let signatures = collector
            .collect(&transition, &transition.required_signers())
            .await?;
        let record = signatures.apply(&transition.output);

        progress.send_replace(RunState::AwaitingCertification);
        let certificate = self.certify(&transition).await?;

        // final from here on; recording and publishing must not be cancelled halfway
        let committed = CommittedVersion {
            record,
            certificate,
            kind: transition.kind,
            authorizer: transition.authorizer,
        };
        let this = self.clone();
        let finalising = committed.clone();
        if let Err(e) = tokio::spawn(async move { this.finalise(finalising).await }).await {
            warn!(error = %e, "finalising task failed");
        }

        Ok(committed)
    }

    fn draft(&self, proposal: Proposal) -> Result<Transition, NegotiationError> {
        let authorizer = self.party.identity().clone();
        let transition = match proposal {
            Proposal::Create {
                buyer,
                seller,
                data_hash,
            } => {
                let output = AgreementRecord::propose(buyer, seller, data_hash)?;
                Transition::new(TransitionKind::Create, None, output, authorizer)
            }
            Proposal::Update { current, data_hash } => {
                let output = current.amended(data_hash)?;
                Transition::new(TransitionKind::Update, Some(current), output, authorizer)
            }
            Proposal::Accept { current } => {
                let output = current.accepted()?;
                Transition::new(TransitionKind::Accept, Some(current), output, authorizer)
            }
            Proposal::Reject { current } => {
                let output = current.rejected()?;
                Transition::new(TransitionKind::Reject, Some(current), output, authorizer)
            }
        };
        debug!(produced = %transition.produced(), "drafted");

        Ok(transition)
    }

    async fn certify(&self, transition: &Transition) -> Result<CommitCertificate, ConflictError> {
        let waited = self.config.certify_timeout;
        let certificate = tokio::time::timeout(
            waited,
            self.notary
                .certify(transition.consumed().cloned(), transition.produced().clone()),
        )
        .await
        .map_err(|_| ConflictError::Timeout { waited })??;

        certificate.verify(self.notary.identity())?;
        if certificate.produced != *transition.produced()
            || certificate.consumed.as_ref() != transition.consumed()
        {
            return Err(ConflictError::InvalidCertificate(
                "certificate does not cover this transition".into(),
            ));
        }

        Ok(certificate)
    }

    async fn finalise(&self, committed: CommittedVersion) {
        if let Err(e) = self.record(&committed).await {
            warn!(error = %e, "certified version not recorded locally");
        }
        self.publish(&committed).await;
    }

    async fn record(&self, committed: &CommittedVersion) -> Result<Appended, NegotiationError> {
        match self.responder.accept_committed(committed) {
            Err(NegotiationError::Store(StoreError::Stale { .. })) => {
                debug!("local ledger is behind the certified version");
                self.catch_up_with(&committed.record).await;
                self.responder.accept_committed(committed)
            }
            other => other,
        }
    }

    /// Pushes the consumed version to the other signers before asking them to sign,
    /// with its whole lineage when a signer is further behind. A signer that is
    /// still behind afterwards refuses in the signature round.
    async fn share_input(&self, transition: &Transition) {
        let Some(consumed) = transition.consumed() else {
            return;
        };
        let lineage = match self.store.history(transition.output.id()) {
            Ok(lineage) => lineage,
            Err(e) => {
                warn!(error = %e, "local lineage unavailable");
                return;
            }
        };
        let Some(input) = lineage.first() else {
            return;
        };
        if input.record.version_ref() != consumed {
            return;
        }

        for signer in transition.required_signers() {
            if signer == *self.party.identity() {
                continue;
            }
            let Some(peer) = self.peers.get(&signer) else {
                continue;
            };
            if self.deliver(peer.as_ref(), input).await.is_ok() {
                continue;
            }
            for committed in lineage.iter().rev() {
                if let Err(e) = self.deliver(peer.as_ref(), committed).await {
                    debug!(%signer, error = %e, "could not share lineage");
                    break;
                }
            }
        }
    }

    // Delivery failures are only logged; the version is already final.
    async fn publish(&self, committed: &CommittedVersion) {
        for participant in committed.record.participants() {
            if participant == self.party.identity() {
                continue;
            }
            let Some(peer) = self.peers.get(participant) else {
                warn!(%participant, "no route to publish committed version");
                continue;
            };
            match self.deliver(peer.as_ref(), committed).await {
                Ok(()) => debug!(%participant, "published"),
                Err(e) => warn!(%participant, error = %e, "publish failed"),
            }
        }
    }

    async fn deliver(
        &self,
        peer: &dyn Counterparty,
        committed: &CommittedVersion,
    ) -> anyhow::Result<()> {
        let waited = self.config.delivery_timeout;
        tokio::time::timeout(waited, peer.deliver_committed(committed.clone()))
            .await
            .map_err(|_| anyhow::anyhow!("no answer within {waited:?}"))?
    }
}
