//! Gathers the endorsements a transition needs before it can be certified
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::agreement::AgreementRecord;
use crate::error::CollectionError;
use crate::identity::{Endorsement, Identity, Party};
use crate::transition::Transition;
use crate::transport::{PeerRegistry, SignatureRequest, SignatureResponse};

/// Every endorsement gathered for one transition digest, proposer first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedSignatures {
    pub digest: String,
    pub endorsements: Vec<Endorsement>,
}

impl CollectedSignatures {
    pub fn get(&self, signer: &Identity) -> Option<&Endorsement> {
        self.endorsements.iter().find(|e| e.signer == *signer)
    }

    /// Output record with every collected signature in its slot.
    pub fn apply(&self, record: &AgreementRecord) -> AgreementRecord {
        self.endorsements
            .iter()
            .fold(record.clone(), |record, endorsement| {
                record.with_signature(endorsement)
            })
    }
}

pub struct SignatureCollector {
    party: Arc<Party>,
    peers: Arc<PeerRegistry>,
    timeout: Duration,
}

impl SignatureCollector {
    pub fn new(party: Arc<Party>, peers: Arc<PeerRegistry>, timeout: Duration) -> Self {
        Self {
            party,
            peers,
            timeout,
        }
    }

    /// Signs locally, then asks every other required signer in turn.
    /// The first failure ends the collection.
    #[instrument(skip_all, fields(kind = %transition.kind, produced = %transition.produced()))]
    pub async fn collect(
        &self,
        transition: &Transition,
        required: &BTreeSet<Identity>,
    ) -> Result<CollectedSignatures, CollectionError> {
        let digest = transition.digest()?;
        let proposer = self.party.endorse(digest.as_bytes());

        let mut outgoing = transition.clone();
        outgoing.output = outgoing.output.with_signature(&proposer);
        let request = SignatureRequest {
            transition: outgoing,
            proposer: proposer.clone(),
        };

        let mut endorsements = vec![proposer];
        for signer in required.iter().filter(|id| *id != self.party.identity()) {
            let endorsement = self.request_from(signer, &request, &digest).await?;
            endorsements.push(endorsement);
        }

        debug!(signatures = endorsements.len(), "collected");
        Ok(CollectedSignatures {
            digest,
            endorsements,
        })
    }

    async fn request_from(
        &self,
        signer: &Identity,
        request: &SignatureRequest,
        digest: &str,
    ) -> Result<Endorsement, CollectionError> {
        let peer = self
            .peers
            .get(signer)
            .ok_or_else(|| CollectionError::Unreachable {
                signer: signer.clone(),
                reason: "no route to peer".into(),
            })?;

        debug!(%signer, "requesting countersignature");
        let response =
            match tokio::time::timeout(self.timeout, peer.request_signature(request.clone())).await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    return Err(CollectionError::Unreachable {
                        signer: signer.clone(),
                        reason: format!("{e:#}"),
                    });
                }
                Err(_) => {
                    warn!(%signer, waited = ?self.timeout, "countersignature timed out");
                    return Err(CollectionError::Timeout {
                        signer: signer.clone(),
                        waited: self.timeout,
                    });
                }
            };

        match response {
            SignatureResponse::Signed(endorsement) => {
                if endorsement.signer != *signer || !endorsement.verify(digest.as_bytes()) {
                    return Err(CollectionError::BadSignature {
                        signer: signer.clone(),
                    });
                }
                Ok(endorsement)
            }
            SignatureResponse::Refused { reason } => {
                warn!(%signer, %reason, "countersignature refused");
                Err(CollectionError::Refused {
                    signer: signer.clone(),
                    reason,
                })
            }
        }
    }
}
