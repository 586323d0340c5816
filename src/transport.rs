//! Messages exchanged between parties and the seam a transport plugs into
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::agreement::AgreementId;
use crate::identity::{Endorsement, Identity};
use crate::responder::Responder;
use crate::store::CommittedVersion;
use crate::transition::Transition;
use crate::utils;

/// Ask a counterparty to countersign. The output already carries the proposer's
/// signature in its slot.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct SignatureRequest {
    #[n(0)]
    pub transition: Transition,
    #[n(1)]
    pub proposer: Endorsement,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum SignatureResponse {
    #[n(0)]
    Signed(#[n(0)] Endorsement),
    #[n(1)]
    Refused {
        #[n(0)]
        reason: String,
    },
}

/// Delivery may be at-least-once; implementations on the receiving side must treat
/// duplicates as no-ops.
#[async_trait]
pub trait Counterparty: Send + Sync {
    async fn request_signature(&self, request: SignatureRequest)
    -> anyhow::Result<SignatureResponse>;

    async fn deliver_committed(&self, committed: CommittedVersion) -> anyhow::Result<()>;

    /// The peer's committed lineage of `id`, newest version first.
    async fn fetch_history(&self, id: AgreementId) -> anyhow::Result<Vec<CommittedVersion>> {
        anyhow::bail!("peer does not serve the history of {id}")
    }
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<Identity, Arc<dyn Counterparty>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, identity: Identity, peer: Arc<dyn Counterparty>) {
        self.peers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(identity, peer);
    }

    pub fn get(&self, identity: &Identity) -> Option<Arc<dyn Counterparty>> {
        self.peers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(identity)
            .cloned()
    }
}

/// In-process peer. Every message goes through its cbor encoding, as it would on
/// a wire.
pub struct LocalPeer {
    responder: Arc<Responder>,
}

impl LocalPeer {
    pub fn new(responder: Arc<Responder>) -> Self {
        Self { responder }
    }
}

#[async_trait]
impl Counterparty for LocalPeer {
    async fn request_signature(
        &self,
        request: SignatureRequest,
    ) -> anyhow::Result<SignatureResponse> {
        let wire = utils::to_cbor("signature request", &request)?;
        let request: SignatureRequest = utils::from_cbor("signature request", &wire)?;

        let response = self.responder.handle_request(&request);

        let wire = utils::to_cbor("signature response", &response)?;
        Ok(utils::from_cbor("signature response", &wire)?)
    }

    async fn deliver_committed(&self, committed: CommittedVersion) -> anyhow::Result<()> {
        let wire = utils::to_cbor("committed version", &committed)?;
        let committed: CommittedVersion = utils::from_cbor("committed version", &wire)?;

        self.responder.accept_committed(&committed)?;
        Ok(())
    }

    async fn fetch_history(&self, id: AgreementId) -> anyhow::Result<Vec<CommittedVersion>> {
        let lineage = self.responder.history(&id)?;

        let wire = utils::to_cbor("committed lineage", &lineage)?;
        Ok(utils::from_cbor("committed lineage", &wire)?)
    }
}
