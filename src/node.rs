//! One participant: its ledger view, its responder and its orchestrator
use std::sync::Arc;

use crate::config::NegotiationConfig;
use crate::error::StoreError;
use crate::identity::{Directory, Identity, Party};
use crate::notary::OrderingAuthority;
use crate::orchestrator::Orchestrator;
use crate::responder::Responder;
use crate::store::AgreementStore;
use crate::transport::{Counterparty, LocalPeer, PeerRegistry};

pub struct Node {
    party: Arc<Party>,
    store: AgreementStore,
    responder: Arc<Responder>,
    peers: Arc<PeerRegistry>,
    orchestrator: Orchestrator,
}

impl Node {
    /// Opens the participant's ledger view inside `db` and registers it in `directory`.
    pub fn open(
        party: Party,
        db: &sled::Db,
        notary: Arc<dyn OrderingAuthority>,
        directory: Arc<Directory>,
        config: NegotiationConfig,
    ) -> Result<Self, StoreError> {
        let party = Arc::new(party);
        let store = AgreementStore::open(db, party.name())?;
        let responder = Arc::new(Responder::new(
            party.clone(),
            store.clone(),
            notary.identity().clone(),
        ));
        let peers = Arc::new(PeerRegistry::new());
        directory.register(party.name(), party.identity().clone());

        let orchestrator = Orchestrator::new(
            party.clone(),
            store.clone(),
            responder.clone(),
            notary,
            peers.clone(),
            directory,
            config,
        );

        Ok(Self {
            party,
            store,
            responder,
            peers,
            orchestrator,
        })
    }

    /// Makes both nodes reachable from each other through in-process peers.
    pub fn connect(&self, other: &Node) {
        self.peers.register(other.identity().clone(), other.peer());
        other.peers.register(self.identity().clone(), self.peer());
    }

    /// Routes messages for `identity` through a custom transport.
    pub fn register_peer(&self, identity: Identity, peer: Arc<dyn Counterparty>) {
        self.peers.register(identity, peer);
    }

    pub fn peer(&self) -> Arc<dyn Counterparty> {
        Arc::new(LocalPeer::new(self.responder.clone()))
    }

    pub fn name(&self) -> &str {
        self.party.name()
    }

    pub fn identity(&self) -> &Identity {
        self.party.identity()
    }

    pub fn store(&self) -> &AgreementStore {
        &self.store
    }

    pub fn responder(&self) -> &Arc<Responder> {
        &self.responder
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}
