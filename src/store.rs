//! A participant's local view of committed agreement versions
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError};
use tracing::debug;

use crate::agreement::{AgreementId, AgreementRecord, VersionRef};
use crate::error::StoreError;
use crate::identity::Identity;
use crate::notary::CommitCertificate;
use crate::transition::Transition;
use crate::utils;
use crate::validator::TransitionKind;

/// A fully signed version, its certificate, and the transition metadata the
/// signatures were made over.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct CommittedVersion {
    #[n(0)]
    pub record: AgreementRecord,
    #[n(1)]
    pub certificate: CommitCertificate,
    #[n(2)]
    pub kind: TransitionKind,
    #[n(3)]
    pub authorizer: Identity,
}

impl CommittedVersion {
    /// Rebuilds the signed transition on top of `input`, the version it consumed.
    pub fn transition(&self, input: Option<AgreementRecord>) -> Transition {
        Transition::new(
            self.kind,
            input,
            self.record.clone(),
            self.authorizer.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    Recorded,
    AlreadyPresent,
}

/// Versions keyed by version ref, plus a current-version pointer per agreement id.
/// Trees are namespaced so several participants can share one sled instance.
#[derive(Clone)]
pub struct AgreementStore {
    versions: sled::Tree,
    current: sled::Tree,
}

impl AgreementStore {
    pub fn open(db: &sled::Db, namespace: &str) -> Result<Self, StoreError> {
        Ok(Self {
            versions: db.open_tree(format!("{namespace}/versions"))?,
            current: db.open_tree(format!("{namespace}/current"))?,
        })
    }

    /// Current version of an agreement.
    pub fn load(&self, id: &AgreementId) -> Result<Option<CommittedVersion>, StoreError> {
        match self.current.get(id.as_str())? {
            Some(version) => self.version(&ivec_to_ref(&version)),
            None => Ok(None),
        }
    }

    pub fn version(&self, version_ref: &VersionRef) -> Result<Option<CommittedVersion>, StoreError> {
        match self.versions.get(version_ref.as_str())? {
            Some(bytes) => Ok(Some(utils::from_cbor("committed version", &bytes)?)),
            None => Ok(None),
        }
    }

    /// Records a certified version and moves the current pointer, in one transaction.
    ///
    /// The certificate's consumed version must still be current, which keeps the
    /// lineage linear. Appending a version that is already stored is a no-op.
    pub fn append(&self, entry: &CommittedVersion) -> Result<Appended, StoreError> {
        let record = &entry.record;
        let certificate = &entry.certificate;
        if certificate.produced != *record.version_ref() {
            return Err(StoreError::CertificateMismatch {
                certified: certificate.produced.clone(),
                record: record.version_ref().clone(),
            });
        }
        let encoded = utils::to_cbor("committed version", entry)?;
        let id = record.id();
        let version_ref = record.version_ref();

        let res = (&self.versions, &self.current).transaction(
            |(versions, current)| -> ConflictableTransactionResult<Appended, StoreError> {
                if versions.get(version_ref.as_str())?.is_some() {
                    return Ok(Appended::AlreadyPresent);
                }
                let found = current.get(id.as_str())?.map(|v| ivec_to_ref(&v));
                if found != certificate.consumed {
                    return Err(ConflictableTransactionError::Abort(StoreError::Stale {
                        id: id.clone(),
                        expected: certificate.consumed.clone(),
                        found,
                    }));
                }
                versions.insert(version_ref.as_str(), encoded.clone())?;
                current.insert(id.as_str(), version_ref.as_str())?;

                Ok(Appended::Recorded)
            },
        );

        match res {
            Ok(appended) => {
                debug!(%id, version = %version_ref, ?appended, "append");
                Ok(appended)
            }
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }

    /// Lineage of an agreement, newest version first.
    pub fn history(&self, id: &AgreementId) -> Result<Vec<CommittedVersion>, StoreError> {
        let mut history = vec![];
        let mut next = self.load(id)?;
        while let Some(entry) = next {
            next = match entry.record.previous() {
                Some(previous) => self.version(previous)?,
                None => None,
            };
            history.push(entry);
        }
        Ok(history)
    }

    /// Current version of every agreement in this view.
    pub fn current(&self) -> Result<Vec<CommittedVersion>, StoreError> {
        let mut all = vec![];
        for item in self.current.iter() {
            let (_, version) = item?;
            if let Some(entry) = self.version(&ivec_to_ref(&version))? {
                all.push(entry);
            }
        }
        Ok(all)
    }
}

fn ivec_to_ref(bytes: &sled::IVec) -> VersionRef {
    VersionRef::from(String::from_utf8_lossy(bytes).as_ref())
}
