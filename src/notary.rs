//! Ordering and uniqueness authority: each version may be consumed once
use async_trait::async_trait;
use chrono::Utc;
use sled::IVec;
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError};
use tracing::{debug, instrument, warn};

use crate::agreement::{TimeStamp, VersionRef};
use crate::error::{CodecError, ConflictError, StoreError};
use crate::identity::{Identity, Party};
use crate::utils;

/// Proof that `produced` is the unique accepted successor of `consumed`.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct CommitCertificate {
    #[n(0)]
    pub consumed: Option<VersionRef>,
    #[n(1)]
    pub produced: VersionRef,
    #[n(2)]
    pub height: u64, // position in the agreement's version chain, 0 for create
    #[n(3)]
    pub issued_at: TimeStamp<Utc>,
    #[n(4)]
    pub notary: Identity,
    #[n(5)]
    pub signature: String,
}

#[derive(minicbor::Encode)]
struct CertificateBody<'a> {
    #[n(0)]
    consumed: Option<&'a VersionRef>,
    #[n(1)]
    produced: &'a VersionRef,
    #[n(2)]
    height: u64,
    #[n(3)]
    issued_at: &'a TimeStamp<Utc>,
    #[n(4)]
    notary: &'a Identity,
}

impl CommitCertificate {
    fn body_digest(&self) -> Result<String, CodecError> {
        let body = CertificateBody {
            consumed: self.consumed.as_ref(),
            produced: &self.produced,
            height: self.height,
            issued_at: &self.issued_at,
            notary: &self.notary,
        };
        let (hash, _) = utils::digest_cbor("commit certificate", &body)?;
        Ok(hash)
    }

    /// Checks the certificate was issued and signed by `notary`.
    pub fn verify(&self, notary: &Identity) -> Result<(), ConflictError> {
        if self.notary != *notary {
            return Err(ConflictError::InvalidCertificate(format!(
                "issued by {} instead of {}",
                self.notary, notary
            )));
        }
        let digest = self
            .body_digest()
            .map_err(|e| ConflictError::InvalidCertificate(e.to_string()))?;
        if !notary.verifies(digest.as_bytes(), &self.signature) {
            return Err(ConflictError::InvalidCertificate(
                "signature does not verify".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
pub trait OrderingAuthority: Send + Sync {
    fn identity(&self) -> &Identity;

    /// Consumes `consumed` (if any) in favour of `produced`.
    ///
    /// Racing calls on the same consumed version resolve with exactly one success.
    /// Replaying an already certified pair returns the original certificate.
    async fn certify(
        &self,
        consumed: Option<VersionRef>,
        produced: VersionRef,
    ) -> Result<CommitCertificate, ConflictError>;
}

/// Single trusted notary keeping its consumption log in sled.
pub struct Notary {
    party: Party,
    consumed: sled::Tree,     // consumed version -> produced version
    certificates: sled::Tree, // produced version -> cbor certificate
}

enum Issued {
    New(CommitCertificate),
    Existing(IVec),
}

impl Notary {
    pub fn open(party: Party, db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            party,
            consumed: db.open_tree("notary/consumed")?,
            certificates: db.open_tree("notary/certificates")?,
        })
    }

    pub fn certificate(&self, produced: &VersionRef) -> Result<Option<CommitCertificate>, StoreError> {
        match self.certificates.get(produced.as_str())? {
            Some(bytes) => Ok(Some(utils::from_cbor("commit certificate", &bytes)?)),
            None => Ok(None),
        }
    }

    fn issue(
        &self,
        consumed: Option<VersionRef>,
        produced: VersionRef,
        height: u64,
    ) -> Result<CommitCertificate, CodecError> {
        let mut certificate = CommitCertificate {
            consumed,
            produced,
            height,
            issued_at: TimeStamp::new(),
            notary: self.party.identity().clone(),
            signature: String::new(),
        };
        let digest = certificate.body_digest()?;
        certificate.signature = self.party.sign(digest.as_bytes());

        Ok(certificate)
    }

    fn consume(
        &self,
        consumed: &Option<VersionRef>,
        produced: &VersionRef,
    ) -> Result<Issued, TransactionError<ConflictError>> {
        (&self.consumed, &self.certificates).transaction(
            |(consumed_log, certificates)| -> ConflictableTransactionResult<Issued, ConflictError> {
                if let Some(existing) = certificates.get(produced.as_str())? {
                    return Ok(Issued::Existing(existing));
                }

                let height = match consumed {
                    None => 0,
                    Some(input) => {
                        let Some(parent) = certificates.get(input.as_str())? else {
                            return Err(ConflictableTransactionError::Abort(
                                ConflictError::UnknownVersion(input.clone()),
                            ));
                        };
                        if let Some(winner) = consumed_log.get(input.as_str())? {
                            return Err(ConflictableTransactionError::Abort(
                                ConflictError::DoubleSpend {
                                    consumed: input.clone(),
                                    winner: VersionRef::from(
                                        String::from_utf8_lossy(&winner).as_ref(),
                                    ),
                                },
                            ));
                        }
                        let parent: CommitCertificate =
                            utils::from_cbor("commit certificate", &parent).map_err(abort)?;
                        consumed_log.insert(input.as_str(), produced.as_str())?;
                        parent.height + 1
                    }
                };

                let certificate = self
                    .issue(consumed.clone(), produced.clone(), height)
                    .map_err(abort)?;
                let encoded = utils::to_cbor("commit certificate", &certificate).map_err(abort)?;
                certificates.insert(produced.as_str(), encoded)?;

                Ok(Issued::New(certificate))
            },
        )
    }
}

fn abort(e: CodecError) -> ConflictableTransactionError<ConflictError> {
    ConflictableTransactionError::Abort(ConflictError::Unavailable(e.to_string()))
}

#[async_trait]
impl OrderingAuthority for Notary {
    fn identity(&self) -> &Identity {
        self.party.identity()
    }

    #[instrument(skip_all, fields(produced = %produced))]
    async fn certify(
        &self,
        consumed: Option<VersionRef>,
        produced: VersionRef,
    ) -> Result<CommitCertificate, ConflictError> {
        match self.consume(&consumed, &produced) {
            Ok(Issued::New(certificate)) => {
                debug!(height = certificate.height, "certified");
                Ok(certificate)
            }
            Ok(Issued::Existing(bytes)) => {
                let existing: CommitCertificate = utils::from_cbor("commit certificate", &bytes)
                    .map_err(|e| ConflictError::Unavailable(e.to_string()))?;
                if existing.consumed != consumed {
                    warn!("version reused under a different input");
                    return Err(ConflictError::AlreadyCertified(produced));
                }
                debug!("replayed certification");
                Ok(existing)
            }
            Err(TransactionError::Abort(conflict)) => {
                warn!(%conflict, "certification refused");
                Err(conflict)
            }
            Err(TransactionError::Storage(e)) => Err(ConflictError::Unavailable(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notary() -> Notary {
        let db = sled::Config::new().temporary(true).open().unwrap();
        Notary::open(Party::from_seed("notary", [9; 32]).unwrap(), &db).unwrap()
    }

    #[tokio::test]
    async fn chain_of_certifications() {
        let notary = notary();
        let v1 = VersionRef::from("v1");
        let v2 = VersionRef::from("v2");

        let first = notary.certify(None, v1.clone()).await.unwrap();
        let second = notary.certify(Some(v1.clone()), v2.clone()).await.unwrap();

        assert_eq!(first.height, 0);
        assert_eq!(second.height, 1);
        assert_eq!(second.consumed, Some(v1));
        assert!(second.verify(notary.identity()).is_ok());
    }

    #[tokio::test]
    async fn second_consumer_loses() {
        let notary = notary();
        let v1 = VersionRef::from("v1");
        notary.certify(None, v1.clone()).await.unwrap();
        notary
            .certify(Some(v1.clone()), VersionRef::from("accept"))
            .await
            .unwrap();

        let res = notary
            .certify(Some(v1.clone()), VersionRef::from("reject"))
            .await;

        assert_eq!(
            res,
            Err(ConflictError::DoubleSpend {
                consumed: v1,
                winner: VersionRef::from("accept"),
            })
        );
    }

    #[tokio::test]
    async fn replay_returns_the_original_certificate() {
        let notary = notary();
        let v1 = VersionRef::from("v1");
        let v2 = VersionRef::from("v2");
        notary.certify(None, v1.clone()).await.unwrap();

        let original = notary.certify(Some(v1.clone()), v2.clone()).await.unwrap();
        let replay = notary.certify(Some(v1.clone()), v2.clone()).await.unwrap();

        assert_eq!(original, replay);
        assert_eq!(notary.certificate(&v2).unwrap(), Some(original));
    }

    #[tokio::test]
    async fn unknown_input_is_refused() {
        let notary = notary();
        let res = notary
            .certify(Some(VersionRef::from("ghost")), VersionRef::from("v2"))
            .await;

        assert_eq!(
            res,
            Err(ConflictError::UnknownVersion(VersionRef::from("ghost")))
        );
    }

    #[tokio::test]
    async fn produced_version_cannot_be_reused() {
        let notary = notary();
        let v1 = VersionRef::from("v1");
        notary.certify(None, v1.clone()).await.unwrap();

        let res = notary.certify(Some(v1.clone()), v1.clone()).await;

        assert_eq!(res, Err(ConflictError::AlreadyCertified(v1)));
    }

    #[tokio::test]
    async fn certificate_from_another_notary_is_invalid() {
        let notary = notary();
        let impostor = Party::from_seed("impostor", [8; 32]).unwrap();
        let cert = notary.certify(None, VersionRef::from("v1")).await.unwrap();

        assert!(cert.verify(impostor.identity()).is_err());
    }
}
