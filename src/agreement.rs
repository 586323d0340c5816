//! Core agreement record and its versioning
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use uuid7::uuid7;

use crate::error::CodecError;
use crate::identity::{Endorsement, Identity};
use crate::utils;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    #[n(0)]
    Proposed,
    #[n(1)]
    Accepted,
    #[n(2)]
    Rejected,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Accepted | Status::Rejected)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::Proposed => "PROPOSED",
            Status::Accepted => "ACCEPTED",
            Status::Rejected => "REJECTED",
        };
        f.write_str(label)
    }
}

/// Stable id of the logical agreement, shared by every version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
#[cbor(array)]
pub struct AgreementId(#[n(0)] String); // uuid7, bech32 encoded

/// Handle on one immutable version. Consumed by the next transition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, minicbor::Encode, minicbor::Decode)]
#[cbor(array)]
pub struct VersionRef(#[n(0)] String); // sha256 of the unsigned record content

/// Fingerprint of the off-ledger agreement payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
#[cbor(array)]
pub struct DataHash(#[n(0)] String);

impl AgreementId {
    pub const HRP: &'static str = "sale";

    pub fn generate() -> Result<Self, CodecError> {
        utils::new_uuid_to_bech32(Self::HRP)
            .map(Self)
            .map_err(|e| CodecError::Encode {
                what: "agreement id",
                reason: e.to_string(),
            })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgreementId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl VersionRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VersionRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl DataHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// Hash of the raw payload bytes.
    pub fn of(payload: &[u8]) -> Self {
        Self(sha256::digest(payload))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgreementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for VersionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for DataHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// One immutable version of a sale agreement.
///
/// Records are never changed in place. Every transition derives a new record whose
/// `previous` points at the version it supersedes. Signatures are attached after the
/// fact and are not part of the version reference.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct AgreementRecord {
    #[n(0)]
    id: AgreementId,
    #[n(1)]
    version_ref: VersionRef,
    #[n(2)]
    previous: Option<VersionRef>,
    #[n(3)]
    buyer: Identity,
    #[n(4)]
    seller: Identity,
    #[n(5)]
    data_hash: DataHash,
    #[n(6)]
    status: Status,
    #[n(7)]
    proposed_at: TimeStamp<Utc>,
    #[n(8)]
    nonce: String, // uuid7, keeps identical proposals distinct
    #[n(9)]
    buyer_signature: Option<String>,
    #[n(10)]
    seller_signature: Option<String>,
}

// everything the version reference commits to
#[derive(minicbor::Encode)]
struct VersionPreimage<'a> {
    #[n(0)]
    id: &'a AgreementId,
    #[n(1)]
    previous: Option<&'a VersionRef>,
    #[n(2)]
    buyer: &'a Identity,
    #[n(3)]
    seller: &'a Identity,
    #[n(4)]
    data_hash: &'a DataHash,
    #[n(5)]
    status: Status,
    #[n(6)]
    proposed_at: &'a TimeStamp<Utc>,
    #[n(7)]
    nonce: &'a str,
}

impl AgreementRecord {
    /// First version of a brand new agreement, in status proposed.
    pub fn propose(
        buyer: Identity,
        seller: Identity,
        data_hash: DataHash,
    ) -> Result<Self, CodecError> {
        Self::seal(
            AgreementId::generate()?,
            None,
            buyer,
            seller,
            data_hash,
            Status::Proposed,
        )
    }

    fn seal(
        id: AgreementId,
        previous: Option<VersionRef>,
        buyer: Identity,
        seller: Identity,
        data_hash: DataHash,
        status: Status,
    ) -> Result<Self, CodecError> {
        let mut record = Self {
            id,
            version_ref: VersionRef(String::new()),
            previous,
            buyer,
            seller,
            data_hash,
            status,
            proposed_at: TimeStamp::new(),
            nonce: uuid7().to_string(),
            buyer_signature: None,
            seller_signature: None,
        };
        record.version_ref = record.compute_version_ref()?;

        Ok(record)
    }

    fn compute_version_ref(&self) -> Result<VersionRef, CodecError> {
        let preimage = VersionPreimage {
            id: &self.id,
            previous: self.previous.as_ref(),
            buyer: &self.buyer,
            seller: &self.seller,
            data_hash: &self.data_hash,
            status: self.status,
            proposed_at: &self.proposed_at,
            nonce: &self.nonce,
        };
        let (hash, _) = utils::digest_cbor("agreement version", &preimage)?;

        Ok(VersionRef(hash))
    }

    /// False when the content no longer matches the version reference.
    pub fn verify_version_ref(&self) -> bool {
        self.compute_version_ref()
            .map(|computed| computed == self.version_ref)
            .unwrap_or(false)
    }

    fn successor(&self, data_hash: DataHash, status: Status) -> Result<Self, CodecError> {
        Self::seal(
            self.id.clone(),
            Some(self.version_ref.clone()),
            self.buyer.clone(),
            self.seller.clone(),
            data_hash,
            status,
        )
    }

    pub fn accepted(&self) -> Result<Self, CodecError> {
        self.successor(self.data_hash.clone(), Status::Accepted)
    }

    pub fn rejected(&self) -> Result<Self, CodecError> {
        self.successor(self.data_hash.clone(), Status::Rejected)
    }

    /// New terms re-open the negotiation.
    pub fn amended(&self, data_hash: DataHash) -> Result<Self, CodecError> {
        self.successor(data_hash, Status::Proposed)
    }

    /// Copy of this version carrying the endorsement in the matching party's slot.
    /// Endorsements from anyone else are ignored.
    pub fn with_signature(&self, endorsement: &Endorsement) -> Self {
        let mut signed = self.clone();
        if endorsement.signer == self.buyer {
            signed.buyer_signature = Some(endorsement.signature.clone());
        }
        if endorsement.signer == self.seller {
            signed.seller_signature = Some(endorsement.signature.clone());
        }
        signed
    }

    pub fn signature_of(&self, identity: &Identity) -> Option<&str> {
        if *identity == self.buyer {
            self.buyer_signature.as_deref()
        } else if *identity == self.seller {
            self.seller_signature.as_deref()
        } else {
            None
        }
    }

    pub fn is_fully_signed(&self) -> bool {
        self.buyer_signature.is_some() && self.seller_signature.is_some()
    }

    pub fn is_participant(&self, identity: &Identity) -> bool {
        *identity == self.buyer || *identity == self.seller
    }

    pub fn participants(&self) -> [&Identity; 2] {
        [&self.buyer, &self.seller]
    }

    pub fn id(&self) -> &AgreementId {
        &self.id
    }
    pub fn version_ref(&self) -> &VersionRef {
        &self.version_ref
    }
    pub fn previous(&self) -> Option<&VersionRef> {
        self.previous.as_ref()
    }
    pub fn buyer(&self) -> &Identity {
        &self.buyer
    }
    pub fn seller(&self) -> &Identity {
        &self.seller
    }
    pub fn data_hash(&self) -> &DataHash {
        &self.data_hash
    }
    pub fn status(&self) -> Status {
        self.status
    }
    pub fn proposed_at(&self) -> &TimeStamp<Utc> {
        &self.proposed_at
    }
    pub fn buyer_signature(&self) -> Option<&str> {
        self.buyer_signature.as_deref()
    }
    pub fn seller_signature(&self) -> Option<&str> {
        self.seller_signature.as_deref()
    }
}
