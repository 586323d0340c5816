use std::time::Duration;

use crate::agreement::{AgreementId, Status, VersionRef};
use crate::identity::Identity;

/// A proposed transition broke one of the agreement rules.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Buyer cannot be a seller for a transaction")]
    BuyerEqualsSeller,
    #[error("Contract must be in status proposed, found {found}")]
    StatusNotProposed { found: Status },
    #[error("Cannot update rejected contract")]
    RejectedContractImmutable,
    #[error("Cannot update accepted contract")]
    AcceptedContractImmutable,
    #[error("Unauthorized signer. Expected: {expected}, Got: {found}")]
    UnauthorizedSigner { expected: String, found: Identity },
    #[error("Transition requires the current version as input")]
    MissingInput,
    #[error("Transition does not produce an output record")]
    MissingOutput,
    #[error("Create must not consume an existing version")]
    UnexpectedInput,
    #[error("Expected exactly one output record, got {candidates}")]
    AmbiguousTransition { candidates: usize },
    #[error("Output does not descend from input: {field} differs")]
    LineageMismatch { field: &'static str },
    #[error("Output status must be {expected}, found {found}")]
    StatusMismatch { expected: Status, found: Status },
    #[error("Missing a valid signature from {signer}")]
    MissingEndorsement { signer: Identity },
    #[error("{0} is not a participant of this agreement")]
    NotAParticipant(Identity),
}

/// Countersignatures could not be gathered.
#[derive(thiserror::Error, Debug)]
pub enum CollectionError {
    #[error("{signer} refused to countersign: {reason}")]
    Refused { signer: Identity, reason: String },
    #[error("{signer} did not answer within {waited:?}")]
    Timeout { signer: Identity, waited: Duration },
    #[error("{signer} is unreachable: {reason}")]
    Unreachable { signer: Identity, reason: String },
    #[error("{signer} returned a signature that does not verify")]
    BadSignature { signer: Identity },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// The ordering authority would not certify the transition.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictError {
    #[error("version {consumed} was already consumed by {winner}")]
    DoubleSpend {
        consumed: VersionRef,
        winner: VersionRef,
    },
    #[error("version {0} was never certified")]
    UnknownVersion(VersionRef),
    #[error("version {0} is already certified as the successor of another version")]
    AlreadyCertified(VersionRef),
    #[error("commit certificate does not verify: {0}")]
    InvalidCertificate(String),
    #[error("ordering authority did not answer within {waited:?}")]
    Timeout { waited: Duration },
    #[error("ordering authority unavailable: {0}")]
    Unavailable(String),
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Sled(#[from] sled::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("stale append for {id}: expected current {expected:?}, found {found:?}")]
    Stale {
        id: AgreementId,
        expected: Option<VersionRef>,
        found: Option<VersionRef>,
    },
    #[error("certificate for {certified} does not match record {record}")]
    CertificateMismatch {
        certified: VersionRef,
        record: VersionRef,
    },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("failed to encode {what}: {reason}")]
    Encode { what: &'static str, reason: String },
    #[error("failed to decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },
    #[error("invalid identity {0}")]
    Identity(String),
    #[error("invalid signature encoding")]
    Signature,
}

/// Why a negotiation run ended in the aborted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Validation,
    Refused,
    Timeout,
    DoubleSpend,
    Cancelled,
    Fault,
}

/// Coarse mapping for an outer API adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusHint {
    NotFound,
    Forbidden,
    Conflict,
    Unavailable,
}

#[derive(thiserror::Error, Debug)]
pub enum NegotiationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Collection(#[from] CollectionError),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("agreement {0} not found in the local ledger")]
    NotFound(AgreementId),
    #[error("unable to locate {0} in identity service")]
    UnknownParty(String),
    #[error("negotiation task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl NegotiationError {
    pub fn abort_reason(&self) -> AbortReason {
        match self {
            Self::Validation(_) | Self::NotFound(_) | Self::UnknownParty(_) => {
                AbortReason::Validation
            }
            Self::Collection(CollectionError::Refused { .. }) => AbortReason::Refused,
            Self::Collection(CollectionError::Timeout { .. }) => AbortReason::Timeout,
            Self::Conflict(ConflictError::Timeout { .. }) => AbortReason::Timeout,
            Self::Conflict(
                ConflictError::DoubleSpend { .. } | ConflictError::AlreadyCertified(_),
            ) => AbortReason::DoubleSpend,
            Self::Task(e) if e.is_cancelled() => AbortReason::Cancelled,
            _ => AbortReason::Fault,
        }
    }

    pub fn status_hint(&self) -> StatusHint {
        match self {
            Self::NotFound(_) | Self::UnknownParty(_) => StatusHint::NotFound,
            Self::Validation(_) | Self::Collection(CollectionError::Refused { .. }) => {
                StatusHint::Forbidden
            }
            Self::Conflict(
                ConflictError::DoubleSpend { .. }
                | ConflictError::AlreadyCertified(_)
                | ConflictError::UnknownVersion(_),
            )
            | Self::Store(StoreError::Stale { .. }) => StatusHint::Conflict,
            _ => StatusHint::Unavailable,
        }
    }
}
