//! Rules deciding whether a proposed input -> output transition is legal
use std::fmt;

use crate::agreement::{AgreementRecord, Status};
use crate::error::ValidationError;
use crate::identity::Identity;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionKind {
    #[n(0)]
    Create,
    #[n(1)]
    Update,
    #[n(2)]
    Accept,
    #[n(3)]
    Reject,
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransitionKind::Create => "create",
            TransitionKind::Update => "update",
            TransitionKind::Accept => "accept",
            TransitionKind::Reject => "reject",
        };
        f.write_str(label)
    }
}

/// Checks a single transition. Pure, no side effects.
pub fn validate(
    kind: TransitionKind,
    input: Option<&AgreementRecord>,
    output: Option<&AgreementRecord>,
    authorizer: &Identity,
) -> Result<(), ValidationError> {
    match kind {
        TransitionKind::Create => validate_create(input, output, authorizer),
        TransitionKind::Update => validate_update(input, output, authorizer),
        TransitionKind::Accept => validate_decision(input, output, authorizer, Status::Accepted),
        TransitionKind::Reject => validate_decision(input, output, authorizer, Status::Rejected),
    }
}

/// Like [`validate`], for callers holding a list of candidate outputs.
/// Exactly one candidate is allowed.
pub fn validate_candidates(
    kind: TransitionKind,
    input: Option<&AgreementRecord>,
    outputs: &[AgreementRecord],
    authorizer: &Identity,
) -> Result<(), ValidationError> {
    match outputs {
        [output] => validate(kind, input, Some(output), authorizer),
        _ => Err(ValidationError::AmbiguousTransition {
            candidates: outputs.len(),
        }),
    }
}

fn validate_create(
    input: Option<&AgreementRecord>,
    output: Option<&AgreementRecord>,
    authorizer: &Identity,
) -> Result<(), ValidationError> {
    if input.is_some() {
        return Err(ValidationError::UnexpectedInput);
    }
    let output = output.ok_or(ValidationError::MissingOutput)?;

    distinct_parties(output)?;
    if output.status() != Status::Proposed {
        return Err(ValidationError::StatusNotProposed {
            found: output.status(),
        });
    }
    if authorizer != output.seller() {
        return Err(ValidationError::UnauthorizedSigner {
            expected: output.seller().to_string(),
            found: authorizer.clone(),
        });
    }

    Ok(())
}

fn validate_update(
    input: Option<&AgreementRecord>,
    output: Option<&AgreementRecord>,
    authorizer: &Identity,
) -> Result<(), ValidationError> {
    let input = input.ok_or(ValidationError::MissingInput)?;
    match input.status() {
        Status::Rejected => return Err(ValidationError::RejectedContractImmutable),
        Status::Accepted => return Err(ValidationError::AcceptedContractImmutable),
        Status::Proposed => {}
    }
    let output = output.ok_or(ValidationError::MissingOutput)?;

    same_lineage(input, output)?;
    distinct_parties(output)?;
    if output.status() != Status::Proposed {
        return Err(ValidationError::StatusNotProposed {
            found: output.status(),
        });
    }
    if !output.is_participant(authorizer) {
        return Err(ValidationError::UnauthorizedSigner {
            expected: format!("{} or {}", output.buyer(), output.seller()),
            found: authorizer.clone(),
        });
    }

    Ok(())
}

// accept and reject share every rule apart from the target status
fn validate_decision(
    input: Option<&AgreementRecord>,
    output: Option<&AgreementRecord>,
    authorizer: &Identity,
    target: Status,
) -> Result<(), ValidationError> {
    let output = output.ok_or(ValidationError::MissingOutput)?;
    if authorizer != output.buyer() {
        return Err(ValidationError::UnauthorizedSigner {
            expected: output.buyer().to_string(),
            found: authorizer.clone(),
        });
    }

    let input = input.ok_or(ValidationError::MissingInput)?;
    if input.status() != Status::Proposed {
        return Err(ValidationError::StatusNotProposed {
            found: input.status(),
        });
    }
    same_lineage(input, output)?;
    if input.data_hash() != output.data_hash() {
        return Err(ValidationError::LineageMismatch { field: "data_hash" });
    }
    if output.status() != target {
        return Err(ValidationError::StatusMismatch {
            expected: target,
            found: output.status(),
        });
    }

    Ok(())
}

fn distinct_parties(record: &AgreementRecord) -> Result<(), ValidationError> {
    if record.buyer() == record.seller() {
        return Err(ValidationError::BuyerEqualsSeller);
    }
    Ok(())
}

fn same_lineage(input: &AgreementRecord, output: &AgreementRecord) -> Result<(), ValidationError> {
    if input.id() != output.id() {
        return Err(ValidationError::LineageMismatch { field: "id" });
    }
    if output.previous() != Some(input.version_ref()) {
        return Err(ValidationError::LineageMismatch { field: "previous" });
    }
    if input.buyer() != output.buyer() {
        return Err(ValidationError::LineageMismatch { field: "buyer" });
    }
    if input.seller() != output.seller() {
        return Err(ValidationError::LineageMismatch { field: "seller" });
    }
    Ok(())
}
