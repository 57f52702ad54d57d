//! Per-phase error triage
//!
//! Each attempt phase has its own decision table turning an [`ErrorClass`]
//! into a [`TriageDecision`]. The tables are pure functions so they can be
//! exercised without any store. Callers turn `Fail` and `RetryTransaction`
//! decisions into a [`TransactionOperationFailed`] with
//! [`TriageDecision::into_failure`]; the other decisions are resolved locally
//! by the phase that asked.

use crate::errors::{ErrorClass, FailureCause, FinalError, TransactionOperationFailed};

/// Phase-specific handling the caller performs itself
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalAction {
    /// An insert found a live document: inspect it while staging, fall back to
    /// replacing it while unstaging
    DocExists,
    /// Unstaging found no tombstone; recreate the document
    InsertMode,
    /// Deadline passed mid commit/rollback; continue in overtime
    EnterOvertime,
    /// Commit write outcome unknown; enter ambiguity resolution and repeat
    EnterAmbiguityResolution,
    /// Read back the ATR entry to learn whether the commit landed
    ResolveAmbiguity,
    /// Document changed under a staged replace during commit; retry without CAS
    DocChangedDuringCommit,
}

/// How a failed attempt should end
#[derive(Clone, Debug, PartialEq)]
pub struct FailDirective {
    /// Roll the attempt back
    pub rollback: bool,
    /// What to raise
    pub raise: FinalError,
    /// Override of the classified error class
    pub class: Option<ErrorClass>,
    /// Override of the underlying cause
    pub cause: Option<FailureCause>,
}

/// Verdict for one failure
#[derive(Clone, Debug, PartialEq)]
pub enum TriageDecision {
    /// Not a failure for this phase
    TreatAsSuccess,
    /// Repeat the same operation
    Repeat,
    /// Phase-specific handling
    Local(LocalAction),
    /// Roll back and start a new attempt
    RetryTransaction,
    /// Give up on this attempt
    Fail(FailDirective),
}

impl TriageDecision {
    /// Roll back, then raise `raise`
    pub fn rollback_and_raise(raise: FinalError) -> Self {
        Self::Fail(FailDirective { rollback: true, raise, class: None, cause: None })
    }

    /// Raise `raise` without rolling back
    pub fn raise_without_rollback(raise: FinalError) -> Self {
        Self::Fail(FailDirective { rollback: false, raise, class: None, cause: None })
    }

    fn failed() -> Self {
        Self::rollback_and_raise(FinalError::TransactionFailed)
    }

    fn failed_no_rollback() -> Self {
        Self::raise_without_rollback(FinalError::TransactionFailed)
    }

    fn with_cause(self, cause: FailureCause) -> Self {
        match self {
            Self::Fail(mut d) => {
                d.cause = Some(cause);
                Self::Fail(d)
            }
            other => other,
        }
    }

    fn with_class(self, class: ErrorClass) -> Self {
        match self {
            Self::Fail(mut d) => {
                d.class = Some(class);
                Self::Fail(d)
            }
            other => other,
        }
    }

    fn expired(rollback: bool) -> Self {
        let decision = if rollback {
            Self::rollback_and_raise(FinalError::TransactionExpired)
        } else {
            Self::raise_without_rollback(FinalError::TransactionExpired)
        };
        decision.with_class(ErrorClass::FailExpiry).with_cause(FailureCause::AttemptExpired)
    }

    fn post_commit() -> Self {
        Self::raise_without_rollback(FinalError::TransactionFailedPostCommit)
    }

    /// Build the operation failure for `RetryTransaction` and `Fail`
    pub fn into_failure(self, class: ErrorClass, cause: FailureCause) -> Option<TransactionOperationFailed> {
        match self {
            Self::RetryTransaction => Some(TransactionOperationFailed::new(class, cause).retry()),
            Self::Fail(d) => Some(TransactionOperationFailed {
                class: d.class.unwrap_or(class),
                retry: false,
                rollback: d.rollback,
                raise: d.raise,
                cause: d.cause.unwrap_or(cause),
            }),
            Self::TreatAsSuccess | Self::Repeat | Self::Local(_) => None,
        }
    }
}

/// Plain document read
pub fn get(class: ErrorClass) -> TriageDecision {
    match class {
        ErrorClass::FailDocNotFound => TriageDecision::TreatAsSuccess,
        ErrorClass::FailHard => TriageDecision::failed_no_rollback(),
        ErrorClass::FailTransient => TriageDecision::RetryTransaction,
        _ => TriageDecision::failed(),
    }
}

/// Staging a replace or a remove
pub fn staged_replace_or_remove(class: ErrorClass) -> TriageDecision {
    match class {
        ErrorClass::FailExpiry => TriageDecision::expired(true),
        ErrorClass::FailDocAlreadyExists
        | ErrorClass::FailDocNotFound
        | ErrorClass::FailCasMismatch
        | ErrorClass::FailTransient
        | ErrorClass::FailAmbiguous => TriageDecision::RetryTransaction,
        ErrorClass::FailHard => TriageDecision::failed_no_rollback(),
        _ => TriageDecision::failed(),
    }
}

/// Staging an insert
pub fn staged_insert(class: ErrorClass, overtime: bool) -> TriageDecision {
    if overtime {
        return TriageDecision::expired(false);
    }
    match class {
        ErrorClass::FailExpiry => TriageDecision::expired(true),
        ErrorClass::FailAmbiguous => TriageDecision::Repeat,
        ErrorClass::FailTransient => TriageDecision::RetryTransaction,
        ErrorClass::FailHard => TriageDecision::failed_no_rollback(),
        ErrorClass::FailCasMismatch | ErrorClass::FailDocAlreadyExists => {
            TriageDecision::Local(LocalAction::DocExists)
        }
        _ => TriageDecision::failed(),
    }
}

/// Re-reading a document after a staged insert found it present
pub fn doc_exists_on_staged_insert(class: ErrorClass) -> TriageDecision {
    match class {
        ErrorClass::FailDocNotFound | ErrorClass::FailPathNotFound | ErrorClass::FailTransient => {
            TriageDecision::RetryTransaction
        }
        _ => TriageDecision::failed(),
    }
}

/// Creating the ATR entry in PENDING
pub fn set_atr_pending(class: ErrorClass, overtime: bool) -> TriageDecision {
    if overtime {
        return TriageDecision::expired(false);
    }
    match class {
        ErrorClass::FailExpiry => TriageDecision::expired(true),
        ErrorClass::FailAtrFull => TriageDecision::failed().with_cause(FailureCause::ActiveTransactionRecordsFull),
        ErrorClass::FailAmbiguous => TriageDecision::Repeat,
        ErrorClass::FailPathAlreadyExists => TriageDecision::TreatAsSuccess,
        ErrorClass::FailHard => TriageDecision::failed_no_rollback(),
        ErrorClass::FailTransient => TriageDecision::RetryTransaction,
        _ => TriageDecision::failed(),
    }
}

/// Moving the ATR entry to COMMITTED, the commit point
pub fn set_atr_commit(class: ErrorClass, ambiguity_resolution: bool) -> TriageDecision {
    if ambiguity_resolution {
        return match class {
            ErrorClass::FailAmbiguous | ErrorClass::FailTransient => TriageDecision::Repeat,
            ErrorClass::FailPathAlreadyExists => TriageDecision::Local(LocalAction::ResolveAmbiguity),
            _ => TriageDecision::raise_without_rollback(FinalError::TransactionCommitAmbiguous),
        };
    }
    match class {
        ErrorClass::FailExpiry => TriageDecision::expired(false),
        ErrorClass::FailAmbiguous => TriageDecision::Local(LocalAction::EnterAmbiguityResolution),
        ErrorClass::FailPathAlreadyExists => TriageDecision::Local(LocalAction::ResolveAmbiguity),
        ErrorClass::FailHard => TriageDecision::failed_no_rollback(),
        ErrorClass::FailTransient => TriageDecision::RetryTransaction,
        ErrorClass::FailDocNotFound => {
            TriageDecision::failed_no_rollback().with_cause(FailureCause::ActiveTransactionRecordNotFound)
        }
        ErrorClass::FailPathNotFound => {
            TriageDecision::failed_no_rollback().with_cause(FailureCause::ActiveTransactionRecordEntryNotFound)
        }
        ErrorClass::FailAtrFull => {
            TriageDecision::failed_no_rollback().with_cause(FailureCause::ActiveTransactionRecordsFull)
        }
        _ => TriageDecision::failed(),
    }
}

/// Moving the ATR entry to COMPLETED
pub fn set_atr_complete(class: ErrorClass) -> TriageDecision {
    match class {
        ErrorClass::FailHard => TriageDecision::post_commit(),
        // The transaction is committed either way; cleanup finishes the entry.
        _ => TriageDecision::TreatAsSuccess,
    }
}

/// Removing a document staged for removal
pub fn unstage_remove(class: ErrorClass, overtime: bool) -> TriageDecision {
    if overtime {
        return TriageDecision::post_commit()
            .with_class(ErrorClass::FailExpiry)
            .with_cause(FailureCause::AttemptExpired);
    }
    match class {
        ErrorClass::FailAmbiguous => TriageDecision::Repeat,
        _ => TriageDecision::post_commit(),
    }
}

/// Promoting a staged insert or replace
pub fn unstage_insert_or_replace(class: ErrorClass, overtime: bool) -> TriageDecision {
    if overtime {
        return TriageDecision::post_commit()
            .with_class(ErrorClass::FailExpiry)
            .with_cause(FailureCause::AttemptExpired);
    }
    match class {
        ErrorClass::FailAmbiguous => TriageDecision::Repeat,
        ErrorClass::FailCasMismatch => TriageDecision::Local(LocalAction::DocChangedDuringCommit),
        ErrorClass::FailDocNotFound => TriageDecision::Local(LocalAction::InsertMode),
        ErrorClass::FailDocAlreadyExists => TriageDecision::Local(LocalAction::DocExists),
        _ => TriageDecision::post_commit(),
    }
}

/// Moving the ATR entry to ABORTED
pub fn set_atr_aborted(class: ErrorClass) -> TriageDecision {
    match class {
        ErrorClass::FailExpiry => TriageDecision::Local(LocalAction::EnterOvertime),
        ErrorClass::FailPathNotFound => {
            TriageDecision::failed_no_rollback().with_cause(FailureCause::ActiveTransactionRecordEntryNotFound)
        }
        ErrorClass::FailDocNotFound => {
            TriageDecision::failed_no_rollback().with_cause(FailureCause::ActiveTransactionRecordNotFound)
        }
        ErrorClass::FailAtrFull => {
            TriageDecision::failed_no_rollback().with_cause(FailureCause::ActiveTransactionRecordsFull)
        }
        ErrorClass::FailHard => TriageDecision::failed_no_rollback(),
        _ => TriageDecision::Repeat,
    }
}

/// Moving the ATR entry to ROLLED_BACK
pub fn set_atr_rolled_back(class: ErrorClass) -> TriageDecision {
    match class {
        ErrorClass::FailExpiry => TriageDecision::expired(false),
        // The entry or its ATR is already gone: nothing left to mark
        ErrorClass::FailPathNotFound | ErrorClass::FailDocNotFound => TriageDecision::TreatAsSuccess,
        ErrorClass::FailAtrFull => {
            TriageDecision::failed_no_rollback().with_cause(FailureCause::ActiveTransactionRecordsFull)
        }
        ErrorClass::FailHard => TriageDecision::failed_no_rollback(),
        _ => TriageDecision::Repeat,
    }
}

/// Reverting a staged insert
pub fn rollback_staged_insert(class: ErrorClass) -> TriageDecision {
    match class {
        ErrorClass::FailExpiry => TriageDecision::Local(LocalAction::EnterOvertime),
        ErrorClass::FailPathNotFound | ErrorClass::FailDocNotFound => TriageDecision::TreatAsSuccess,
        ErrorClass::FailCasMismatch | ErrorClass::FailHard => TriageDecision::failed_no_rollback(),
        _ => TriageDecision::Repeat,
    }
}

/// Reverting a staged replace or remove
pub fn rollback_staged_replace_or_remove(class: ErrorClass) -> TriageDecision {
    match class {
        ErrorClass::FailExpiry => TriageDecision::Local(LocalAction::EnterOvertime),
        ErrorClass::FailPathNotFound => TriageDecision::TreatAsSuccess,
        ErrorClass::FailDocNotFound | ErrorClass::FailCasMismatch | ErrorClass::FailHard => {
            TriageDecision::failed_no_rollback()
        }
        _ => TriageDecision::Repeat,
    }
}

/// Looking up another attempt's ATR entry while resolving a read
pub fn atr_lookup_in_mav(class: ErrorClass) -> TriageDecision {
    match class {
        ErrorClass::FailPathNotFound => {
            TriageDecision::failed().with_cause(FailureCause::ActiveTransactionRecordEntryNotFound)
        }
        ErrorClass::FailDocNotFound => TriageDecision::failed().with_cause(FailureCause::ActiveTransactionRecordNotFound),
        _ => TriageDecision::failed(),
    }
}

/// Combine the failures recorded before a commit or further operation.
///
/// Retry is requested only if every recorded failure requested it, and
/// rollback is permitted only if every recorded failure permitted it.
pub fn combine_previous_errors(previous: &[TransactionOperationFailed]) -> Option<TransactionOperationFailed> {
    if previous.is_empty() {
        return None;
    }
    Some(TransactionOperationFailed {
        class: ErrorClass::FailOther,
        retry: previous.iter().all(|e| e.retry),
        rollback: previous.iter().all(|e| e.rollback),
        raise: FinalError::TransactionFailed,
        cause: FailureCause::PreviousOperationFailed,
    })
}
