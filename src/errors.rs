//! Error taxonomy for attempts and transactions

use crate::context::TransactionId;
use crate::store::StoreError;

/// Classification of any failure seen by an attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Document does not exist
    FailDocNotFound,
    /// Document already exists
    FailDocAlreadyExists,
    /// CAS did not match
    FailCasMismatch,
    /// Sub-document path missing
    FailPathNotFound,
    /// Sub-document path already present
    FailPathAlreadyExists,
    /// Temporary condition, safe to retry
    FailTransient,
    /// Outcome unknown
    FailAmbiguous,
    /// Unrecoverable
    FailHard,
    /// Attempt ran out of time
    FailExpiry,
    /// ATR document cannot take more entries
    FailAtrFull,
    /// Document staged by another attempt that is still live
    FailWriteWriteConflict,
    /// Anything else
    FailOther,
}

impl ErrorClass {
    /// Classify a store failure
    pub fn classify(error: &StoreError) -> Self {
        match error {
            StoreError::DocumentNotFound => Self::FailDocNotFound,
            StoreError::DocumentExists => Self::FailDocAlreadyExists,
            StoreError::CasMismatch => Self::FailCasMismatch,
            StoreError::PathNotFound(_) => Self::FailPathNotFound,
            StoreError::PathExists(_) => Self::FailPathAlreadyExists,
            StoreError::ValueTooLarge => Self::FailAtrFull,
            StoreError::AmbiguousTimeout | StoreError::DurabilityAmbiguous | StoreError::RequestCanceled => {
                Self::FailAmbiguous
            }
            StoreError::UnambiguousTimeout | StoreError::TemporaryFailure => Self::FailTransient,
            StoreError::InternalServerFailure(_) | StoreError::IllegalTransition(_) => Self::FailHard,
            StoreError::Other(_) => Self::FailOther,
        }
    }
}

impl From<&StoreError> for ErrorClass {
    fn from(error: &StoreError) -> Self {
        Self::classify(error)
    }
}

/// What `run` raises once an attempt gives up
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FinalError {
    /// Failed and rolled back (or could not be)
    #[default]
    TransactionFailed,
    /// Ran out of time
    TransactionExpired,
    /// Failed around the commit point; outcome unknown
    TransactionCommitAmbiguous,
    /// Committed, but post-commit work did not finish
    TransactionFailedPostCommit,
}

/// The underlying reason for a failed operation
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum FailureCause {
    /// Attempt exceeded its expiry
    #[error("attempt expired")]
    AttemptExpired,
    /// ATR document is full
    #[error("active transaction record is full")]
    ActiveTransactionRecordsFull,
    /// ATR document not found
    #[error("active transaction record not found")]
    ActiveTransactionRecordNotFound,
    /// ATR entry for this attempt not found
    #[error("active transaction record entry not found")]
    ActiveTransactionRecordEntryNotFound,
    /// Document is staged by another live attempt
    #[error("document is already in a transaction")]
    DocumentAlreadyInTransaction,
    /// Insert of an existing document
    #[error("document already exists")]
    DocumentExists,
    /// Read or write of a missing document
    #[error("document not found")]
    DocumentNotFound,
    /// An earlier operation in this attempt failed
    #[error("a previous operation failed")]
    PreviousOperationFailed,
    /// Operation not valid in the attempt's current state
    #[error("illegal attempt state: {0}")]
    IllegalState(Box<str>),
    /// Raised by application logic
    #[error("application error: {0}")]
    Application(Box<str>),
    /// Store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure of a single attempt operation.
///
/// `retry` asks the run loop to start a fresh attempt, `rollback` permits
/// rolling back this attempt first, and `raise` names what to surface when no
/// retry happens.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("transaction operation failed ({class:?}, retry={retry}, rollback={rollback}): {cause}")]
pub struct TransactionOperationFailed {
    /// Classification
    pub class: ErrorClass,
    /// Retry the transaction
    pub retry: bool,
    /// Roll the attempt back before retrying or raising
    pub rollback: bool,
    /// Error to raise when not retrying
    pub raise: FinalError,
    /// Underlying cause
    pub cause: FailureCause,
}

impl TransactionOperationFailed {
    /// Non-retrying failure that rolls back and raises `TransactionFailed`
    pub fn new(class: ErrorClass, cause: impl Into<FailureCause>) -> Self {
        Self {
            class,
            retry: false,
            rollback: true,
            raise: FinalError::TransactionFailed,
            cause: cause.into(),
        }
    }

    /// Wrap an application error
    pub fn application(reason: impl std::fmt::Display) -> Self {
        Self::new(ErrorClass::FailOther, FailureCause::Application(reason.to_string().into()))
    }

    /// Failure for an operation attempted in an illegal state
    pub fn illegal_state(reason: impl Into<Box<str>>) -> Self {
        Self::new(ErrorClass::FailOther, FailureCause::IllegalState(reason.into())).no_rollback()
    }

    /// Request a retry
    pub fn retry(mut self) -> Self {
        self.retry = true;
        self
    }

    /// Forbid rollback
    pub fn no_rollback(mut self) -> Self {
        self.rollback = false;
        self
    }

    /// Set the error to raise
    pub fn raise(mut self, raise: FinalError) -> Self {
        self.raise = raise;
        self
    }

    /// Whether this failure happened after the commit point
    pub fn is_post_commit(&self) -> bool {
        self.raise == FinalError::TransactionFailedPostCommit
    }
}

impl From<StoreError> for TransactionOperationFailed {
    fn from(error: StoreError) -> Self {
        Self::new(ErrorClass::classify(&error), error)
    }
}

/// Details of a transaction that did not succeed
#[derive(Clone, Debug)]
pub struct TransactionFailure {
    /// Transaction that failed
    pub transaction_id: TransactionId,
    /// Failure that ended the final attempt
    pub cause: TransactionOperationFailed,
    /// Every failure recorded across attempts, oldest first
    pub attempt_causes: Vec<TransactionOperationFailed>,
}

impl std::fmt::Display for TransactionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "transaction {} after {} failure(s): {}",
            self.transaction_id,
            self.attempt_causes.len(),
            self.cause
        )
    }
}

/// What [`crate::Transactions::run`] returns on failure
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// The transaction failed; it was rolled back or never reached the commit point
    #[error("transaction failed: {0}")]
    Failed(Box<TransactionFailure>),
    /// The transaction ran out of time before committing
    #[error("transaction expired: {0}")]
    Expired(Box<TransactionFailure>),
    /// The transaction failed around the commit point and may have committed
    #[error("transaction commit ambiguous: {0}")]
    CommitAmbiguous(Box<TransactionFailure>),
}

impl TransactionError {
    /// Failure details
    pub fn failure(&self) -> &TransactionFailure {
        match self {
            Self::Failed(f) | Self::Expired(f) | Self::CommitAmbiguous(f) => f,
        }
    }

    /// Expired transactions are also failed transactions
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Expired(_))
    }

    /// Whether the commit outcome is unknown
    pub fn is_commit_ambiguous(&self) -> bool {
        matches!(self, Self::CommitAmbiguous(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_store_errors() {
        assert_eq!(ErrorClass::classify(&StoreError::CasMismatch), ErrorClass::FailCasMismatch);
        assert_eq!(ErrorClass::classify(&StoreError::ValueTooLarge), ErrorClass::FailAtrFull);
        assert_eq!(ErrorClass::classify(&StoreError::AmbiguousTimeout), ErrorClass::FailAmbiguous);
        assert_eq!(ErrorClass::classify(&StoreError::RequestCanceled), ErrorClass::FailAmbiguous);
        assert_eq!(ErrorClass::classify(&StoreError::TemporaryFailure), ErrorClass::FailTransient);
        assert_eq!(
            ErrorClass::classify(&StoreError::IllegalTransition(crate::state::IllegalTransition {
                from: "COMMITTED",
                to: "ABORTED",
            })),
            ErrorClass::FailHard
        );
        assert_eq!(
            ErrorClass::classify(&StoreError::PathExists("attempts.a".into())),
            ErrorClass::FailPathAlreadyExists
        );
        assert_eq!(
            ErrorClass::classify(&StoreError::InternalServerFailure("boom".into())),
            ErrorClass::FailHard
        );
    }

    #[test]
    fn test_operation_failed_defaults() {
        let err = TransactionOperationFailed::from(StoreError::DocumentNotFound);
        assert_eq!(err.class, ErrorClass::FailDocNotFound);
        assert!(!err.retry);
        assert!(err.rollback);
        assert_eq!(err.raise, FinalError::TransactionFailed);

        let err = TransactionOperationFailed::illegal_state("already committed");
        assert!(!err.rollback);
    }
}
