//! Transaction observer trait

use crate::atr::AtrRef;
use crate::context::{AttemptId, TransactionContext};
use crate::errors::{TransactionError, TransactionOperationFailed};
use crate::state::AtrState;
use crate::transactions::TransactionResult;

/// Observer trait for external observability
pub trait TransactionObserver: Send + Sync + 'static {
    /// A new attempt is about to run the application logic
    fn on_attempt_started(&self, context: &TransactionContext, attempt_id: &AttemptId);
    /// An attempt ended with a failure
    fn on_attempt_failed(&self, context: &TransactionContext, attempt_id: &AttemptId, error: &TransactionOperationFailed);
    /// The transaction committed (possibly with unstaging left to cleanup)
    fn on_transaction_completed(&self, context: &TransactionContext, result: &TransactionResult);
    /// The transaction gave up
    fn on_transaction_failed(&self, context: &TransactionContext, error: &TransactionError);
    /// Lost-transaction cleanup finished an ATR entry
    fn on_entry_cleaned(&self, atr: &AtrRef, attempt_id: &str, state: AtrState);
}

/// No-op observer
pub struct NoOpObserver;

impl TransactionObserver for NoOpObserver {
    fn on_attempt_started(&self, _context: &TransactionContext, _attempt_id: &AttemptId) {}
    fn on_attempt_failed(&self, _context: &TransactionContext, _attempt_id: &AttemptId, _error: &TransactionOperationFailed) {}
    fn on_transaction_completed(&self, _context: &TransactionContext, _result: &TransactionResult) {}
    fn on_transaction_failed(&self, _context: &TransactionContext, _error: &TransactionError) {}
    fn on_entry_cleaned(&self, _atr: &AtrRef, _attempt_id: &str, _state: AtrState) {}
}

/// Tracing-based observer
pub struct TracingObserver;

impl TransactionObserver for TracingObserver {
    fn on_attempt_started(&self, context: &TransactionContext, attempt_id: &AttemptId) {
        tracing::info!(txn_id = %context.transaction_id, attempt_id = %attempt_id, "Attempt started");
    }

    fn on_attempt_failed(&self, context: &TransactionContext, attempt_id: &AttemptId, error: &TransactionOperationFailed) {
        tracing::warn!(
            txn_id = %context.transaction_id,
            attempt_id = %attempt_id,
            retry = error.retry,
            rollback = error.rollback,
            error = %error.cause,
            "Attempt failed"
        );
    }

    fn on_transaction_completed(&self, context: &TransactionContext, result: &TransactionResult) {
        tracing::info!(
            txn_id = %context.transaction_id,
            attempts = result.attempts,
            unstaging_complete = result.unstaging_complete,
            elapsed_ms = context.elapsed().as_millis() as u64,
            "Transaction completed"
        );
    }

    fn on_transaction_failed(&self, context: &TransactionContext, error: &TransactionError) {
        tracing::error!(txn_id = %context.transaction_id, error = %error, "Transaction failed");
    }

    fn on_entry_cleaned(&self, atr: &AtrRef, attempt_id: &str, state: AtrState) {
        tracing::info!(atr = %atr, attempt_id = %attempt_id, state = %state, "Lost attempt cleaned up");
    }
}
