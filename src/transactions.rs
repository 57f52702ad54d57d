//! Transaction run loop

use std::future::Future;
use std::sync::Arc;

use crate::attempt::AttemptContext;
use crate::config::{ConfigError, TransactionConfig};
use crate::context::{TransactionContext, TransactionId};
use crate::errors::{FinalError, TransactionError, TransactionFailure, TransactionOperationFailed};
use crate::lost_cleanup::LostCleanup;
use crate::observer::{NoOpObserver, TransactionObserver};
use crate::retry::RetryPolicy;
use crate::store::CollectionResolver;

/// Outcome of a successful transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionResult {
    /// Transaction id
    pub transaction_id: TransactionId,
    /// `false` when the commit point was reached but some documents are still
    /// staged; lost-transaction cleanup will finish them
    pub unstaging_complete: bool,
    /// Attempts used, including the successful one
    pub attempts: u32,
}

/// Entry point for running transactions against one store
pub struct Transactions {
    resolver: Arc<dyn CollectionResolver>,
    config: Arc<TransactionConfig>,
    observer: Arc<dyn TransactionObserver>,
    cleanup: Arc<LostCleanup>,
}

impl Transactions {
    /// Validate `config` and set up lost-transaction cleanup
    pub fn new(resolver: Arc<dyn CollectionResolver>, config: TransactionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        let observer: Arc<dyn TransactionObserver> = Arc::new(NoOpObserver);
        let cleanup = Arc::new(LostCleanup::new(resolver.clone(), config.clone(), observer.clone()));
        Ok(Self { resolver, config, observer, cleanup })
    }

    /// Replace the observer, for attempts and cleanup alike
    pub fn with_observer(mut self, observer: Arc<dyn TransactionObserver>) -> Self {
        self.cleanup = Arc::new(LostCleanup::new(self.resolver.clone(), self.config.clone(), observer.clone()));
        self.observer = observer;
        self
    }

    /// Effective configuration
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Lost-transaction cleanup owned by this instance
    pub fn cleanup(&self) -> &Arc<LostCleanup> {
        &self.cleanup
    }

    /// Run `logic` in a transaction, retrying it in fresh attempts as needed.
    ///
    /// `logic` is called once per attempt. If it returns `Ok` without
    /// committing or rolling back, the attempt is committed. Returning an
    /// error rolls the attempt back; the error's `retry` flag decides whether
    /// another attempt follows.
    pub async fn run<F, Fut>(&self, logic: F) -> Result<TransactionResult, TransactionError>
    where
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = Result<(), TransactionOperationFailed>>,
    {
        let txn = TransactionContext::new(self.config.clone());
        let policy = RetryPolicy::transaction();
        let mut causes: Vec<TransactionOperationFailed> = Vec::new();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let ctx = AttemptContext::new(txn.clone(), self.resolver.clone());
            let attempt_id = ctx.attempt_id();
            self.observer.on_attempt_started(&txn, &attempt_id);

            let outcome = match logic(ctx.clone()).await {
                Ok(()) => ctx.finish().await,
                Err(e) => Err(e),
            };
            self.register_for_cleanup(&ctx);

            let error = match outcome {
                Ok(()) => {
                    let result = TransactionResult { transaction_id: txn.transaction_id, unstaging_complete: true, attempts };
                    self.observer.on_transaction_completed(&txn, &result);
                    return Ok(result);
                }
                Err(e) if e.is_post_commit() => {
                    self.observer.on_attempt_failed(&txn, &attempt_id, &e);
                    let result = TransactionResult { transaction_id: txn.transaction_id, unstaging_complete: false, attempts };
                    self.observer.on_transaction_completed(&txn, &result);
                    return Ok(result);
                }
                Err(e) => e,
            };
            self.observer.on_attempt_failed(&txn, &attempt_id, &error);

            if error.rollback {
                if let Err(rollback_error) = ctx.rollback_if_open().await {
                    tracing::warn!(
                        txn_id = %txn.transaction_id,
                        attempt_id = %attempt_id,
                        error = %rollback_error,
                        "Rollback failed, leaving the attempt to cleanup"
                    );
                }
            }
            causes.push(error.clone());

            let raise = if error.retry {
                if !txn.has_expired() {
                    tokio::time::sleep(policy.jittered_delay_for_attempt(attempts)).await;
                    continue;
                }
                FinalError::TransactionExpired
            } else {
                error.raise
            };

            let failure = Box::new(TransactionFailure {
                transaction_id: txn.transaction_id,
                cause: error,
                attempt_causes: causes,
            });
            let err = match raise {
                FinalError::TransactionExpired => TransactionError::Expired(failure),
                FinalError::TransactionCommitAmbiguous => TransactionError::CommitAmbiguous(failure),
                FinalError::TransactionFailed | FinalError::TransactionFailedPostCommit => {
                    TransactionError::Failed(failure)
                }
            };
            self.observer.on_transaction_failed(&txn, &err);
            return Err(err);
        }
    }

    fn register_for_cleanup(&self, ctx: &AttemptContext) {
        if !self.config.cleanup_lost_attempts {
            return;
        }
        if let Some(atr) = ctx.atr() {
            self.cleanup.register(&atr.keyspace());
        }
    }
}

impl std::fmt::Debug for Transactions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transactions").field("config", &self.config).finish()
    }
}
