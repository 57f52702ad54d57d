//! Lost-transaction cleanup: one sweeper per keyspace holding ATRs

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::config::TransactionConfig;
use crate::observer::TransactionObserver;
use crate::stats::CleanupStatsSnapshot;
use crate::store::{CollectionResolver, Keyspace};
use crate::sweeper::CollectionSweeper;

/// Registry of sweepers, sharing one client id
pub struct LostCleanup {
    client_id: Uuid,
    resolver: Arc<dyn CollectionResolver>,
    config: Arc<TransactionConfig>,
    observer: Arc<dyn TransactionObserver>,
    sweepers: Mutex<HashMap<Keyspace, Arc<CollectionSweeper>>>,
    started: AtomicBool,
}

impl LostCleanup {
    /// Empty registry with a fresh client id
    pub fn new(
        resolver: Arc<dyn CollectionResolver>,
        config: Arc<TransactionConfig>,
        observer: Arc<dyn TransactionObserver>,
    ) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            resolver,
            config,
            observer,
            sweepers: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Client id written into every client record
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Keyspace, Arc<CollectionSweeper>>> {
        self.sweepers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn all(&self) -> Vec<Arc<CollectionSweeper>> {
        self.lock().values().cloned().collect()
    }

    /// Sweeper for `keyspace`, created on first registration.
    ///
    /// A new sweeper starts straight away if cleanup is running.
    pub fn register(&self, keyspace: &Keyspace) -> Option<Arc<CollectionSweeper>> {
        let mut sweepers = self.lock();
        if let Some(existing) = sweepers.get(keyspace) {
            return Some(existing.clone());
        }
        let sweeper = match CollectionSweeper::new(
            keyspace.clone(),
            self.client_id,
            self.resolver.clone(),
            self.config.clone(),
            self.observer.clone(),
        ) {
            Ok(sweeper) => Arc::new(sweeper),
            Err(e) => {
                tracing::warn!(keyspace = %keyspace, error = %e, "Could not create sweeper");
                return None;
            }
        };
        tracing::debug!(keyspace = %keyspace, "Registered keyspace for lost-transaction cleanup");
        if self.started.load(Ordering::Acquire) {
            sweeper.start();
        }
        sweepers.insert(keyspace.clone(), sweeper.clone());
        Some(sweeper)
    }

    /// Start every sweeper, and any registered later. Must be called within a tokio runtime.
    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
        for sweeper in self.all() {
            sweeper.start();
        }
    }

    /// Stop every sweeper
    pub async fn stop(&self) {
        self.started.store(false, Ordering::Release);
        for sweeper in self.all() {
            sweeper.stop().await;
        }
    }

    /// Stop every sweeper and remove this client from each client record
    pub async fn dispose(&self) {
        self.started.store(false, Ordering::Release);
        let sweepers: Vec<_> = self.lock().drain().map(|(_, sweeper)| sweeper).collect();
        for sweeper in sweepers {
            sweeper.dispose().await;
        }
    }

    /// Registered keyspaces
    pub fn keyspaces(&self) -> Vec<Keyspace> {
        self.lock().keys().cloned().collect()
    }

    /// Sweeper for `keyspace`, if registered
    pub fn sweeper(&self, keyspace: &Keyspace) -> Option<Arc<CollectionSweeper>> {
        self.lock().get(keyspace).cloned()
    }

    /// Cycles run for `keyspace`
    pub fn run_count(&self, keyspace: &Keyspace) -> Option<u64> {
        self.sweeper(keyspace).map(|s| s.run_count())
    }

    /// Whether the sweeper for `keyspace` is running
    pub fn running(&self, keyspace: &Keyspace) -> bool {
        self.sweeper(keyspace).is_some_and(|s| s.is_running())
    }

    /// Counters for `keyspace`
    pub fn stats(&self, keyspace: &Keyspace) -> Option<CleanupStatsSnapshot> {
        self.sweeper(keyspace).map(|s| s.stats().snapshot())
    }
}

impl std::fmt::Debug for LostCleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LostCleanup")
            .field("client_id", &self.client_id)
            .field("keyspaces", &self.keyspaces())
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::observer::NoOpObserver;
    use std::time::Duration;

    fn cleanup() -> LostCleanup {
        let config = TransactionConfig {
            cleanup_window: Duration::from_millis(50),
            num_atrs: 4,
            ..TransactionConfig::default()
        };
        LostCleanup::new(Arc::new(InMemoryStore::new()), Arc::new(config), Arc::new(NoOpObserver))
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_is_idempotent() {
        let cleanup = cleanup();
        let ks = Keyspace::default_collection("b");
        let first = cleanup.register(&ks).unwrap();
        let second = cleanup.register(&ks).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cleanup.keyspaces(), vec![ks.clone()]);
        assert_eq!(first.client_id(), cleanup.client_id());
        assert!(!cleanup.running(&ks));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle() {
        let cleanup = cleanup();
        let ks = Keyspace::default_collection("b");
        cleanup.register(&ks);
        cleanup.start();
        assert!(cleanup.running(&ks));

        // Registered after start: runs too.
        let late = Keyspace::new("b", "s", "c");
        cleanup.register(&late);
        assert!(cleanup.running(&late));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cleanup.run_count(&ks).unwrap() >= 2);

        cleanup.stop().await;
        assert!(!cleanup.running(&ks));
        assert!(!cleanup.running(&late));

        cleanup.dispose().await;
        assert!(cleanup.keyspaces().is_empty());
        assert_eq!(cleanup.run_count(&ks), None);
    }
}
