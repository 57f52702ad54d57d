//! Lost-transaction sweeper for one keyspace
//!
//! A [`CollectionSweeper`] owns a single tokio task that wakes once per
//! cleanup window. Each cycle refreshes this client's row in the client
//! record, derives the ATRs this client is responsible for, and visits each
//! of them once in random order, paced to spread the visits over the window.
//! Expired entries found along the way are handed to the [`Cleaner`].
//!
//! Cycles can also be driven directly with [`CollectionSweeper::run_cycle`];
//! an atomic guard makes an overlapping call return straight away.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::atr::{atr_id, AtrRef};
use crate::cleaner::{Cleaner, CleanupError, CleanupRequest};
use crate::client_record::{ClientEntry, ClientRecordDetails, SAFETY_MARGIN};
use crate::config::TransactionConfig;
use crate::context::now_millis;
use crate::observer::TransactionObserver;
use crate::repository::{lookup_attempts, ClientRecordRepository};
use crate::retry::RetryPolicy;
use crate::stats::CleanupStats;
use crate::store::{Collection, CollectionResolver, Keyspace, StoreError};

/// Read-modify-write rounds on the client record before giving up
const MAX_RECORD_TRIES: u32 = 8;

/// Budget for removing this client from the client record on dispose
const REMOVAL_BUDGET: Duration = Duration::from_millis(250);

/// Below this, pacing spins instead of sleeping
const MIN_SLEEP: Duration = Duration::from_millis(10);

/// Shuffled queue of ATR indices, refilled from the assignment when drained
#[derive(Debug, Default)]
pub struct AtrQueue {
    assignment: Vec<u16>,
    pending: Vec<u16>,
}

impl AtrQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw the next index of `assignment`.
    ///
    /// A changed assignment discards the current round.
    pub fn next(&mut self, assignment: &[u16]) -> Option<u16> {
        if self.assignment != assignment {
            self.assignment = assignment.to_vec();
            self.pending.clear();
        }
        if self.pending.is_empty() {
            self.pending = self.assignment.clone();
            self.pending.shuffle(&mut rand::thread_rng());
        }
        self.pending.pop()
    }

    /// Indices left in the current round
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

/// What one cycle did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle was already running
    Overlapping,
    /// The client record's override flag is set
    Overridden,
    /// Assigned ATRs were visited
    Swept {
        /// ATRs looked up
        atrs: usize,
        /// Expired entries found
        found: usize,
        /// Entries removed
        cleaned: usize,
    },
}

struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Sweeper for one keyspace
pub struct CollectionSweeper {
    keyspace: Keyspace,
    client_id: Uuid,
    collection: Arc<dyn Collection>,
    records: ClientRecordRepository,
    cleaner: Cleaner,
    config: Arc<TransactionConfig>,
    queue: Mutex<AtrQueue>,
    in_cycle: AtomicBool,
    stats: Arc<CleanupStats>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CollectionSweeper {
    /// Sweeper for `keyspace`, acting as `client_id`
    pub fn new(
        keyspace: Keyspace,
        client_id: Uuid,
        resolver: Arc<dyn CollectionResolver>,
        config: Arc<TransactionConfig>,
        observer: Arc<dyn TransactionObserver>,
    ) -> Result<Self, CleanupError> {
        let collection = resolver.collection(&keyspace)?;
        let records = ClientRecordRepository::new(collection.clone(), config.durability);
        let cleaner = Cleaner::new(resolver, &config, observer);
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            keyspace,
            client_id,
            collection,
            records,
            cleaner,
            config,
            queue: Mutex::new(AtrQueue::new()),
            in_cycle: AtomicBool::new(false),
            stats: Arc::new(CleanupStats::new()),
            stop_tx,
            task: Mutex::new(None),
        })
    }

    /// Keyspace swept
    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    /// Client id used in the client record
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// Counters
    pub fn stats(&self) -> &Arc<CleanupStats> {
        &self.stats
    }

    /// Cycles started so far
    pub fn run_count(&self) -> u64 {
        self.stats.snapshot().run_count
    }

    /// Whether the background task is alive
    pub fn is_running(&self) -> bool {
        self.lock_task().as_ref().is_some_and(|handle| !handle.is_finished())
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Spawn the background task. Must be called within a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.lock_task();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        self.stop_tx.send_replace(false);
        let mut stop_rx = self.stop_tx.subscribe();
        let sweeper = Arc::clone(self);
        tracing::info!(keyspace = %self.keyspace, client_id = %self.client_id, "Starting lost-transaction sweeper");

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.config.cleanup_window);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = sweeper.run_cycle().await {
                            tracing::warn!(keyspace = %sweeper.keyspace, error = %e, "Cleanup cycle failed");
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            tracing::debug!(keyspace = %sweeper.keyspace, "Sweeper task exited");
        }));
    }

    /// Stop the background task, letting an in-flight ATR visit finish
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let handle = self.lock_task().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(keyspace = %self.keyspace, error = %e, "Sweeper task ended abnormally");
            }
        }
    }

    /// Stop, then remove this client's row from the client record
    pub async fn dispose(&self) {
        self.stop().await;

        let client_id = self.client_id.to_string();
        let policy = RetryPolicy::client_record_removal();
        let deadline = Instant::now() + REMOVAL_BUDGET;
        let mut attempt = 0;
        loop {
            match self.records.remove_client(&client_id).await {
                Ok(_) => {
                    tracing::debug!(keyspace = %self.keyspace, client_id = %client_id, "Removed client from client record");
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    let delay = policy.jittered_delay_for_attempt(attempt);
                    if Instant::now() + delay > deadline {
                        CleanupStats::incr(&self.stats.client_record_failures);
                        tracing::warn!(
                            keyspace = %self.keyspace,
                            client_id = %client_id,
                            error = %e,
                            "Giving up removing client from client record"
                        );
                        return;
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Run one cycle now
    pub async fn run_cycle(&self) -> Result<CycleOutcome, CleanupError> {
        self.run_cycle_at(now_millis()).await
    }

    /// Run one cycle as if the wall clock read `now_ms` when it started
    pub async fn run_cycle_at(&self, now_ms: u64) -> Result<CycleOutcome, CleanupError> {
        if self.in_cycle.swap(true, Ordering::AcqRel) {
            return Ok(CycleOutcome::Overlapping);
        }
        let _guard = CycleGuard(&self.in_cycle);
        CleanupStats::incr(&self.stats.run_count);

        let details = match self.update_client_record(now_ms).await {
            Ok(details) => details,
            Err(e) => {
                CleanupStats::incr(&self.stats.client_record_failures);
                return Err(e);
            }
        };
        if details.override_active {
            tracing::info!(keyspace = %self.keyspace, "Cleanup override active, standing down");
            return Ok(CycleOutcome::Overridden);
        }

        let window = self.config.cleanup_window;
        let per_atr = details.check_atr_time_window(window);
        let started = Instant::now();
        let deadline = started + window;
        let assigned = details.atrs_handled.len();
        let (mut atrs, mut found, mut cleaned) = (0, 0, 0);

        for visit in 0..assigned {
            if self.stop_requested() || Instant::now() >= deadline {
                tracing::debug!(keyspace = %self.keyspace, visited = atrs, assigned, "Cycle cut short");
                break;
            }
            let next = self.queue.lock().unwrap_or_else(PoisonError::into_inner).next(&details.atrs_handled);
            let Some(index) = next else {
                break;
            };

            let now = now_ms + started.elapsed().as_millis() as u64;
            let (f, c) = self.check_atr(index, now).await;
            atrs += 1;
            found += f;
            cleaned += c;

            // Paced against the cycle start so oversleeping does not accumulate.
            if visit + 1 < assigned {
                let due = started + per_atr * (visit as u32 + 1);
                pace(due.saturating_duration_since(Instant::now())).await;
            }
        }

        tracing::debug!(keyspace = %self.keyspace, atrs, found, cleaned, "Cleanup cycle finished");
        Ok(CycleOutcome::Swept { atrs, found, cleaned })
    }

    /// Refresh this client's heartbeat and share, pruning expired clients
    async fn update_client_record(&self, now_ms: u64) -> Result<ClientRecordDetails, CleanupError> {
        let client_id = self.client_id.to_string();
        let expires_ms = (self.config.cleanup_window + SAFETY_MARGIN).as_millis() as u64;

        for _ in 0..MAX_RECORD_TRIES {
            let Some((record, cas)) = self.records.get().await? else {
                if self.records.create_placeholder().await? {
                    tracing::debug!(keyspace = %self.keyspace, "Created client record");
                }
                continue;
            };

            let details = ClientRecordDetails::compute(&record, self.client_id, self.config.num_atrs, now_ms);
            let entry = ClientEntry {
                heartbeat_ms: now_ms,
                expires_ms,
                num_atrs: self.config.num_atrs,
                atrs: details.atrs_handled.clone(),
            };
            match self.records.update(&client_id, &entry, &details.expired_clients, cas).await {
                Ok(_) => {
                    tracing::debug!(
                        keyspace = %self.keyspace,
                        clients = details.active_clients.len(),
                        pruned = details.expired_clients.len(),
                        atrs = details.atrs_handled.len(),
                        "Client record updated"
                    );
                    return Ok(details);
                }
                // Lost the race to another client: read again.
                Err(StoreError::CasMismatch | StoreError::DocumentNotFound | StoreError::PathNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Err(CleanupError::ClientRecordContention(MAX_RECORD_TRIES))
    }

    /// Clean every expired entry of ATR `index`. Returns (found, cleaned).
    async fn check_atr(&self, index: u16, now_ms: u64) -> (usize, usize) {
        let id = atr_id(index as usize);
        CleanupStats::incr(&self.stats.atrs_checked);

        let entries = match lookup_attempts(self.collection.as_ref(), &id).await {
            Ok(Some(entries)) => entries,
            Ok(None) => return (0, 0),
            Err(e) => {
                CleanupStats::incr(&self.stats.cleanup_failures);
                tracing::warn!(keyspace = %self.keyspace, atr = %id, error = %e, "ATR lookup failed");
                return (0, 0);
            }
        };

        let (mut found, mut cleaned) = (0, 0);
        for (attempt_id, entry) in entries {
            if !entry.has_expired(now_ms) {
                continue;
            }
            found += 1;
            CleanupStats::incr(&self.stats.entries_found);
            let request = CleanupRequest { atr: AtrRef::new(&self.keyspace, id.clone()), attempt_id, entry };
            match self.cleaner.clean(&request).await {
                Ok(true) => {
                    cleaned += 1;
                    CleanupStats::incr(&self.stats.entries_cleaned);
                }
                Ok(false) => {}
                Err(e) => {
                    CleanupStats::incr(&self.stats.cleanup_failures);
                    tracing::warn!(
                        atr = %request.atr,
                        attempt_id = %request.attempt_id,
                        error = %e,
                        "Cleanup of lost attempt failed, will retry next cycle"
                    );
                }
            }
        }
        (found, cleaned)
    }
}

impl std::fmt::Debug for CollectionSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionSweeper")
            .field("keyspace", &self.keyspace)
            .field("client_id", &self.client_id)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

/// Wait out the rest of an ATR's budget
async fn pace(remaining: Duration) {
    if remaining >= MIN_SLEEP {
        tokio::time::sleep(remaining).await;
        return;
    }
    let spin_started = std::time::Instant::now();
    while spin_started.elapsed() < remaining {
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atr::AtrEntry;
    use crate::client_record::{ClientRecord, OverrideEntry, CLIENT_RECORD_FIELD, CLIENT_RECORD_ID};
    use crate::config::DurabilityLevel;
    use crate::memory::{FaultOp, InMemoryCollection, InMemoryStore};
    use crate::observer::NoOpObserver;
    use crate::repository::AtrRepository;
    use std::collections::HashSet;

    const NUM_ATRS: usize = 8;

    fn config() -> Arc<TransactionConfig> {
        Arc::new(TransactionConfig {
            durability: DurabilityLevel::None,
            num_atrs: NUM_ATRS,
            cleanup_window: Duration::from_millis(80),
            ..TransactionConfig::default()
        })
    }

    fn setup() -> (Arc<InMemoryStore>, Arc<InMemoryCollection>, Arc<CollectionSweeper>) {
        let store = Arc::new(InMemoryStore::new());
        let keyspace = Keyspace::default_collection("b");
        let coll = store.in_memory(&keyspace).unwrap();
        let sweeper =
            CollectionSweeper::new(keyspace, Uuid::new_v4(), store.clone(), config(), Arc::new(NoOpObserver)).unwrap();
        (store, coll, Arc::new(sweeper))
    }

    async fn write_entry(coll: &Arc<InMemoryCollection>, index: usize, attempt: &str, start_ms: u64) {
        let handle: Arc<dyn Collection> = coll.clone();
        let repo = AtrRepository::new(handle, atr_id(index), attempt.into(), DurabilityLevel::None);
        repo.set_pending(&AtrEntry::pending("t", start_ms, 1_000, "n")).await.unwrap();
    }

    #[test]
    fn test_queue_visits_each_index_once_per_round() {
        let mut queue = AtrQueue::new();
        let assignment = vec![1, 3, 5, 7];
        let round: HashSet<u16> = (0..4).filter_map(|_| queue.next(&assignment)).collect();
        assert_eq!(round, assignment.iter().copied().collect());
        assert_eq!(queue.remaining(), 0);

        // Drained: the next draw starts a fresh round.
        assert!(queue.next(&assignment).is_some());
        assert_eq!(queue.remaining(), 3);

        // A new assignment discards the old round.
        assert_eq!(queue.next(&[2]), Some(2));
        assert_eq!(queue.next(&[]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_cleans_only_expired_entries() {
        let (_store, coll, sweeper) = setup();
        write_entry(&coll, 2, "old", 1_000).await;
        write_entry(&coll, 2, "young", 50_000).await;

        let outcome = sweeper.run_cycle_at(10_000).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Swept { atrs: NUM_ATRS, found: 1, cleaned: 1 });

        let left = lookup_attempts(coll.as_ref(), &atr_id(2)).await.unwrap().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].0.as_ref(), "young");

        let stats = sweeper.stats().snapshot();
        assert_eq!(stats.run_count, 1);
        assert_eq!(stats.atrs_checked, NUM_ATRS as u64);
        assert_eq!(stats.entries_cleaned, 1);

        // Idempotent.
        let outcome = sweeper.run_cycle_at(10_000).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Swept { atrs: NUM_ATRS, found: 0, cleaned: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_registers_client() {
        let (_store, coll, sweeper) = setup();
        sweeper.run_cycle_at(1_000).await.unwrap();

        let raw = coll.peek(CLIENT_RECORD_ID).unwrap();
        let record: ClientRecord = serde_json::from_value(raw.xattr(CLIENT_RECORD_FIELD).unwrap().clone()).unwrap();
        let me = &record.clients[&sweeper.client_id().to_string()];
        assert_eq!(me.heartbeat_ms, 1_000);
        assert_eq!(me.expires_ms, 20_080);
        assert_eq!(me.atrs.len(), NUM_ATRS);

        sweeper.dispose().await;
        let raw = coll.peek(CLIENT_RECORD_ID).unwrap();
        let record: ClientRecord = serde_json::from_value(raw.xattr(CLIENT_RECORD_FIELD).unwrap().clone()).unwrap();
        assert!(record.clients.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_stands_down() {
        let (_store, coll, sweeper) = setup();
        sweeper.run_cycle_at(1_000).await.unwrap();

        let records = ClientRecordRepository::new(coll.clone(), DurabilityLevel::None);
        let (_, cas) = records.get().await.unwrap().unwrap();
        let override_entry = OverrideEntry { enabled: true, expires_ms: 5_000 };
        coll.mutate_in(
            CLIENT_RECORD_ID,
            vec![crate::store::MutateSpec::upsert_xattr(
                format!("{CLIENT_RECORD_FIELD}.override"),
                serde_json::to_value(&override_entry).unwrap(),
            )],
            crate::store::MutateOptions::replace(cas, DurabilityLevel::None),
        )
        .await
        .unwrap();

        assert_eq!(sweeper.run_cycle_at(2_000).await.unwrap(), CycleOutcome::Overridden);
        assert!(matches!(sweeper.run_cycle_at(6_000).await.unwrap(), CycleOutcome::Swept { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_lookup_is_counted_and_skipped() {
        let (_store, coll, sweeper) = setup();
        for index in 0..NUM_ATRS {
            coll.inject_fault(FaultOp::Get, &atr_id(index), StoreError::TemporaryFailure, Some(1));
        }
        let outcome = sweeper.run_cycle_at(1_000).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Swept { atrs: NUM_ATRS, found: 0, cleaned: 0 });
        assert_eq!(sweeper.stats().snapshot().cleanup_failures, NUM_ATRS as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_task_runs_cycles_until_stopped() {
        let (_store, _coll, sweeper) = setup();
        sweeper.start();
        assert!(sweeper.is_running());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(sweeper.run_count() >= 2);

        sweeper.stop().await;
        assert!(!sweeper.is_running());
        let after_stop = sweeper.run_count();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(sweeper.run_count(), after_stop);
    }
}
