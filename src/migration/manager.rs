//! Migration manager: live-tunable knobs, counters, and worker observation
//!
//! The worker task owns phase progression; the caller's thread polls the
//! manager, tunes throttles, and prints status. Tunables and counters are
//! word-sized atomics read once per batch boundary, so an operator's change
//! takes effect no later than the next batch.

use mongodb::bson::Bson;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info};

use super::driver::{self, MigrationRequest};
use super::{MigrationError, MigrationResult};
use crate::config::ClusterConfig;
use crate::metadata::MetadataStore;
use crate::topology::{ClusterRegistry, Location};

/// Phase label the worker reports while it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MigrationPhase {
    Pending,
    Copy,
    Sync,
    Delete,
    Complete,
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MigrationPhase::Pending => "pending",
            MigrationPhase::Copy => "copy",
            MigrationPhase::Sync => "sync",
            MigrationPhase::Delete => "delete",
            MigrationPhase::Complete => "complete",
        };
        f.write_str(label)
    }
}

/// Shared knobs and counters between the worker and the caller.
///
/// Throttles are stored as whole milliseconds and batch sizes as document
/// counts, all in atomics so neither side needs a critical section.
#[derive(Debug)]
pub struct MigrationControls {
    insert_throttle_ms: AtomicU64,
    delete_throttle_ms: AtomicU64,
    insert_batch_size: AtomicUsize,
    delete_batch_size: AtomicUsize,
    inserted: AtomicU64,
    deleted: AtomicU64,
    phase: RwLock<MigrationPhase>,
}

impl MigrationControls {
    pub fn new(
        insert_throttle: Duration,
        delete_throttle: Duration,
        insert_batch_size: usize,
        delete_batch_size: usize,
    ) -> Self {
        Self {
            insert_throttle_ms: AtomicU64::new(insert_throttle.as_millis() as u64),
            delete_throttle_ms: AtomicU64::new(delete_throttle.as_millis() as u64),
            insert_batch_size: AtomicUsize::new(insert_batch_size.max(1)),
            delete_batch_size: AtomicUsize::new(delete_batch_size.max(1)),
            inserted: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
            phase: RwLock::new(MigrationPhase::Pending),
        }
    }

    pub fn insert_throttle(&self) -> Duration {
        Duration::from_millis(self.insert_throttle_ms.load(Ordering::Relaxed))
    }

    pub fn delete_throttle(&self) -> Duration {
        Duration::from_millis(self.delete_throttle_ms.load(Ordering::Relaxed))
    }

    pub fn set_insert_throttle(&self, throttle: Duration) {
        self.insert_throttle_ms
            .store(throttle.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_delete_throttle(&self, throttle: Duration) {
        self.delete_throttle_ms
            .store(throttle.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn insert_batch_size(&self) -> usize {
        self.insert_batch_size.load(Ordering::Relaxed)
    }

    pub fn delete_batch_size(&self) -> usize {
        self.delete_batch_size.load(Ordering::Relaxed)
    }

    /// Batch sizes below 1 are clamped; a zero batch would never drain
    pub fn set_insert_batch_size(&self, size: usize) {
        self.insert_batch_size.store(size.max(1), Ordering::Relaxed);
    }

    pub fn set_delete_batch_size(&self, size: usize) {
        self.delete_batch_size.store(size.max(1), Ordering::Relaxed);
    }

    pub fn inserted(&self) -> u64 {
        self.inserted.load(Ordering::Relaxed)
    }

    pub fn deleted(&self) -> u64 {
        self.deleted.load(Ordering::Relaxed)
    }

    pub(crate) fn add_inserted(&self, by: u64) {
        self.inserted.fetch_add(by, Ordering::Relaxed);
    }

    pub(crate) fn add_deleted(&self, by: u64) {
        self.deleted.fetch_add(by, Ordering::Relaxed);
    }

    pub fn phase(&self) -> MigrationPhase {
        *self.phase.read()
    }

    /// The phase only ever moves forward; a stale set is ignored
    pub(crate) fn set_phase(&self, phase: MigrationPhase) {
        let mut current = self.phase.write();
        if phase > *current {
            *current = phase;
        }
    }
}

/// Handle to one running migration.
///
/// Created by [`driver::do_migration`]; the worker runs in the background
/// while the caller polls `is_finished` or blocks on `block_until_finished`.
pub struct MigrationManager {
    collection: String,
    shard_key: Bson,
    new_location: Location,
    clusters: HashMap<String, ClusterConfig>,
    store: Arc<dyn MetadataStore>,
    controls: Arc<MigrationControls>,
    worker: Mutex<Option<JoinHandle<()>>>,
    failure: Arc<Mutex<Option<MigrationError>>>,
}

impl std::fmt::Debug for MigrationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationManager")
            .field("collection", &self.collection)
            .field("shard_key", &self.shard_key)
            .field("new_location", &self.new_location)
            .field("clusters", &self.clusters)
            .field("controls", &self.controls)
            .field("worker", &self.worker)
            .field("failure", &self.failure)
            .finish_non_exhaustive()
    }
}

impl MigrationManager {
    pub(crate) fn new(
        request: MigrationRequest,
        clusters: HashMap<String, ClusterConfig>,
        store: Arc<dyn MetadataStore>,
    ) -> Self {
        let controls = MigrationControls::new(
            request.insert_throttle,
            request.delete_throttle,
            request.insert_batch_size,
            request.delete_batch_size,
        );
        Self {
            collection: request.collection,
            shard_key: request.shard_key,
            new_location: request.new_location,
            clusters,
            store,
            controls: Arc::new(controls),
            worker: Mutex::new(None),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn the migration worker
    pub(crate) fn start(&self) {
        let collection = self.collection.clone();
        let shard_key = self.shard_key.clone();
        let new_location = self.new_location.clone();
        let clusters = self.clusters.clone();
        let store = self.store.clone();
        let controls = self.controls.clone();
        let failure = self.failure.clone();

        let handle = tokio::spawn(async move {
            // Connections are scoped to this worker and closed on the way
            // out, success or not.
            let registry = ClusterRegistry::new(clusters);
            let result = driver::run_migration(
                &registry,
                store.as_ref(),
                &controls,
                &collection,
                &shard_key,
                &new_location,
            )
            .await;
            registry.shutdown().await;

            if let Err(err) = result {
                error!(%collection, %shard_key, error = %err, "shard migration failed");
                *failure.lock() = Some(err);
            }
        });

        *self.worker.lock() = Some(handle);
    }

    /// Non-blocking completion check. A worker failure is surfaced here, on
    /// the caller's task, the first time it is observed.
    pub fn is_finished(&self) -> MigrationResult<bool> {
        if let Some(err) = self.failure.lock().take() {
            return Err(err);
        }
        let finished = self
            .worker
            .lock()
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(false);
        Ok(finished)
    }

    /// Poll at 100 ms until the worker finishes, printing status every
    /// `status_interval`
    pub async fn block_until_finished(&self, status_interval: Duration) -> MigrationResult<()> {
        let mut last_status = Instant::now();
        while !self.is_finished()? {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if last_status.elapsed() >= status_interval {
                self.print_status();
                last_status = Instant::now();
            }
        }
        Ok(())
    }

    pub fn set_insert_throttle(&self, throttle: Duration) {
        info!(
            old_ms = self.controls.insert_throttle().as_millis() as u64,
            new_ms = throttle.as_millis() as u64,
            "changing insert throttle"
        );
        self.controls.set_insert_throttle(throttle);
    }

    pub fn set_delete_throttle(&self, throttle: Duration) {
        info!(
            old_ms = self.controls.delete_throttle().as_millis() as u64,
            new_ms = throttle.as_millis() as u64,
            "changing delete throttle"
        );
        self.controls.set_delete_throttle(throttle);
    }

    pub fn controls(&self) -> &MigrationControls {
        &self.controls
    }

    pub fn phase(&self) -> MigrationPhase {
        self.controls.phase()
    }

    pub fn inserted(&self) -> u64 {
        self.controls.inserted()
    }

    pub fn deleted(&self) -> u64 {
        self.controls.deleted()
    }

    /// Log the current phase and the counter that matters for it
    pub fn print_status(&self) {
        match self.controls.phase() {
            MigrationPhase::Pending => info!("migration not started"),
            MigrationPhase::Copy => info!(
                documents = self.controls.inserted(),
                "copying source data"
            ),
            MigrationPhase::Sync => info!("syncing oplog"),
            MigrationPhase::Delete => info!(
                documents = self.controls.deleted(),
                "deleting source data"
            ),
            MigrationPhase::Complete => info!("complete"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controls() -> MigrationControls {
        MigrationControls::new(Duration::ZERO, Duration::ZERO, 1000, 1000)
    }

    #[test]
    fn test_default_knobs() {
        let controls = controls();
        assert_eq!(controls.insert_throttle(), Duration::ZERO);
        assert_eq!(controls.delete_throttle(), Duration::ZERO);
        assert_eq!(controls.insert_batch_size(), 1000);
        assert_eq!(controls.delete_batch_size(), 1000);
        assert_eq!(controls.inserted(), 0);
        assert_eq!(controls.deleted(), 0);
        assert_eq!(controls.phase(), MigrationPhase::Pending);
    }

    #[test]
    fn test_batch_size_clamped_to_one() {
        let controls = MigrationControls::new(Duration::ZERO, Duration::ZERO, 0, 0);
        assert_eq!(controls.insert_batch_size(), 1);
        assert_eq!(controls.delete_batch_size(), 1);

        controls.set_insert_batch_size(0);
        assert_eq!(controls.insert_batch_size(), 1);

        controls.set_insert_batch_size(250);
        assert_eq!(controls.insert_batch_size(), 250);
    }

    #[test]
    fn test_throttle_updates_are_visible() {
        let controls = controls();
        controls.set_insert_throttle(Duration::from_millis(40));
        controls.set_delete_throttle(Duration::from_millis(15));
        assert_eq!(controls.insert_throttle(), Duration::from_millis(40));
        assert_eq!(controls.delete_throttle(), Duration::from_millis(15));
    }

    #[test]
    fn test_counters_accumulate() {
        let controls = controls();
        controls.add_inserted(3);
        controls.add_inserted(4);
        controls.add_deleted(2);
        assert_eq!(controls.inserted(), 7);
        assert_eq!(controls.deleted(), 2);
    }

    #[test]
    fn test_phase_moves_forward_only() {
        let controls = controls();
        controls.set_phase(MigrationPhase::Sync);
        assert_eq!(controls.phase(), MigrationPhase::Sync);

        // A regression is ignored
        controls.set_phase(MigrationPhase::Copy);
        assert_eq!(controls.phase(), MigrationPhase::Sync);

        controls.set_phase(MigrationPhase::Complete);
        assert_eq!(controls.phase(), MigrationPhase::Complete);
    }

    #[test]
    fn test_phase_labels() {
        assert_eq!(MigrationPhase::Pending.to_string(), "pending");
        assert_eq!(MigrationPhase::Copy.to_string(), "copy");
        assert_eq!(MigrationPhase::Sync.to_string(), "sync");
        assert_eq!(MigrationPhase::Delete.to_string(), "delete");
        assert_eq!(MigrationPhase::Complete.to_string(), "complete");
    }
}
