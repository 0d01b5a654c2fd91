//! Recovery helpers for failed migrations
//!
//! A failed migration leaves the shard in whatever phase was last persisted;
//! these helpers pick up from there. Both must only be run once the failed
//! worker is certainly stopped: they check the persisted status, but nothing
//! can check that a worker is not still moving data.

use mongodb::bson::{doc, Bson, Document};
use mongodb::options::Hint;
use mongodb::Collection;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use super::batch::{next_batch, pause, stable_scan_index};
use super::delete::delete_source_data;
use super::manager::MigrationControls;
use super::{MigrationError, MigrationResult};
use crate::config::ClusterConfig;
use crate::metadata::{MetadataStore, ShardStatus};
use crate::topology::ClusterRegistry;

const RATE_LOG_INTERVAL: Duration = Duration::from_secs(120);

/// Knobs for a recovery run
#[derive(Debug, Clone)]
pub struct RecoveryKnobs {
    pub delete_batch_size: usize,
    pub delete_throttle: Duration,
}

impl Default for RecoveryKnobs {
    fn default() -> Self {
        Self {
            delete_batch_size: 500,
            delete_throttle: Duration::from_millis(50),
        }
    }
}

/// Undo a migration that failed before the delete phase: remove the partial
/// destination copy and put the shard back at rest at its old location.
///
/// Requires the shard to still be in a migration phase.
pub async fn abort_before_delete(
    clusters: HashMap<String, ClusterConfig>,
    store: &dyn MetadataStore,
    collection: &str,
    shard_key: &Bson,
    knobs: RecoveryKnobs,
) -> MigrationResult<()> {
    let registry = ClusterRegistry::new(clusters);
    let result = abort_inner(&registry, store, collection, shard_key, knobs).await;
    registry.shutdown().await;
    result
}

async fn abort_inner(
    registry: &ClusterRegistry,
    store: &dyn MetadataStore,
    collection: &str,
    shard_key: &Bson,
    knobs: RecoveryKnobs,
) -> MigrationResult<()> {
    let realm = store.get_realm_for_collection(collection).await?;
    let shard = store.get_shard(&realm.name, shard_key).await?;
    if !shard.status.is_migration_phase() {
        return Err(MigrationError::NotMigrating {
            found: shard.status,
        });
    }
    let new_location = shard
        .new_location
        .as_ref()
        .ok_or(MigrationError::MissingNewLocation)?;

    let target = registry.collection(new_location, collection).await?;
    let deleted = remove_shard_documents(
        &target,
        &realm.shard_field,
        shard_key,
        knobs.delete_batch_size,
        knobs.delete_throttle,
    )
    .await?;

    store
        .set_shard_at_rest(collection, shard_key, &shard.location, true)
        .await?;

    info!(
        %collection,
        %shard_key,
        deleted,
        restored_location = %shard.location,
        "aborted migration cleaned up"
    );
    Ok(())
}

/// Finish a migration that failed during the delete phase: re-run the
/// two-pass delete and commit the new location.
///
/// Requires the shard to be in `post_migration_delete`.
pub async fn resume_during_delete(
    clusters: HashMap<String, ClusterConfig>,
    store: &dyn MetadataStore,
    collection: &str,
    shard_key: &Bson,
    knobs: RecoveryKnobs,
) -> MigrationResult<()> {
    let registry = ClusterRegistry::new(clusters);
    let result = resume_inner(&registry, store, collection, shard_key, knobs).await;
    registry.shutdown().await;
    result
}

async fn resume_inner(
    registry: &ClusterRegistry,
    store: &dyn MetadataStore,
    collection: &str,
    shard_key: &Bson,
    knobs: RecoveryKnobs,
) -> MigrationResult<()> {
    let realm = store.get_realm_for_collection(collection).await?;
    let shard = store.get_shard(&realm.name, shard_key).await?;
    if shard.status != ShardStatus::PostMigrationDelete {
        return Err(MigrationError::WrongStatus {
            expected: ShardStatus::PostMigrationDelete,
            found: shard.status,
        });
    }
    let new_location = shard
        .new_location
        .clone()
        .ok_or(MigrationError::MissingNewLocation)?;

    let controls = MigrationControls::new(
        Duration::ZERO,
        knobs.delete_throttle,
        1000,
        knobs.delete_batch_size,
    );

    delete_source_data(registry, store, &controls, collection, shard_key, true).await?;
    delete_source_data(registry, store, &controls, collection, shard_key, false).await?;

    store
        .set_shard_at_rest(collection, shard_key, &new_location, true)
        .await?;

    info!(
        %collection,
        %shard_key,
        deleted = controls.deleted(),
        location = %new_location,
        "interrupted delete finished"
    );
    Ok(())
}

/// Batched removal of every document in the shard from one collection, with
/// progress logged at most every two minutes
async fn remove_shard_documents(
    collection: &Collection<Document>,
    shard_field: &str,
    shard_key: &Bson,
    batch_size: usize,
    throttle: Duration,
) -> MigrationResult<u64> {
    let selector = doc! { shard_field: shard_key.clone() };
    let scan_index = stable_scan_index(collection, shard_field).await?;

    let mut find = collection
        .find(selector)
        .projection(doc! { "_id": 1 })
        .no_cursor_timeout(true);
    if let Some(keys) = &scan_index {
        find = find.sort(keys.clone()).hint(Hint::Keys(keys.clone()));
    }
    let mut cursor = find.await?;

    let mut total_deleted = 0u64;
    let mut last_log = Instant::now();
    let mut last_total = 0u64;

    loop {
        let batch = next_batch(&mut cursor, batch_size).await?;
        if batch.is_empty() {
            break;
        }

        let ids: Vec<Bson> = batch
            .iter()
            .filter_map(|document| document.get("_id").cloned())
            .collect();
        let result = collection
            .delete_many(doc! { "_id": { "$in": ids } })
            .await?;
        total_deleted += result.deleted_count;

        if last_log.elapsed() >= RATE_LOG_INTERVAL {
            let per_sec =
                (total_deleted - last_total) as f64 / last_log.elapsed().as_secs_f64();
            info!(deleted = total_deleted, per_sec = per_sec as u64, "removing shard documents");
            last_log = Instant::now();
            last_total = total_deleted;
        }

        pause(throttle).await;
    }

    Ok(total_deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_knob_defaults() {
        let knobs = RecoveryKnobs::default();
        assert_eq!(knobs.delete_batch_size, 500);
        assert_eq!(knobs.delete_throttle, Duration::from_millis(50));
    }
}
