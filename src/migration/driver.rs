//! Migration driver: the phase state machine
//!
//! Sequences copy, sync, pause, and delete for one shard, flipping the
//! persisted shard status at each boundary. Correctness lives at those
//! boundaries: the caching-duration wait must finish before writers are
//! paused, and the final sync sweep must run after the pause, or writes
//! buffered against the old location are lost.

use mongodb::bson::{Bson, Timestamp};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use super::manager::{MigrationControls, MigrationManager, MigrationPhase};
use super::oplog::{timestamp_to_datetime, OplogReader};
use super::{copy, delete, sync, MigrationError, MigrationResult};
use crate::config::ClusterConfig;
use crate::metadata::{MetadataStore, ShardStatus};
use crate::topology::{ClusterRegistry, Location};

/// Bounded window for in-flight writes to drain after writers are paused
const PAUSE_WINDOW: Duration = Duration::from_millis(100);

/// Cadence of sync passes while waiting out the routing-cache TTL
const SYNC_INTERVAL: Duration = Duration::from_millis(50);

/// One migration to run: which shard, where to, and the initial knobs
#[derive(Debug, Clone)]
pub struct MigrationRequest {
    pub collection: String,
    pub shard_key: Bson,
    pub new_location: Location,
    pub insert_throttle: Duration,
    pub delete_throttle: Duration,
    pub insert_batch_size: usize,
    pub delete_batch_size: usize,
}

impl MigrationRequest {
    /// A request with no throttling and the default batch size of 1000
    pub fn new(collection: impl Into<String>, shard_key: Bson, new_location: Location) -> Self {
        Self {
            collection: collection.into(),
            shard_key,
            new_location,
            insert_throttle: Duration::ZERO,
            delete_throttle: Duration::ZERO,
            insert_batch_size: 1000,
            delete_batch_size: 1000,
        }
    }
}

/// Start migrating one shard to its new location.
///
/// Refuses when any shard is already in a migration phase; only one migration
/// runs process-wide (the guard is persisted, so a restart cannot start a
/// parallel one). On success the worker is already running; poll the returned
/// manager or block on it.
pub async fn do_migration(
    clusters: HashMap<String, ClusterConfig>,
    store: Arc<dyn MetadataStore>,
    request: MigrationRequest,
) -> MigrationResult<Arc<MigrationManager>> {
    if store.are_migrations_happening().await? {
        return Err(MigrationError::MigrationInProgress);
    }

    info!(
        collection = %request.collection,
        shard_key = %request.shard_key,
        new_location = %request.new_location,
        "starting shard migration"
    );

    let manager = Arc::new(MigrationManager::new(request, clusters, store));
    manager.start();
    Ok(manager)
}

/// The worker body: drive one shard through every phase.
pub(crate) async fn run_migration(
    registry: &ClusterRegistry,
    store: &dyn MetadataStore,
    controls: &MigrationControls,
    collection: &str,
    shard_key: &Bson,
    new_location: &Location,
) -> MigrationResult<()> {
    // Copy phase. The oplog position is recorded before the scan starts so
    // every write that lands during the copy is replayed afterwards.
    controls.set_phase(MigrationPhase::Copy);
    store
        .start_migration(collection, shard_key, new_location)
        .await?;

    let mut oplog_pos = current_oplog_position(registry, store, collection, shard_key).await?;
    copy::copy_shard(registry, store, controls, collection, shard_key).await?;

    // Sync phase. Keep replaying until every router's cached routing entry
    // has expired, so no writer still targets the old location under a stale
    // view.
    controls.set_phase(MigrationPhase::Sync);
    let sync_started = Instant::now();
    store
        .set_shard_to_migration_status(collection, shard_key, ShardStatus::MigratingSync)
        .await?;
    oplog_pos = sync::sync_from_oplog(registry, store, collection, shard_key, oplog_pos).await?;

    let caching_duration = store.caching_duration().await?;
    while sync_started.elapsed() < caching_duration {
        tokio::time::sleep(SYNC_INTERVAL).await;
        oplog_pos =
            sync::sync_from_oplog(registry, store, collection, shard_key, oplog_pos).await?;
    }
    info!(oplog_time = %timestamp_to_datetime(oplog_pos), "routing caches expired, pausing writers");

    // Writers are now paused at the destination; give in-flight writes a
    // bounded window to drain, then sweep the oplog once more for anything
    // that landed during the pause.
    store
        .set_shard_to_migration_status(
            collection,
            shard_key,
            ShardStatus::PostMigrationPausedAtDestination,
        )
        .await?;
    tokio::time::sleep(PAUSE_WINDOW).await;
    sync::sync_from_oplog(registry, store, collection, shard_key, oplog_pos).await?;

    // Delete phase: bulk removal off the hidden secondary, then a primary
    // pass for stragglers written during the first.
    controls.set_phase(MigrationPhase::Delete);
    store
        .set_shard_to_migration_status(collection, shard_key, ShardStatus::PostMigrationDelete)
        .await?;
    delete::delete_source_data(registry, store, controls, collection, shard_key, true).await?;
    delete::delete_source_data(registry, store, controls, collection, shard_key, false).await?;

    store
        .set_shard_at_rest(collection, shard_key, new_location, true)
        .await?;

    controls.set_phase(MigrationPhase::Complete);
    info!(
        %collection,
        %shard_key,
        location = %new_location,
        inserted = controls.inserted(),
        deleted = controls.deleted(),
        "shard migration complete"
    );
    Ok(())
}

/// The most recent oplog timestamp on the node the copy will read from
async fn current_oplog_position(
    registry: &ClusterRegistry,
    store: &dyn MetadataStore,
    collection: &str,
    shard_key: &Bson,
) -> MigrationResult<Timestamp> {
    let realm = store.get_realm_for_collection(collection).await?;
    let shard = store.get_shard(&realm.name, shard_key).await?;
    let client = registry.read_client(&shard.location.cluster, true).await?;
    OplogReader::new(&client).latest_timestamp().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::store::testing::InMemoryMetadataStore;
    use crate::metadata::{Realm, ShardRecord};

    fn users_realm() -> Realm {
        Realm {
            name: "users".to_string(),
            collection: "users".to_string(),
            shard_field: "tenant_id".to_string(),
        }
    }

    fn request() -> MigrationRequest {
        MigrationRequest::new("users", Bson::Int64(9), Location::new("B", "appdb"))
    }

    #[test]
    fn test_request_defaults() {
        let request = request();
        assert_eq!(request.insert_batch_size, 1000);
        assert_eq!(request.delete_batch_size, 1000);
        assert_eq!(request.insert_throttle, Duration::ZERO);
        assert_eq!(request.delete_throttle, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_concurrent_migration_refused() {
        // Shard 7 is mid-sync; a request for shard 9 must be refused before
        // any state is written or any worker spawned.
        let store = InMemoryMetadataStore::new(Duration::from_millis(100))
            .with_realm(users_realm())
            .with_shard(ShardRecord {
                realm: "users".to_string(),
                shard_key: Bson::Int64(7),
                status: crate::metadata::ShardStatus::MigratingSync,
                location: Location::new("A", "appdb"),
                new_location: Some(Location::new("B", "appdb")),
            })
            .with_shard(ShardRecord {
                realm: "users".to_string(),
                shard_key: Bson::Int64(9),
                status: crate::metadata::ShardStatus::AtRest,
                location: Location::new("A", "appdb"),
                new_location: None,
            });
        let store: Arc<dyn MetadataStore> = Arc::new(store);

        let err = do_migration(HashMap::new(), store.clone(), request())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::MigrationInProgress));

        // Shard 9 was left untouched
        let registry_view = store.get_shard("users", &Bson::Int64(9)).await.unwrap();
        assert_eq!(registry_view.status, crate::metadata::ShardStatus::AtRest);
        assert_eq!(registry_view.new_location, None);
    }
}
