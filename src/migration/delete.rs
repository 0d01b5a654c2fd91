//! Delete phase: remove the source copy of a migrated shard
//!
//! The driver runs this twice: first reading ids from the hidden secondary to
//! keep scan load off the serving primary, then once more reading the primary
//! directly to catch documents written during the first pass.

use mongodb::bson::{doc, Bson};
use mongodb::options::Hint;
use tracing::info;

use super::batch::{next_batch, pause, stable_scan_index};
use super::manager::MigrationControls;
use super::{MigrationError, MigrationResult};
use crate::metadata::{MetadataStore, ShardStatus};
use crate::topology::ClusterRegistry;

/// Run one delete pass over the shard's source data. Requires the shard to be
/// in `post_migration_delete`. Deletes always go to the primary; only the
/// `_id` scan honors `use_hidden_secondary`.
pub async fn delete_source_data(
    registry: &ClusterRegistry,
    store: &dyn MetadataStore,
    controls: &MigrationControls,
    collection: &str,
    shard_key: &Bson,
    use_hidden_secondary: bool,
) -> MigrationResult<()> {
    let realm = store.get_realm_for_collection(collection).await?;
    let shard = store.get_shard(&realm.name, shard_key).await?;
    if shard.status != ShardStatus::PostMigrationDelete {
        return Err(MigrationError::WrongStatus {
            expected: ShardStatus::PostMigrationDelete,
            found: shard.status,
        });
    }

    let scan = registry
        .read_collection(&shard.location, collection, use_hidden_secondary)
        .await?;
    let primary = registry.collection(&shard.location, collection).await?;

    let selector = doc! { &realm.shard_field: shard_key.clone() };
    let scan_index = stable_scan_index(&scan, &realm.shard_field).await?;

    let mut find = scan
        .find(selector)
        .projection(doc! { "_id": 1 })
        .no_cursor_timeout(true);
    if let Some(keys) = &scan_index {
        find = find.sort(keys.clone()).hint(Hint::Keys(keys.clone()));
    }
    let mut cursor = find.await?;

    info!(%collection, %shard_key, use_hidden_secondary, "delete pass started");

    loop {
        let batch_size = controls.delete_batch_size();
        let batch = next_batch(&mut cursor, batch_size).await?;
        if batch.is_empty() {
            break;
        }

        let ids: Vec<Bson> = batch
            .iter()
            .filter_map(|document| document.get("_id").cloned())
            .collect();
        let result = primary.delete_many(doc! { "_id": { "$in": ids } }).await?;

        controls.add_deleted(result.deleted_count);
        pause(controls.delete_throttle()).await;
    }

    info!(documents = controls.deleted(), "delete pass finished");
    Ok(())
}
