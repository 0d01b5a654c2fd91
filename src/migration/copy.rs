//! Copy phase: batched scan of the source shard, upserted into the destination
//!
//! Upserts rather than inserts: in-flight writes can surface the same document
//! twice during the scan, and an upsert converges where an insert would fail
//! on the duplicate key. Writes that land on the source after a document was
//! read are healed by the sync phase.

use mongodb::bson::{doc, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{Hint, UpdateOneModel, WriteModel};
use mongodb::{Client, Namespace};
use tracing::{debug, error, info};

use super::batch::{next_batch, pause, stable_scan_index};
use super::manager::MigrationControls;
use super::{MigrationError, MigrationResult};
use crate::metadata::{MetadataStore, ShardStatus};
use crate::topology::ClusterRegistry;

/// Run the copy phase for one shard. Requires the shard to be in
/// `migrating_copy`.
pub async fn copy_shard(
    registry: &ClusterRegistry,
    store: &dyn MetadataStore,
    controls: &MigrationControls,
    collection: &str,
    shard_key: &Bson,
) -> MigrationResult<()> {
    let realm = store.get_realm_for_collection(collection).await?;
    let shard = store.get_shard(&realm.name, shard_key).await?;
    if shard.status != ShardStatus::MigratingCopy {
        return Err(MigrationError::WrongStatus {
            expected: ShardStatus::MigratingCopy,
            found: shard.status,
        });
    }
    let new_location = shard
        .new_location
        .as_ref()
        .ok_or(MigrationError::MissingNewLocation)?;

    let source = registry
        .read_collection(&shard.location, collection, true)
        .await?;
    let target_client = registry.primary(&new_location.cluster).await?;
    let target_ns = Namespace {
        db: new_location.database.clone(),
        coll: collection.to_string(),
    };

    let target_key = sniff_target_shard_key(&target_client, &target_ns)
        .await?
        .unwrap_or_else(|| vec!["_id".to_string()]);
    debug!(?target_key, "resolved upsert selector fields");

    let selector = doc! { &realm.shard_field: shard_key.clone() };
    let scan_index = stable_scan_index(&source, &realm.shard_field).await?;

    let mut find = source.find(selector).no_cursor_timeout(true);
    if let Some(keys) = &scan_index {
        find = find.sort(keys.clone()).hint(Hint::Keys(keys.clone()));
    }
    let mut cursor = find.await?;

    info!(%collection, %shard_key, source = %shard.location, target = %new_location, "copy started");

    loop {
        // Tunables are re-read here, once per batch, so operators can steer
        // a running copy.
        let batch_size = controls.insert_batch_size();
        let batch = next_batch(&mut cursor, batch_size).await?;
        if batch.is_empty() {
            break;
        }

        let models = upsert_models(&target_ns, &batch, &target_key);
        let result = target_client
            .bulk_write(models)
            .ordered(true)
            .await
            .map_err(|err| {
                error!(error = ?err, "bulk upsert failed");
                MigrationError::from(err)
            })?;

        controls.add_inserted(result.upserted_count as u64);
        pause(controls.insert_throttle()).await;
    }

    info!(documents = controls.inserted(), "copy finished");
    Ok(())
}

/// Ask the destination cluster's config metadata whether this namespace is
/// sharded there, and with which key fields. `None` when the destination is
/// not a sharded deployment (or will not say), in which case `_id` is the
/// upsert selector.
pub(crate) async fn sniff_target_shard_key(
    client: &Client,
    namespace: &Namespace,
) -> MigrationResult<Option<Vec<String>>> {
    let collections = client
        .database("config")
        .collection::<Document>("collections");
    let filter = doc! {
        "_id": format!("{}.{}", namespace.db, namespace.coll),
        "dropped": false,
    };

    let info = match collections.find_one(filter).await {
        Ok(info) => info,
        // Not a mongos, or config is off limits: fall back to _id
        Err(err) if matches!(err.kind.as_ref(), ErrorKind::Command(_)) => {
            debug!(error = %err, "destination shard key unavailable");
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    };

    Ok(info
        .as_ref()
        .and_then(|info| info.get_document("key").ok())
        .map(|key| key.keys().map(|field| field.to_string()).collect()))
}

/// One ordered bulk of upserts, one per source document. The filter projects
/// the target-key fields so a retried document updates in place instead of
/// tripping a duplicate key.
pub(crate) fn upsert_models(
    namespace: &Namespace,
    batch: &[Document],
    target_key: &[String],
) -> Vec<WriteModel> {
    batch
        .iter()
        .map(|document| {
            let model = UpdateOneModel::builder()
                .namespace(namespace.clone())
                .filter(target_key_selector(target_key, document))
                .update(doc! { "$set": without_id(document) })
                .upsert(true)
                .build();
            WriteModel::UpdateOne(model)
        })
        .collect()
}

/// The target-key projection of a document, used as the upsert filter
pub(crate) fn target_key_selector(target_key: &[String], document: &Document) -> Document {
    let mut selector = Document::new();
    for field in target_key {
        if let Some(value) = document.get(field) {
            selector.insert(field.clone(), value.clone());
        }
    }
    selector
}

/// The document minus `_id`; `_id` is immutable on the destination and must
/// not appear in a `$set`
pub(crate) fn without_id(document: &Document) -> Document {
    let mut copy = document.clone();
    copy.remove("_id");
    copy
}
