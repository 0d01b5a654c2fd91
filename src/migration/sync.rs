//! Sync phase: replay the source's oplog into the destination
//!
//! Called repeatedly by the driver; each call drains the entries currently
//! available past the resume position and returns the furthest timestamp
//! processed. Replaying the same entry twice is a no-op, so a resume from any
//! earlier position converges.

use mongodb::bson::{doc, Bson, Document, Timestamp};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::Collection;
use tracing::{debug, trace};

use super::oplog::{OpKind, OplogEntry, OplogReader};
use super::{MigrationError, MigrationResult};
use crate::metadata::MetadataStore;
use crate::topology::ClusterRegistry;

/// Replay oplog entries for the shard from `from` onward. Fails with
/// "oplog window missed" when `from` has already been rotated out of the
/// capped oplog.
pub async fn sync_from_oplog(
    registry: &ClusterRegistry,
    store: &dyn MetadataStore,
    collection: &str,
    shard_key: &Bson,
    from: Timestamp,
) -> MigrationResult<Timestamp> {
    let realm = store.get_realm_for_collection(collection).await?;
    let shard = store.get_shard(&realm.name, shard_key).await?;
    let new_location = shard
        .new_location
        .as_ref()
        .ok_or(MigrationError::MissingNewLocation)?;

    // Oplog reads and the source-side lookups both go through the primary
    let source_client = registry.primary(&shard.location.cluster).await?;
    let source: Collection<Document> = source_client
        .database(&shard.location.database)
        .collection(collection);
    let target = registry.collection(new_location, collection).await?;

    let reader = OplogReader::new(&source_client);
    if !reader.contains(from).await? {
        return Err(MigrationError::OplogWindowMissed { pos: from });
    }

    let namespace = format!("{}.{}", shard.location.database, collection);
    let shard_selector = doc! { &realm.shard_field: shard_key.clone() };

    let mut cursor = reader.tail(&namespace, from).await?;
    let mut pos = from;
    let mut replayed = 0u64;
    while cursor.advance().await? {
        let raw: Document = cursor.deserialize_current()?;
        let Some(entry) = OplogEntry::from_document(&raw)? else {
            continue;
        };
        replay_entry(&entry, &shard_selector, &source, &target).await?;
        pos = entry.ts;
        replayed += 1;
    }

    if replayed > 0 {
        debug!(replayed, resume = ?pos, "oplog entries replayed");
    }
    Ok(pos)
}

/// Apply one oplog entry to the destination, filtered by the shard selector.
async fn replay_entry(
    entry: &OplogEntry,
    shard_selector: &Document,
    source: &Collection<Document>,
    target: &Collection<Document>,
) -> MigrationResult<()> {
    match entry.kind {
        OpKind::Insert => {
            let id = payload_id(&entry.payload)?;
            let query = merged(shard_selector, doc! { "_id": id.clone() });
            // Only insert if the source still has the document; a duplicate
            // key just means the copy phase got there first.
            if source.find_one(query).await?.is_some() {
                match target.insert_one(entry.payload.clone()).await {
                    Err(err) if is_duplicate_key_error(&err) => {
                        trace!(%id, "insert replay already present");
                    }
                    other => {
                        other?;
                    }
                }
            }
        }
        OpKind::Update => {
            let selector = entry
                .selector
                .as_ref()
                .ok_or_else(|| update_without_selector())?;
            let id = payload_id(selector)?;
            let query = merged(shard_selector, doc! { "_id": id.clone() });
            // Replay the source's current document, not the recorded
            // post-image. A source doc that has since vanished is left to
            // the trailing delete entry.
            if let Some(current) = source.find_one(query).await? {
                if current != entry.payload {
                    target
                        .replace_one(doc! { "_id": id }, current)
                        .upsert(true)
                        .await?;
                }
            }
        }
        OpKind::Delete => {
            let id = payload_id(&entry.payload)?;
            let query = merged(shard_selector, doc! { "_id": id.clone() });
            // The source record is already gone in the oplog's world; only
            // the destination needs checking.
            if target.find_one(query).await?.is_some() {
                target.delete_one(doc! { "_id": id }).await?;
            }
        }
    }
    Ok(())
}

fn payload_id(payload: &Document) -> MigrationResult<Bson> {
    payload
        .get("_id")
        .cloned()
        .ok_or_else(|| MigrationError::MalformedOplogEntry("payload without _id".to_string()))
}

fn update_without_selector() -> MigrationError {
    MigrationError::MalformedOplogEntry("update entry without selector".to_string())
}

/// The shard selector with extra fields appended
pub(crate) fn merged(selector: &Document, extra: Document) -> Document {
    let mut query = selector.clone();
    query.extend(extra);
    query
}

pub(crate) fn is_duplicate_key_error(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write_error)) if write_error.code == 11000
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merged_appends_id() {
        let selector = doc! { "tenant_id": 7 };
        let query = merged(&selector, doc! { "_id": 1 });
        assert_eq!(query, doc! { "tenant_id": 7, "_id": 1 });
        // The shard selector itself is untouched
        assert_eq!(selector, doc! { "tenant_id": 7 });
    }

    #[test]
    fn test_merged_extra_wins_on_collision() {
        let selector = doc! { "tenant_id": 7, "_id": 1 };
        let query = merged(&selector, doc! { "_id": 2 });
        assert_eq!(query.get_i32("_id").unwrap(), 2);
    }

    #[test]
    fn test_payload_id_required() {
        assert!(payload_id(&doc! { "_id": 5 }).is_ok());
        assert!(matches!(
            payload_id(&doc! { "v": "a" }),
            Err(MigrationError::MalformedOplogEntry(_))
        ));
    }
}
