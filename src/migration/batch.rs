//! Batched cursor plumbing shared by the copy and delete scans

use futures::{Stream, StreamExt};
use mongodb::bson::{Bson, Document};
use mongodb::{Collection, IndexModel};
use std::time::Duration;

use super::MigrationResult;

/// Pull up to `limit` documents from the cursor. An empty result means the
/// cursor is exhausted. The caller re-reads the batch size before every call,
/// so a tuned batch size takes effect at the next batch boundary.
pub(crate) async fn next_batch<S>(cursor: &mut S, limit: usize) -> MigrationResult<Vec<Document>>
where
    S: Stream<Item = mongodb::error::Result<Document>> + Unpin,
{
    let mut batch = Vec::with_capacity(limit);
    while batch.len() < limit {
        match cursor.next().await {
            Some(document) => batch.push(document?),
            None => break,
        }
    }
    Ok(batch)
}

/// Throttle pause between batches; zero means no pause
pub(crate) async fn pause(throttle: Duration) {
    if !throttle.is_zero() {
        tokio::time::sleep(throttle).await;
    }
}

/// Look for an index on exactly `[(shard_field, 1), ("_id", 1)]`.
///
/// Sorting and hinting by it keeps pagination stable under concurrent writes,
/// so the scan does not drift while documents move around the collection.
pub(crate) async fn stable_scan_index(
    collection: &Collection<Document>,
    shard_field: &str,
) -> MigrationResult<Option<Document>> {
    let mut indexes = collection.list_indexes().await?;
    while let Some(index) = indexes.next().await {
        let index: IndexModel = index?;
        if matches_shard_scan_index(&index.keys, shard_field) {
            return Ok(Some(index.keys));
        }
    }
    Ok(None)
}

/// Whether an index key document is exactly `{shard_field: 1, _id: 1}`
pub(crate) fn matches_shard_scan_index(keys: &Document, shard_field: &str) -> bool {
    let mut entries = keys.iter();
    match (entries.next(), entries.next(), entries.next()) {
        (Some((first, first_dir)), Some((second, second_dir)), None) => {
            first == shard_field
                && second == "_id"
                && is_ascending(first_dir)
                && is_ascending(second_dir)
        }
        _ => false,
    }
}

fn is_ascending(direction: &Bson) -> bool {
    match direction {
        Bson::Int32(n) => *n == 1,
        Bson::Int64(n) => *n == 1,
        Bson::Double(n) => *n == 1.0,
        _ => false,
    }
}
