//! Reading and tailing the source cluster's replication log
//!
//! The oplog is a capped, time-ordered collection on the source cluster;
//! entries are totally ordered by their `ts` timestamp, which doubles as the
//! resume cursor for the sync phase.

use chrono::{DateTime, Utc};
use mongodb::bson::{doc, Bson, Document, Timestamp};
use mongodb::options::{CursorType, Hint};
use mongodb::{Client, Collection, Cursor};

use super::{MigrationError, MigrationResult};

/// Oplog operation kinds the sync engine replays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

/// One decoded oplog entry
#[derive(Debug, Clone, PartialEq)]
pub struct OplogEntry {
    /// Monotonic timestamp; also the resume cursor
    pub ts: Timestamp,
    /// Namespace, `database.collection`
    pub ns: String,
    pub kind: OpKind,
    /// The op payload (`o`)
    pub payload: Document,
    /// For updates: the selector (`o2`), carrying `_id`
    pub selector: Option<Document>,
}

impl OplogEntry {
    /// Decode a raw oplog document. Returns `None` for entry kinds the engine
    /// does not replay (no-ops, commands).
    pub fn from_document(doc: &Document) -> MigrationResult<Option<OplogEntry>> {
        let malformed =
            |what: &str| MigrationError::MalformedOplogEntry(format!("missing or invalid {}", what));

        let kind = match doc.get_str("op") {
            Ok("i") => OpKind::Insert,
            Ok("u") => OpKind::Update,
            Ok("d") => OpKind::Delete,
            Ok(_) => return Ok(None),
            Err(_) => return Err(malformed("op")),
        };

        let ts = match doc.get("ts") {
            Some(Bson::Timestamp(ts)) => *ts,
            _ => return Err(malformed("ts")),
        };
        let ns = doc.get_str("ns").map_err(|_| malformed("ns"))?.to_string();
        let payload = doc.get_document("o").map_err(|_| malformed("o"))?.clone();
        let selector = match kind {
            OpKind::Update => Some(doc.get_document("o2").map_err(|_| malformed("o2"))?.clone()),
            _ => None,
        };

        Ok(Some(OplogEntry {
            ts,
            ns,
            kind,
            payload,
            selector,
        }))
    }
}

/// Reads `local.oplog.rs` on one cluster
pub struct OplogReader {
    oplog: Collection<Document>,
}

impl OplogReader {
    pub fn new(client: &Client) -> Self {
        Self {
            oplog: client.database("local").collection("oplog.rs"),
        }
    }

    /// Timestamp of the most recent oplog entry
    pub async fn latest_timestamp(&self) -> MigrationResult<Timestamp> {
        self.boundary_timestamp(-1).await
    }

    /// Timestamp of the oldest entry still retained
    pub async fn oldest_timestamp(&self) -> MigrationResult<Timestamp> {
        self.boundary_timestamp(1).await
    }

    async fn boundary_timestamp(&self, natural_order: i32) -> MigrationResult<Timestamp> {
        let entry = self
            .oplog
            .find_one(doc! {})
            .sort(doc! { "$natural": natural_order })
            .await?
            .ok_or(MigrationError::EmptyOplog)?;
        match entry.get("ts") {
            Some(Bson::Timestamp(ts)) => Ok(*ts),
            _ => Err(MigrationError::MalformedOplogEntry(
                "missing or invalid ts".to_string(),
            )),
        }
    }

    /// Whether `pos` is still retained, i.e. syncing from it cannot have
    /// missed entries
    pub async fn contains(&self, pos: Timestamp) -> MigrationResult<bool> {
        Ok(self.oldest_timestamp().await? <= pos)
    }

    /// Tailable cursor over entries for `namespace` from `from` onward, in
    /// natural order
    pub async fn tail(
        &self,
        namespace: &str,
        from: Timestamp,
    ) -> MigrationResult<Cursor<Document>> {
        let cursor = self
            .oplog
            .find(doc! { "ts": { "$gte": from }, "ns": namespace })
            .cursor_type(CursorType::Tailable)
            .hint(Hint::Keys(doc! { "$natural": 1 }))
            .await?;
        Ok(cursor)
    }
}

/// Wall-clock rendering of an oplog timestamp, for status output
pub fn timestamp_to_datetime(ts: Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.time as i64, 0).unwrap_or(DateTime::UNIX_EPOCH)
}
