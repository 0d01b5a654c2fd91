//! Routing metadata: realms, shards, and their migration status
//!
//! The routing-metadata store is the authority for where each shard lives.
//! Application-side routers read it to decide where writes go; the migration
//! driver is the only writer of shard status while a migration runs.

use mongodb::bson::Bson;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::topology::Location;

pub mod store;

pub use store::{MetadataStore, MongoMetadataStore};

/// Result type for metadata operations
pub type MetadataResult<T> = Result<T, MetadataError>;

/// Metadata store errors
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("no realm governs collection {0}")]
    RealmNotFound(String),

    #[error("shard {shard_key} not found in realm {realm}")]
    ShardNotFound { realm: String, shard_key: Bson },

    #[error("shard is {found} but {expected} is required")]
    StatusConflict {
        expected: ShardStatus,
        found: ShardStatus,
    },

    #[error("malformed metadata record: {0}")]
    InvalidRecord(String),

    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),
}

/// Describes a sharded collection: its name and the document attribute whose
/// value identifies a shard. Immutable during a migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Realm {
    pub name: String,
    pub collection: String,
    pub shard_field: String,
}

/// One record per (realm, shard key): where the shard lives and, during a
/// migration, where it is going.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub realm: String,
    pub shard_key: Bson,
    pub status: ShardStatus,
    pub location: Location,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_location: Option<Location>,
}

/// Persisted migration status of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    AtRest,
    MigratingCopy,
    MigratingSync,
    PostMigrationPausedAtDestination,
    PostMigrationDelete,
}

/// The statuses a shard passes through while a migration is running
pub const MIGRATION_PHASES: [ShardStatus; 4] = [
    ShardStatus::MigratingCopy,
    ShardStatus::MigratingSync,
    ShardStatus::PostMigrationPausedAtDestination,
    ShardStatus::PostMigrationDelete,
];

impl ShardStatus {
    /// The string persisted in the metadata store
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardStatus::AtRest => "at_rest",
            ShardStatus::MigratingCopy => "migrating_copy",
            ShardStatus::MigratingSync => "migrating_sync",
            ShardStatus::PostMigrationPausedAtDestination => {
                "post_migration_paused_at_destination"
            }
            ShardStatus::PostMigrationDelete => "post_migration_delete",
        }
    }

    /// Whether this status is one of the migration phases
    pub fn is_migration_phase(&self) -> bool {
        MIGRATION_PHASES.contains(self)
    }
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShardStatus {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "at_rest" => Ok(ShardStatus::AtRest),
            "migrating_copy" => Ok(ShardStatus::MigratingCopy),
            "migrating_sync" => Ok(ShardStatus::MigratingSync),
            "post_migration_paused_at_destination" => {
                Ok(ShardStatus::PostMigrationPausedAtDestination)
            }
            "post_migration_delete" => Ok(ShardStatus::PostMigrationDelete),
            other => Err(MetadataError::InvalidRecord(format!(
                "unknown shard status: {}",
                other
            ))),
        }
    }
}
