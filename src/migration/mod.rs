//! The shard-movement engine
//!
//! One migration moves one shard end-to-end: bulk-copy the existing data,
//! catch the destination up from the source's oplog, quiesce writers, delete
//! the source copy, and flip ownership in the routing metadata. The driver
//! sequences the phases; the manager exposes live-tunable knobs and progress
//! to the caller.

use mongodb::bson::Timestamp;

use crate::metadata::MetadataError;
use crate::topology::TopologyError;

pub(crate) mod batch;
pub mod copy;
pub mod delete;
pub mod driver;
pub mod manager;
pub mod oplog;
pub mod recovery;
pub mod sync;

pub use driver::{do_migration, MigrationRequest};
pub use manager::{MigrationControls, MigrationManager, MigrationPhase};
pub use oplog::{OpKind, OplogEntry, OplogReader};
pub use recovery::{abort_before_delete, resume_during_delete, RecoveryKnobs};

/// Result type for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Migration errors
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("cannot start migration when another migration is in progress")]
    MigrationInProgress,

    #[error("shard is {found} but {expected} is required")]
    WrongStatus {
        expected: crate::metadata::ShardStatus,
        found: crate::metadata::ShardStatus,
    },

    #[error("shard is {found} but a migration phase is required")]
    NotMigrating {
        found: crate::metadata::ShardStatus,
    },

    #[error("shard has no recorded destination")]
    MissingNewLocation,

    #[error("oplog window missed: position {pos:?} has been rotated out; retry with a larger oplog or a faster copy")]
    OplogWindowMissed { pos: Timestamp },

    #[error("source oplog is empty")]
    EmptyOplog,

    #[error("malformed oplog entry: {0}")]
    MalformedOplogEntry(String),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),
}
