//! Shardshift - live shard movement for sharded document collections
//!
//! Moves one shard of a collection (all documents sharing one value of the
//! realm's shard field) from its current cluster/database location to a new
//! one while the application keeps reading and writing. Write routing is
//! governed by the routing-metadata store, whose status transitions signal
//! progress to application-side drivers.

pub mod config;
pub mod metadata;
pub mod migration;
pub mod topology;

pub use config::Config;

/// Shardshift version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias for top-level Shardshift operations
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
