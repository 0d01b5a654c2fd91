//! Cluster topology: location strings and connection handling
//!
//! A shard lives at a location, a `cluster/database` pair. This module parses
//! location strings and hands out client connections to the named clusters,
//! preferring a hidden secondary for bulk reads when one is configured.

pub mod location;
pub mod registry;

pub use location::Location;
pub use registry::ClusterRegistry;

/// Result type for topology operations
pub type TopologyResult<T> = Result<T, TopologyError>;

/// Topology errors
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("invalid location {location:?}: {reason}")]
    InvalidLocation { location: String, reason: String },

    #[error("unknown cluster: {0}")]
    UnknownCluster(String),

    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),
}
