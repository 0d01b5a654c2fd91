//! Location strings

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::TopologyError;

/// Where a shard lives: a cluster plus a database on it.
///
/// Rendered and parsed as `"cluster/database"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Location {
    pub cluster: String,
    pub database: String,
}

impl Location {
    pub fn new(cluster: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            database: database.into(),
        }
    }
}

impl FromStr for Location {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| TopologyError::InvalidLocation {
            location: s.to_string(),
            reason: reason.to_string(),
        };

        let (cluster, database) = s
            .split_once('/')
            .ok_or_else(|| invalid("expected cluster/database"))?;
        if cluster.is_empty() {
            return Err(invalid("empty cluster name"));
        }
        if database.is_empty() || database.contains('/') {
            return Err(invalid("database must be a single non-empty segment"));
        }

        Ok(Location::new(cluster, database))
    }
}

impl TryFrom<String> for Location {
    type Error = TopologyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Location> for String {
    fn from(location: Location) -> String {
        location.to_string()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.database)
    }
}
