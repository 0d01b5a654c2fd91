//! Configuration management for Shardshift

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;

use crate::topology::Location;

/// Shardshift configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Location of the routing-metadata database, "cluster/database"
    pub metadata_location: String,
    /// Known clusters, keyed by the cluster name used in location strings
    pub clusters: HashMap<String, ClusterConfig>,
    /// Migration knob defaults
    pub migration: MigrationConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Connection endpoints for one cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Connection string for the replica set primary
    pub uri: String,
    /// Optional direct connection string for a hidden secondary, used to
    /// offload bulk scans from the serving primary
    pub hidden_secondary_uri: Option<String>,
}

/// Default knobs for a migration run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Documents upserted per bulk write during the copy phase
    pub insert_batch_size: usize,
    /// Documents removed per delete_many during the delete phase
    pub delete_batch_size: usize,
    /// Pause after each copy batch, in milliseconds (0 = no pause)
    pub insert_throttle_ms: u64,
    /// Pause after each delete batch, in milliseconds (0 = no pause)
    pub delete_throttle_ms: u64,
    /// Fallback TTL of application-side routing caches, in milliseconds,
    /// used when the metadata store carries no caching-duration setting
    pub caching_duration_ms: u64,
    /// Seconds between status lines while blocking on a migration
    pub status_interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            insert_batch_size: 1000,
            delete_batch_size: 1000,
            insert_throttle_ms: 0,
            delete_throttle_ms: 0,
            caching_duration_ms: 1000,
            status_interval_secs: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metadata_location: "metadata/shardshift".to_string(),
            clusters: HashMap::new(),
            migration: MigrationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the given file (or `config/default.toml`),
    /// apply environment overrides, and validate
    pub async fn load(path: Option<&Path>) -> crate::Result<Self> {
        let path = path.unwrap_or_else(|| Path::new("config/default.toml"));
        let mut config = if path.exists() {
            let content = fs::read_to_string(path).await?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(location) = std::env::var("SHARDSHIFT_METADATA_LOCATION") {
            self.metadata_location = location;
        }

        if let Ok(batch_size) = std::env::var("SHARDSHIFT_INSERT_BATCH_SIZE") {
            if let Ok(size) = batch_size.parse::<usize>() {
                self.migration.insert_batch_size = size;
            }
        }

        if let Ok(batch_size) = std::env::var("SHARDSHIFT_DELETE_BATCH_SIZE") {
            if let Ok(size) = batch_size.parse::<usize>() {
                self.migration.delete_batch_size = size;
            }
        }

        if let Ok(throttle) = std::env::var("SHARDSHIFT_INSERT_THROTTLE_MS") {
            if let Ok(ms) = throttle.parse::<u64>() {
                self.migration.insert_throttle_ms = ms;
            }
        }

        if let Ok(throttle) = std::env::var("SHARDSHIFT_DELETE_THROTTLE_MS") {
            if let Ok(ms) = throttle.parse::<u64>() {
                self.migration.delete_throttle_ms = ms;
            }
        }

        if let Ok(level) = std::env::var("SHARDSHIFT_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = std::env::var("SHARDSHIFT_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        self.metadata_location
            .parse::<Location>()
            .map_err(|e| format!("Invalid metadata location: {}", e))?;

        for (name, cluster) in &self.clusters {
            if cluster.uri.is_empty() {
                return Err(format!("Cluster {} has an empty connection string", name));
            }
            if name.contains('/') {
                return Err(format!("Cluster name {} must not contain '/'", name));
            }
        }

        if self.migration.insert_batch_size == 0 {
            return Err("Insert batch size must be at least 1".to_string());
        }

        if self.migration.delete_batch_size == 0 {
            return Err("Delete batch size must be at least 1".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Valid levels: {:?}",
                self.logging.level, valid_levels
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(format!(
                "Invalid log format: {}. Valid formats: {:?}",
                self.logging.format, valid_formats
            ));
        }

        Ok(())
    }

    /// The parsed metadata location
    pub fn metadata_location(&self) -> Location {
        self.metadata_location
            .parse()
            .expect("metadata location validated at load time")
    }

    /// Save configuration to file
    pub async fn save(&self, path: &Path) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.migration.insert_batch_size, 1000);
        assert_eq!(config.migration.delete_batch_size, 1000);
        assert_eq!(config.migration.insert_throttle_ms, 0);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = Config::default();
        config.migration.insert_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.migration.delete_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_metadata_location_rejected() {
        let mut config = Config::default();
        config.metadata_location = "no-database-part".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_logging_rejected() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cluster_name_with_slash_rejected() {
        let mut config = Config::default();
        config.clusters.insert(
            "bad/name".to_string(),
            ClusterConfig {
                uri: "mongodb://localhost:27017".to_string(),
                hidden_secondary_uri: None,
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = Config::default();
        config.clusters.insert(
            "cluster-1".to_string(),
            ClusterConfig {
                uri: "mongodb://primary:27017".to_string(),
                hidden_secondary_uri: Some("mongodb://hidden:27017".to_string()),
            },
        );

        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.clusters["cluster-1"].uri, "mongodb://primary:27017");
        assert_eq!(
            parsed.clusters["cluster-1"].hidden_secondary_uri.as_deref(),
            Some("mongodb://hidden:27017")
        );
    }
}
