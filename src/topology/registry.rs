//! Client connections to the known clusters
//!
//! One registry is created per migration worker; every client it opens is
//! closed again by `shutdown` when the worker exits.

use dashmap::DashMap;
use mongodb::bson::Document;
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection};
use std::collections::HashMap;
use tracing::{debug, info};

use super::{Location, TopologyError, TopologyResult};
use crate::config::ClusterConfig;

/// Opens and caches clients for the clusters named in location strings
pub struct ClusterRegistry {
    clusters: HashMap<String, ClusterConfig>,
    primaries: DashMap<String, Client>,
    hidden_secondaries: DashMap<String, Client>,
}

impl ClusterRegistry {
    pub fn new(clusters: HashMap<String, ClusterConfig>) -> Self {
        Self {
            clusters,
            primaries: DashMap::new(),
            hidden_secondaries: DashMap::new(),
        }
    }

    fn cluster_config(&self, cluster: &str) -> TopologyResult<&ClusterConfig> {
        self.clusters
            .get(cluster)
            .ok_or_else(|| TopologyError::UnknownCluster(cluster.to_string()))
    }

    /// Client connected to the cluster's replica set (reads hit the primary)
    pub async fn primary(&self, cluster: &str) -> TopologyResult<Client> {
        if let Some(client) = self.primaries.get(cluster) {
            return Ok(client.clone());
        }

        let uri = self.cluster_config(cluster)?.uri.clone();
        debug!(cluster, "connecting to primary");
        let options = ClientOptions::parse(&uri).await?;
        let client = Client::with_options(options)?;
        self.primaries.insert(cluster.to_string(), client.clone());
        Ok(client)
    }

    /// Direct client to the cluster's hidden secondary, if one is configured
    pub async fn hidden_secondary(&self, cluster: &str) -> TopologyResult<Option<Client>> {
        if let Some(client) = self.hidden_secondaries.get(cluster) {
            return Ok(Some(client.clone()));
        }

        let uri = match &self.cluster_config(cluster)?.hidden_secondary_uri {
            Some(uri) => uri.clone(),
            None => return Ok(None),
        };

        debug!(cluster, "connecting to hidden secondary");
        let mut options = ClientOptions::parse(&uri).await?;
        options.direct_connection = Some(true);
        let client = Client::with_options(options)?;
        self.hidden_secondaries
            .insert(cluster.to_string(), client.clone());
        Ok(Some(client))
    }

    /// Client to read bulk scans from: the hidden secondary when requested
    /// and configured, the primary otherwise
    pub async fn read_client(
        &self,
        cluster: &str,
        use_hidden_secondary: bool,
    ) -> TopologyResult<Client> {
        if use_hidden_secondary {
            if let Some(client) = self.hidden_secondary(cluster).await? {
                return Ok(client);
            }
        }
        self.primary(cluster).await
    }

    /// Collection handle at the given location, via the primary
    pub async fn collection(
        &self,
        location: &Location,
        collection: &str,
    ) -> TopologyResult<Collection<Document>> {
        let client = self.primary(&location.cluster).await?;
        Ok(client.database(&location.database).collection(collection))
    }

    /// Collection handle at the given location for bulk reads
    pub async fn read_collection(
        &self,
        location: &Location,
        collection: &str,
        use_hidden_secondary: bool,
    ) -> TopologyResult<Collection<Document>> {
        let client = self
            .read_client(&location.cluster, use_hidden_secondary)
            .await?;
        Ok(client.database(&location.database).collection(collection))
    }

    /// Close every client this registry opened
    pub async fn shutdown(&self) {
        let opened: usize = self.primaries.len() + self.hidden_secondaries.len();
        if opened > 0 {
            info!(connections = opened, "closing cluster connections");
        }

        for map in [&self.primaries, &self.hidden_secondaries] {
            let clusters: Vec<String> = map.iter().map(|entry| entry.key().clone()).collect();
            for cluster in clusters {
                if let Some((_, client)) = map.remove(&cluster) {
                    client.shutdown().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(cluster: &str, hidden: Option<&str>) -> ClusterRegistry {
        let mut clusters = HashMap::new();
        clusters.insert(
            cluster.to_string(),
            ClusterConfig {
                uri: "mongodb://primary:27017".to_string(),
                hidden_secondary_uri: hidden.map(|uri| uri.to_string()),
            },
        );
        ClusterRegistry::new(clusters)
    }

    #[tokio::test]
    async fn test_unknown_cluster_is_an_error() {
        let registry = registry_with("cluster-1", None);
        let err = registry.primary("cluster-2").await.unwrap_err();
        assert!(matches!(err, TopologyError::UnknownCluster(name) if name == "cluster-2"));
    }

    #[tokio::test]
    async fn test_read_client_without_hidden_secondary_configured() {
        // No hidden secondary configured: the lookup itself reports None
        // before any connection is attempted.
        let registry = registry_with("cluster-1", None);
        let client = registry.hidden_secondary("cluster-1").await.unwrap();
        assert!(client.is_none());
    }
}
