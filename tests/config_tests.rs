//! Configuration loading integration tests

use shardshift::config::ClusterConfig;
use shardshift::Config;
use std::path::Path;

#[tokio::test]
async fn test_save_and_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shardshift.toml");

    let mut config = Config::default();
    config.migration.insert_batch_size = 250;
    config.migration.delete_throttle_ms = 40;
    config.clusters.insert(
        "cluster-1".to_string(),
        ClusterConfig {
            uri: "mongodb://primary:27017/?replicaSet=rs0".to_string(),
            hidden_secondary_uri: Some("mongodb://hidden:27017".to_string()),
        },
    );
    config.save(&path).await.unwrap();

    let loaded = Config::load(Some(path.as_path())).await.unwrap();
    assert_eq!(loaded.migration.insert_batch_size, 250);
    assert_eq!(loaded.migration.delete_throttle_ms, 40);
    assert_eq!(
        loaded.clusters["cluster-1"].hidden_secondary_uri.as_deref(),
        Some("mongodb://hidden:27017")
    );
}

#[tokio::test]
async fn test_missing_file_falls_back_to_defaults() {
    let loaded = Config::load(Some(Path::new("/nonexistent/shardshift.toml")))
        .await
        .unwrap();
    assert_eq!(loaded.migration.insert_batch_size, 1000);
    assert_eq!(loaded.migration.delete_batch_size, 1000);
    assert_eq!(loaded.logging.level, "info");
}

#[tokio::test]
async fn test_invalid_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shardshift.toml");

    let mut config = Config::default();
    config.migration.delete_batch_size = 0;
    // Bypass save-side validation by writing the TOML directly
    tokio::fs::write(&path, toml::to_string(&config).unwrap())
        .await
        .unwrap();

    assert!(Config::load(Some(path.as_path())).await.is_err());
}
