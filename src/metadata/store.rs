//! The routing-metadata store
//!
//! Consumed by the migration engine through the `MetadataStore` trait; the
//! MongoDB-backed implementation keeps realms and shards in collections on a
//! metadata database, with the routing-cache TTL in a settings collection.

use async_trait::async_trait;
use mongodb::bson::{doc, from_document, Bson, Document};
use mongodb::{Collection, Database};
use std::time::Duration;
use tracing::debug;

use super::{MetadataError, MetadataResult, Realm, ShardRecord, ShardStatus, MIGRATION_PHASES};
use crate::topology::Location;

/// Interface to the routing-metadata store.
///
/// Shard status is mutated exclusively through these transitions; the engine
/// and the application-side routers read it back.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// The realm governing the given collection
    async fn get_realm_for_collection(&self, collection: &str) -> MetadataResult<Realm>;

    /// The shard record for (realm, shard key)
    async fn get_shard(&self, realm: &str, shard_key: &Bson) -> MetadataResult<ShardRecord>;

    /// Whether any shard is currently in a migration phase
    async fn are_migrations_happening(&self) -> MetadataResult<bool>;

    /// TTL of application-side routing caches
    async fn caching_duration(&self) -> MetadataResult<Duration>;

    /// Atomic `AT_REST -> MIGRATING_COPY` transition, recording the destination
    async fn start_migration(
        &self,
        collection: &str,
        shard_key: &Bson,
        new_location: &Location,
    ) -> MetadataResult<()>;

    /// Transition between migration phases
    async fn set_shard_to_migration_status(
        &self,
        collection: &str,
        shard_key: &Bson,
        status: ShardStatus,
    ) -> MetadataResult<()>;

    /// Commit the shard at rest at the given location, clearing any recorded
    /// destination. Without `force`, refuses when the shard is mid-migration.
    async fn set_shard_at_rest(
        &self,
        collection: &str,
        shard_key: &Bson,
        location: &Location,
        force: bool,
    ) -> MetadataResult<()>;
}

/// MongoDB-backed metadata store
pub struct MongoMetadataStore {
    realms: Collection<Document>,
    shards: Collection<Document>,
    settings: Collection<Document>,
    default_caching_duration: Duration,
}

impl MongoMetadataStore {
    pub fn new(database: Database, default_caching_duration: Duration) -> Self {
        Self {
            realms: database.collection("realms"),
            shards: database.collection("shards"),
            settings: database.collection("settings"),
            default_caching_duration,
        }
    }

    fn shard_filter(realm: &str, shard_key: &Bson) -> Document {
        doc! { "realm": realm, "shard_key": shard_key.clone() }
    }
}

#[async_trait]
impl MetadataStore for MongoMetadataStore {
    async fn get_realm_for_collection(&self, collection: &str) -> MetadataResult<Realm> {
        let doc = self
            .realms
            .find_one(doc! { "collection": collection })
            .await?
            .ok_or_else(|| MetadataError::RealmNotFound(collection.to_string()))?;
        from_document(doc)
            .map_err(|e| MetadataError::InvalidRecord(format!("realm record: {}", e)))
    }

    async fn get_shard(&self, realm: &str, shard_key: &Bson) -> MetadataResult<ShardRecord> {
        let doc = self
            .shards
            .find_one(Self::shard_filter(realm, shard_key))
            .await?
            .ok_or_else(|| MetadataError::ShardNotFound {
                realm: realm.to_string(),
                shard_key: shard_key.clone(),
            })?;
        from_document(doc)
            .map_err(|e| MetadataError::InvalidRecord(format!("shard record: {}", e)))
    }

    async fn are_migrations_happening(&self) -> MetadataResult<bool> {
        let statuses: Vec<&str> = MIGRATION_PHASES.iter().map(|s| s.as_str()).collect();
        let migrating = self
            .shards
            .count_documents(doc! { "status": { "$in": statuses } })
            .await?;
        Ok(migrating > 0)
    }

    async fn caching_duration(&self) -> MetadataResult<Duration> {
        let setting = self
            .settings
            .find_one(doc! { "_id": "caching_duration" })
            .await?;

        let millis = setting.and_then(|doc| match doc.get("value_ms") {
            Some(Bson::Int32(ms)) => Some(*ms as u64),
            Some(Bson::Int64(ms)) => Some(*ms as u64),
            Some(Bson::Double(ms)) => Some(*ms as u64),
            _ => None,
        });

        Ok(millis
            .map(Duration::from_millis)
            .unwrap_or(self.default_caching_duration))
    }

    async fn start_migration(
        &self,
        collection: &str,
        shard_key: &Bson,
        new_location: &Location,
    ) -> MetadataResult<()> {
        let realm = self.get_realm_for_collection(collection).await?;

        // Filtering on status makes the transition atomic: a concurrent
        // starter loses the race and sees matched_count == 0.
        let mut filter = Self::shard_filter(&realm.name, shard_key);
        filter.insert("status", ShardStatus::AtRest.as_str());
        let update = doc! { "$set": {
            "status": ShardStatus::MigratingCopy.as_str(),
            "new_location": new_location.to_string(),
        }};

        let result = self.shards.update_one(filter, update).await?;
        if result.matched_count == 0 {
            let shard = self.get_shard(&realm.name, shard_key).await?;
            return Err(MetadataError::StatusConflict {
                expected: ShardStatus::AtRest,
                found: shard.status,
            });
        }

        debug!(realm = %realm.name, %shard_key, %new_location, "migration recorded");
        Ok(())
    }

    async fn set_shard_to_migration_status(
        &self,
        collection: &str,
        shard_key: &Bson,
        status: ShardStatus,
    ) -> MetadataResult<()> {
        let realm = self.get_realm_for_collection(collection).await?;
        let update = doc! { "$set": { "status": status.as_str() } };
        let result = self
            .shards
            .update_one(Self::shard_filter(&realm.name, shard_key), update)
            .await?;
        if result.matched_count == 0 {
            return Err(MetadataError::ShardNotFound {
                realm: realm.name,
                shard_key: shard_key.clone(),
            });
        }
        Ok(())
    }

    async fn set_shard_at_rest(
        &self,
        collection: &str,
        shard_key: &Bson,
        location: &Location,
        force: bool,
    ) -> MetadataResult<()> {
        let realm = self.get_realm_for_collection(collection).await?;

        if !force {
            match self.get_shard(&realm.name, shard_key).await {
                Ok(shard) if shard.status != ShardStatus::AtRest => {
                    return Err(MetadataError::StatusConflict {
                        expected: ShardStatus::AtRest,
                        found: shard.status,
                    });
                }
                Ok(_) | Err(MetadataError::ShardNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let update = doc! {
            "$set": {
                "status": ShardStatus::AtRest.as_str(),
                "location": location.to_string(),
            },
            "$unset": { "new_location": "" },
        };
        self.shards
            .update_one(Self::shard_filter(&realm.name, shard_key), update)
            .upsert(true)
            .await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::InMemoryMetadataStore;
    use super::*;

    fn users_realm() -> Realm {
        Realm {
            name: "users".to_string(),
            collection: "users".to_string(),
            shard_field: "tenant_id".to_string(),
        }
    }

    fn shard_at(status: ShardStatus) -> ShardRecord {
        ShardRecord {
            realm: "users".to_string(),
            shard_key: Bson::Int64(7),
            status,
            location: Location::new("A", "appdb"),
            new_location: None,
        }
    }

    fn store_with_shard(status: ShardStatus) -> InMemoryMetadataStore {
        InMemoryMetadataStore::new(Duration::from_millis(100))
            .with_realm(users_realm())
            .with_shard(shard_at(status))
    }

    #[tokio::test]
    async fn test_start_migration_transitions_and_sets_destination() {
        let store = store_with_shard(ShardStatus::AtRest);
        let destination = Location::new("B", "appdb");

        store
            .start_migration("users", &Bson::Int64(7), &destination)
            .await
            .unwrap();

        let shard = store.get_shard("users", &Bson::Int64(7)).await.unwrap();
        assert_eq!(shard.status, ShardStatus::MigratingCopy);
        assert_eq!(shard.new_location, Some(destination));
    }

    #[tokio::test]
    async fn test_start_migration_refused_unless_at_rest() {
        let store = store_with_shard(ShardStatus::MigratingSync);
        let err = store
            .start_migration("users", &Bson::Int64(7), &Location::new("B", "appdb"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MetadataError::StatusConflict {
                expected: ShardStatus::AtRest,
                found: ShardStatus::MigratingSync,
            }
        ));
    }

    #[tokio::test]
    async fn test_migrations_happening_reflects_phases() {
        let store = store_with_shard(ShardStatus::AtRest);
        assert!(!store.are_migrations_happening().await.unwrap());

        store
            .set_shard_to_migration_status("users", &Bson::Int64(7), ShardStatus::MigratingCopy)
            .await
            .unwrap();
        assert!(store.are_migrations_happening().await.unwrap());
    }

    #[tokio::test]
    async fn test_set_shard_at_rest_commits_location_and_clears_destination() {
        let store = store_with_shard(ShardStatus::AtRest);
        let destination = Location::new("B", "appdb");
        store
            .start_migration("users", &Bson::Int64(7), &destination)
            .await
            .unwrap();

        store
            .set_shard_at_rest("users", &Bson::Int64(7), &destination, true)
            .await
            .unwrap();

        let shard = store.get_shard("users", &Bson::Int64(7)).await.unwrap();
        assert_eq!(shard.status, ShardStatus::AtRest);
        assert_eq!(shard.location, destination);
        assert_eq!(shard.new_location, None);
    }

    #[tokio::test]
    async fn test_set_shard_at_rest_without_force_requires_at_rest() {
        let store = store_with_shard(ShardStatus::PostMigrationDelete);
        let err = store
            .set_shard_at_rest("users", &Bson::Int64(7), &Location::new("B", "appdb"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::StatusConflict { .. }));
    }

    #[tokio::test]
    async fn test_unknown_collection_has_no_realm() {
        let store = InMemoryMetadataStore::new(Duration::from_millis(100));
        let err = store.get_realm_for_collection("orders").await.unwrap_err();
        assert!(matches!(err, MetadataError::RealmNotFound(name) if name == "orders"));
    }
}
