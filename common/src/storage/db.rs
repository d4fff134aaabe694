use crate::error::AppError;

use super::types::StoredObject;
use std::{ops::Deref, sync::Arc};
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

pub trait ProvidesDb {
    fn db(&self) -> &Arc<SurrealDbClient>;
}

impl SurrealDbClient {
    /// Connect and select the service namespace/database.
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        db.signin(Root { username, password }).await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    /// Create a client backed by the in-memory engine.
    ///
    /// Used by tests and as the degraded fallback when the configured
    /// database is unreachable at startup. Jobs persisted here do not
    /// survive a restart.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    pub async fn ensure_initialized(&self) -> Result<(), AppError> {
        Self::build_indexes(self).await?;
        Ok(())
    }

    /// Index set backing the job-store query patterns: point lookups,
    /// tenant/status filters and created_at ordering, plus correlation-id
    /// lookups on the telemetry table.
    pub async fn build_indexes(&self) -> Result<(), Error> {
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_job_correlation ON job FIELDS correlation_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_job_source ON job FIELDS source_kind")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_job_status ON job FIELDS status")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_job_tenant ON job FIELDS tenant_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_job_created ON job FIELDS created_at")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_job_tenant_status ON job FIELDS tenant_id, status")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_job_tenant_created ON job FIELDS tenant_id, created_at")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_job_status_created ON job FIELDS status, created_at")
            .await?;

        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_events_correlation ON events FIELDS correlation_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_events_type ON events FIELDS event_type")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_events_timestamp ON events FIELDS timestamp")
            .await?;

        Ok(())
    }

    /// Cheap connectivity probe used by the health endpoint.
    pub async fn health_check(&self) -> bool {
        self.client.query("RETURN 1").await.is_ok()
    }

    /// Store an object under its own id. Errors on id collision.
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use crate::stored_object;

    use super::*;
    use uuid::Uuid;

    stored_object!(Dummy, "dummy", {
        name: String
    });

    #[tokio::test]
    async fn test_initialization_and_crud() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string(); // ensures isolation per test run
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        db.ensure_initialized()
            .await
            .expect("Failed to initialize schema");

        let dummy = Dummy {
            id: "abc".to_string(),
            name: "first".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let stored = db.store_item(dummy.clone()).await.expect("Failed to store");
        assert!(stored.is_some());

        let fetched = db
            .get_item::<Dummy>(&dummy.id)
            .await
            .expect("Failed to fetch");
        assert_eq!(fetched, Some(dummy.clone()));

        let all = db
            .get_all_stored_items::<Dummy>()
            .await
            .expect("Failed to fetch all");
        assert!(all.contains(&dummy));

        let deleted = db
            .delete_item::<Dummy>(&dummy.id)
            .await
            .expect("Failed to delete");
        assert_eq!(deleted, Some(dummy));

        let fetch_post = db
            .get_item::<Dummy>("abc")
            .await
            .expect("Failed fetch post delete");
        assert!(fetch_post.is_none());
    }

    #[tokio::test]
    async fn test_store_item_rejects_duplicate_id() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");

        let dummy = Dummy {
            id: "dup".to_string(),
            name: "first".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        db.store_item(dummy.clone()).await.expect("first store");
        assert!(db.store_item(dummy).await.is_err());
    }

    #[tokio::test]
    async fn test_health_check() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");

        assert!(db.health_check().await);
    }
}
