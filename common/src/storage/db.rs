use crate::error::AppError;

use super::types::{generation_job::GenerationJob, StoredObject};
use std::ops::Deref;
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    /// # Initialize a new database client
    ///
    /// # Arguments
    /// * `address` - Engine address, e.g. `ws://localhost:8000` or `mem://`
    ///
    /// # Returns
    /// * `SurrealDbClient` initialized
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        // Embedded engines have no root user to sign in as
        if !address.starts_with("mem://") {
            db.signin(Root { username, password }).await?;
        }

        // Set namespace
        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    pub async fn ensure_initialized(&self) -> Result<(), AppError> {
        Self::define_tables(self).await?;
        Self::build_indexes(self).await?;

        Ok(())
    }

    pub async fn define_tables(&self) -> Result<(), Error> {
        self.client
            .query(format!(
                "DEFINE TABLE IF NOT EXISTS {} SCHEMALESS",
                GenerationJob::table_name()
            ))
            .await?;
        Ok(())
    }

    pub async fn build_indexes(&self) -> Result<(), Error> {
        // The unique index is what rejects a second job claiming an existing image name
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_generation_job_image_name ON generation_job FIELDS image_name UNIQUE")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_generation_job_status ON generation_job FIELDS status")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_generation_job_created ON generation_job FIELDS created_at")
            .await?;

        Ok(())
    }

    /// Operation to store a object in SurrealDB, requires the struct to implement StoredObject
    ///
    /// # Arguments
    /// * `item` - The item to be stored
    ///
    /// # Returns
    /// * `Result` - Item or Error
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    /// Operation to retrieve a single object by its ID, requires the struct to implement StoredObject
    ///
    /// # Arguments
    /// * `id` - The ID of the item to retrieve
    ///
    /// # Returns
    /// * `Result<Option<T>, Error>` - The found item or Error
    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}
