//! The downstream STAC catalog: collections and their items.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use tracing::instrument;

use crate::db::Pool;

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn collection_exists(&self, collection_id: &str) -> Result<bool>;

    async fn get_collection(&self, collection_id: &str) -> Result<Option<Value>>;

    /// Insert or replace a collection document keyed by its `id`.
    async fn upsert_collection(&self, collection: &Value) -> Result<()>;

    /// Remove a collection and its items. Returns false when it did not exist.
    async fn delete_collection(&self, collection_id: &str) -> Result<bool>;

    /// Write items in one transaction. Items already present (same collection
    /// and id) are skipped; returns how many were new.
    async fn insert_items(&self, collection_id: &str, items: &[Value]) -> Result<u64>;

    async fn count_items(&self, collection_id: &str) -> Result<i64>;
}

/// Catalog kept in the service's own SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteCatalog {
    pool: Pool,
}

impl SqliteCatalog {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn document_id(doc: &Value) -> Result<&str> {
    doc.get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("document has no string id"))
}

#[async_trait]
impl CatalogStore for SqliteCatalog {
    #[instrument(skip_all)]
    async fn collection_exists(&self, collection_id: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM catalog_collections WHERE id = ?")
            .bind(collection_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    #[instrument(skip_all)]
    async fn get_collection(&self, collection_id: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT content FROM catalog_collections WHERE id = ?")
            .bind(collection_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let content: String = row.try_get("content")?;
        Ok(Some(serde_json::from_str(&content).context("stored collection is not JSON")?))
    }

    #[instrument(skip_all)]
    async fn upsert_collection(&self, collection: &Value) -> Result<()> {
        let id = document_id(collection)?;
        sqlx::query(
            "INSERT INTO catalog_collections (id, content, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at",
        )
        .bind(id)
        .bind(serde_json::to_string(collection)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn delete_collection(&self, collection_id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM catalog_collections WHERE id = ?")
            .bind(collection_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    #[instrument(skip_all, fields(collection_id, count = items.len()))]
    async fn insert_items(&self, collection_id: &str, items: &[Value]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let mut inserted = 0;
        for item in items {
            let id = document_id(item)?;
            let res = sqlx::query(
                "INSERT OR IGNORE INTO catalog_items (collection_id, id, content, inserted_at) VALUES (?, ?, ?, ?)",
            )
            .bind(collection_id)
            .bind(id)
            .bind(serde_json::to_string(item)?)
            .bind(now)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to insert item {id} into {collection_id}"))?;
            inserted += res.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    #[instrument(skip_all)]
    async fn count_items(&self, collection_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM catalog_items WHERE collection_id = ?")
            .bind(collection_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::stac::fixtures;

    #[tokio::test]
    async fn items_are_deduplicated_by_id() {
        let pool = db::memory_pool().await.unwrap();
        let catalog = SqliteCatalog::new(pool);
        catalog.upsert_collection(&fixtures::collection()).await.unwrap();

        let item = fixtures::item();
        let n = catalog
            .insert_items("simple-collection", &[item.clone(), item.clone()])
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(catalog.insert_items("simple-collection", &[item]).await.unwrap(), 0);
        assert_eq!(catalog.count_items("simple-collection").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn items_need_their_collection() {
        let pool = db::memory_pool().await.unwrap();
        let catalog = SqliteCatalog::new(pool);
        assert!(catalog.insert_items("nope", &[fixtures::item()]).await.is_err());
    }

    #[tokio::test]
    async fn deleting_a_collection_drops_items() {
        let pool = db::memory_pool().await.unwrap();
        let catalog = SqliteCatalog::new(pool);
        let mut collection = fixtures::collection();
        catalog.upsert_collection(&collection).await.unwrap();
        collection["description"] = "updated".into();
        catalog.upsert_collection(&collection).await.unwrap();
        assert_eq!(
            catalog.get_collection("simple-collection").await.unwrap().unwrap()["description"],
            "updated"
        );

        catalog.insert_items("simple-collection", &[fixtures::item()]).await.unwrap();
        assert!(catalog.delete_collection("simple-collection").await.unwrap());
        assert!(!catalog.collection_exists("simple-collection").await.unwrap());
        assert_eq!(catalog.count_items("simple-collection").await.unwrap(), 0);
        assert!(!catalog.delete_collection("simple-collection").await.unwrap());
    }
}
