//! Destination catalog
//!
//! The sync forwards new and changed items through [`CatalogSink`]. The
//! binary ships a SQLite implementation writing to the `products` table.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::database::{self, SharedConnection};
use crate::error::Result;
use crate::marketplace::models::{NormalizedItem, ORIGIN};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub sku: String,
    pub title: String,
    pub description: String,
    pub price: f64,
    pub stock: i64,
    pub origin: String,
    pub status: String,
    pub images: Vec<String>,
}

impl From<&NormalizedItem> for CatalogRecord {
    fn from(item: &NormalizedItem) -> Self {
        Self {
            sku: item.sku.clone(),
            title: item.title.clone(),
            description: item.description.clone(),
            price: item.price,
            stock: item.stock,
            origin: ORIGIN.to_string(),
            status: item.remote_status.clone(),
            images: item.images.clone(),
        }
    }
}

/// Idempotent upsert keyed by SKU
#[async_trait]
pub trait CatalogSink: Send + Sync {
    async fn upsert_by_sku(&self, record: &CatalogRecord) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteCatalog {
    db: SharedConnection,
}

impl SqliteCatalog {
    pub fn new(db: SharedConnection) -> Self {
        Self { db }
    }

    pub fn get(&self, sku: &str) -> Result<Option<CatalogRecord>> {
        let conn = database::lock(&self.db);
        let row = conn
            .query_row(
                "SELECT sku, title, description, price, stock, origin, status, images
                 FROM products WHERE sku = ?1",
                params![sku],
                |row| {
                    Ok((
                        CatalogRecord {
                            sku: row.get(0)?,
                            title: row.get(1)?,
                            description: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                            price: row.get(3)?,
                            stock: row.get(4)?,
                            origin: row.get(5)?,
                            status: row.get(6)?,
                            images: Vec::new(),
                        },
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((mut record, images)) => {
                record.images = serde_json::from_str(&images)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn count(&self) -> Result<i64> {
        let conn = database::lock(&self.db);
        Ok(conn.query_row("SELECT COUNT(*) FROM products", [], |row| row.get(0))?)
    }
}

#[async_trait]
impl CatalogSink for SqliteCatalog {
    async fn upsert_by_sku(&self, record: &CatalogRecord) -> Result<()> {
        let images = serde_json::to_string(&record.images)?;
        let conn = database::lock(&self.db);
        conn.execute(
            "INSERT INTO products (sku, title, description, price, stock, origin, status, images, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(sku) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                price = excluded.price,
                stock = excluded.stock,
                origin = excluded.origin,
                status = excluded.status,
                images = excluded.images,
                updated_at = excluded.updated_at",
            params![
                &record.sku,
                &record.title,
                &record.description,
                record.price,
                record.stock,
                &record.origin,
                &record.status,
                images,
                Utc::now().to_rfc3339(),
            ],
        )?;
        log::debug!("Upserted catalog record {}", record.sku);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_db;

    fn record(price: f64) -> CatalogRecord {
        CatalogRecord {
            sku: "SKU-1".into(),
            title: "Amortecedor".into(),
            description: "https://produto.mercadolivre.com.br/MLB-1".into(),
            price,
            stock: 2,
            origin: ORIGIN.into(),
            status: "active".into(),
            images: vec!["https://img/1.jpg".into()],
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_sku() {
        let catalog = SqliteCatalog::new(test_db());
        catalog.upsert_by_sku(&record(10.0)).await.unwrap();
        catalog.upsert_by_sku(&record(10.0)).await.unwrap();
        catalog.upsert_by_sku(&record(12.5)).await.unwrap();

        assert_eq!(catalog.count().unwrap(), 1);
        assert_eq!(catalog.get("SKU-1").unwrap(), Some(record(12.5)));
    }

    #[test]
    fn record_from_normalized_item_tags_origin() {
        let item = NormalizedItem {
            external_id: "MLB1".into(),
            sku: "SKU-1".into(),
            title: "Amortecedor".into(),
            description: String::new(),
            price: 1.0,
            stock: 0,
            remote_status: "paused".into(),
            images: Vec::new(),
            category: "MLB1747".into(),
            condition: "used".into(),
        };
        let record = CatalogRecord::from(&item);
        assert_eq!(record.origin, "MERCADO_LIVRE");
        assert_eq!(record.status, "paused");
    }
}
