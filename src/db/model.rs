//! Row models returned by the repository queries.
//!
//! These mirror the SQLite columns one-to-one; conversion into the domain
//! types in `crate::model` happens through `TryFrom`/`From`.

use crate::model::{CachedProduct, EntryState, Operation, ProductFields, QueueEntry};
use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EntryRow {
    pub seq: i64,
    pub id: String,
    pub operation: String,
    pub target_id: String,
    pub payload: Option<String>,
    pub enqueued_at: i64,
    pub retry_count: i64,
    pub state: String,
    pub last_error: Option<String>,
}

impl TryFrom<EntryRow> for QueueEntry {
    type Error = anyhow::Error;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.id)
            .with_context(|| format!("queue entry {} has a malformed id", row.seq))?;
        let operation = Operation::parse(&row.operation)
            .ok_or_else(|| anyhow!("queue entry {} has unknown operation {}", id, row.operation))?;
        let state = EntryState::parse(&row.state)
            .ok_or_else(|| anyhow!("queue entry {} has unknown state {}", id, row.state))?;
        let payload = row
            .payload
            .as_deref()
            .map(serde_json::from_str::<ProductFields>)
            .transpose()
            .with_context(|| format!("queue entry {} has an unreadable payload", id))?;
        let enqueued_at = DateTime::<Utc>::from_timestamp_micros(row.enqueued_at)
            .ok_or_else(|| anyhow!("queue entry {} has out-of-range timestamp", id))?;
        let retry_count = u32::try_from(row.retry_count).map_err(|_| {
            anyhow!(
                "queue entry {} has invalid retry count {}",
                id,
                row.retry_count
            )
        })?;

        Ok(QueueEntry {
            id,
            operation,
            target_id: row.target_id,
            payload,
            enqueued_at,
            retry_count,
            state,
            last_error: row.last_error,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProductRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub quantity: i64,
    pub sku: String,
    pub category: String,
    pub image_url: Option<String>,
    pub synced: bool,
    pub deleted: bool,
    pub last_modified: DateTime<Utc>,
    pub sync_error: Option<String>,
}

impl From<ProductRow> for CachedProduct {
    fn from(row: ProductRow) -> Self {
        CachedProduct {
            id: row.id,
            fields: ProductFields {
                name: row.name,
                description: row.description,
                price: row.price,
                quantity: row.quantity,
                sku: row.sku,
                category: row.category,
                image_url: row.image_url,
            },
            synced: row.synced,
            deleted: row.deleted,
            last_modified: row.last_modified,
            sync_error: row.sync_error,
        }
    }
}
