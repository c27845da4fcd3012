use super::model::{EntryRow, ProductRow};
use crate::model::{
    is_local_id, new_local_id, CachedProduct, EntryState, Mutation, Operation, ProductFields, QueueEntry,
    SyncStatus,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Executor, Sqlite, SqlitePool, Transaction};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, instrument};
use uuid::Uuid;

pub type Pool = SqlitePool;

const SELECT_ENTRIES: &str = "SELECT seq, id, operation, target_id, payload, enqueued_at, \
     retry_count, state, last_error FROM sync_queue";

const SELECT_PRODUCTS: &str = "SELECT id, name, description, price, quantity, sku, category, \
     image_url, synced, deleted, last_modified, sync_error FROM products";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url)?;
    // WAL plus FULL sync: a committed enqueue survives a crash.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", normalized))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePoolOptions::new()
        .connect_with(options)
        .await
        .context("failed to open local store")?;
    Ok(pool)
}

/// Expand `~/` in a file-backed SQLite URL and create the database's parent
/// directory. In-memory and non-SQLite URLs pass through unchanged.
fn prepare_sqlite_url(url: &str) -> Result<String> {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return Ok(url.to_string());
    };
    if rest.starts_with(":memory") {
        return Ok(url.to_string());
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };
    if path.is_empty() {
        return Ok(url.to_string());
    }

    let path = expand_home(path);
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create database directory {}", dir.display()))?;
    }

    Ok(match query {
        Some(query) => format!("sqlite://{}?{}", path.display(), query),
        None => format!("sqlite://{}", path.display()),
    })
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => Path::new(&home).join(rest),
        _ => PathBuf::from(path),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Follow a placeholder id to the id the server assigned, if any.
pub async fn resolve_alias<'e, E>(executor: E, id: &str) -> Result<String>
where
    E: Executor<'e, Database = Sqlite>,
{
    let remote: Option<String> =
        sqlx::query_scalar("SELECT remote_id FROM product_aliases WHERE local_id = ?")
            .bind(id)
            .fetch_optional(executor)
            .await?;
    Ok(remote.unwrap_or_else(|| id.to_string()))
}

/// Append a queue entry and apply the mutation to the product cache in a
/// single transaction.
///
/// The insert must stay the first statement: it takes the write lock before
/// any read. A read-first deferred transaction cannot be upgraded after a
/// replay commit lands in between and fails with `SQLITE_BUSY`.
#[instrument(skip_all, fields(operation = mutation.operation().as_str()))]
pub async fn insert_entry(pool: &Pool, mutation: &Mutation) -> Result<QueueEntry> {
    let (requested_id, payload) = match mutation {
        Mutation::Create { id: Some(id), fields } => (id.clone(), Some(fields.clone())),
        Mutation::Create { id: None, fields } => (new_local_id(), Some(fields.clone())),
        Mutation::Update { id, fields } => (id.clone(), Some(fields.clone())),
        Mutation::Delete { id } => (id.clone(), None),
    };
    let id = Uuid::new_v4();
    let operation = mutation.operation();
    let payload_json = payload.as_ref().map(serde_json::to_string).transpose()?;

    let mut tx = pool.begin().await?;

    // Timestamps strictly increase even if the wall clock steps back.
    let (target_id, micros): (String, i64) = sqlx::query_as(
        "INSERT INTO sync_queue (id, operation, target_id, payload, enqueued_at, retry_count, state) \
         SELECT ?1, ?2, \
                COALESCE((SELECT remote_id FROM product_aliases WHERE local_id = ?3), ?3), \
                ?4, \
                MAX(?5, COALESCE((SELECT MAX(enqueued_at) FROM sync_queue) + 1, ?5)), \
                0, ?6 \
         RETURNING target_id, enqueued_at",
    )
    .bind(id.to_string())
    .bind(operation.as_str())
    .bind(&requested_id)
    .bind(payload_json)
    .bind(Utc::now().timestamp_micros())
    .bind(EntryState::Queued.as_str())
    .fetch_one(&mut *tx)
    .await?;

    let now = Utc::now();
    match &payload {
        Some(fields) => upsert_product_tx(&mut tx, &target_id, fields, now).await?,
        None => {
            sqlx::query(
                "UPDATE products SET deleted = 1, synced = 0, last_modified = ? WHERE id = ?",
            )
            .bind(now)
            .bind(&target_id)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;

    let entry = QueueEntry {
        id,
        operation,
        target_id,
        payload,
        enqueued_at: DateTime::<Utc>::from_timestamp_micros(micros)
            .ok_or_else(|| anyhow!("clock out of range"))?,
        retry_count: 0,
        state: EntryState::Queued,
        last_error: None,
    };
    debug!(entry_id = %entry.id, target_id = %entry.target_id, "queue entry stored");
    Ok(entry)
}

async fn upsert_product_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    fields: &ProductFields,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO products (id, name, description, price, quantity, sku, category, image_url, synced, deleted, last_modified) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?) \
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, description = excluded.description, \
         price = excluded.price, quantity = excluded.quantity, sku = excluded.sku, \
         category = excluded.category, image_url = excluded.image_url, synced = 0, deleted = 0, \
         last_modified = excluded.last_modified, sync_error = NULL",
    )
    .bind(id)
    .bind(&fields.name)
    .bind(&fields.description)
    .bind(fields.price)
    .bind(fields.quantity)
    .bind(&fields.sku)
    .bind(&fields.category)
    .bind(&fields.image_url)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Snapshot of every entry, queued and poisoned, in replay order.
#[instrument(skip_all)]
pub async fn list_entries(pool: &Pool) -> Result<Vec<QueueEntry>> {
    let rows: Vec<EntryRow> =
        sqlx::query_as(&format!("{} ORDER BY enqueued_at ASC, seq ASC", SELECT_ENTRIES))
            .fetch_all(pool)
            .await?;
    rows.into_iter().map(QueueEntry::try_from).collect()
}

/// Same order as `list_entries`, decoded row by row as the stream is polled.
pub fn stream_entries(pool: &Pool) -> BoxStream<'_, Result<QueueEntry>> {
    sqlx::query_as::<_, EntryRow>(
        "SELECT seq, id, operation, target_id, payload, enqueued_at, retry_count, state, last_error \
         FROM sync_queue ORDER BY enqueued_at ASC, seq ASC",
    )
    .fetch(pool)
    .map(|row| row.map_err(anyhow::Error::from).and_then(QueueEntry::try_from))
    .boxed()
}

#[instrument(skip_all)]
pub async fn fetch_entry(pool: &Pool, id: Uuid) -> Result<Option<QueueEntry>> {
    let row: Option<EntryRow> = sqlx::query_as(&format!("{} WHERE id = ?", SELECT_ENTRIES))
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;
    row.map(QueueEntry::try_from).transpose()
}

/// Remove an entry the server confirmed and settle the product cache.
///
/// For a confirmed create, `remote_id` replaces the placeholder id on the
/// cached row and on every entry still queued for it. Returns the id the
/// product is known by afterwards.
#[instrument(skip_all, fields(entry_id = %entry.id))]
pub async fn complete_entry(
    pool: &Pool,
    entry: &QueueEntry,
    remote_id: Option<&str>,
) -> Result<String> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM sync_queue WHERE id = ?")
        .bind(entry.id.to_string())
        .execute(&mut *tx)
        .await?;

    let mut target = entry.target_id.clone();
    if let Some(remote_id) = remote_id.filter(|r| *r != entry.target_id) {
        sqlx::query("UPDATE OR REPLACE products SET id = ? WHERE id = ?")
            .bind(remote_id)
            .bind(&entry.target_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE sync_queue SET target_id = ? WHERE target_id = ?")
            .bind(remote_id)
            .bind(&entry.target_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT OR REPLACE INTO product_aliases (local_id, remote_id) VALUES (?, ?)")
            .bind(&entry.target_id)
            .bind(remote_id)
            .execute(&mut *tx)
            .await?;
        target = remote_id.to_string();
    }

    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue WHERE target_id = ?")
        .bind(&target)
        .fetch_one(&mut *tx)
        .await?;

    if remaining == 0 {
        let sql = match entry.operation {
            Operation::Delete => "DELETE FROM products WHERE id = ?",
            Operation::Create | Operation::Update => {
                "UPDATE products SET synced = 1, sync_error = NULL WHERE id = ?"
            }
        };
        sqlx::query(sql).bind(&target).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(target)
}

#[instrument(skip_all)]
pub async fn record_failure(
    pool: &Pool,
    id: Uuid,
    retry_count: u32,
    state: EntryState,
    error: &str,
) -> Result<()> {
    sqlx::query("UPDATE sync_queue SET retry_count = ?, state = ?, last_error = ? WHERE id = ?")
        .bind(i64::from(retry_count))
        .bind(state.as_str())
        .bind(error)
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete a poisoned entry.
///
/// When nothing else targets the product, its cache row is settled: a
/// placeholder product the server never stored is dropped; a server product
/// keeps its row, un-hidden, with the failure recorded in `sync_error`.
#[instrument(skip_all)]
pub async fn discard_entry(pool: &Pool, id: Uuid) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let discarded: Option<(String, Option<String>)> = sqlx::query_as(
        "DELETE FROM sync_queue WHERE id = ? AND state = 'poisoned' RETURNING target_id, last_error",
    )
    .bind(id.to_string())
    .fetch_optional(&mut *tx)
    .await?;
    let Some((target, last_error)) = discarded else {
        return Ok(false);
    };

    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue WHERE target_id = ?")
        .bind(&target)
        .fetch_one(&mut *tx)
        .await?;
    if remaining == 0 {
        if is_local_id(&target) {
            sqlx::query("DELETE FROM products WHERE id = ?")
                .bind(&target)
                .execute(&mut *tx)
                .await?;
        } else {
            let note = format!(
                "local change discarded: {}",
                last_error.as_deref().unwrap_or("unknown error")
            );
            sqlx::query(
                "UPDATE products SET synced = 1, deleted = 0, sync_error = ? \
                 WHERE id = ? AND synced = 0",
            )
            .bind(note)
            .bind(&target)
            .execute(&mut *tx)
            .await?;
        }
    }
    tx.commit().await?;
    Ok(true)
}

#[instrument(skip_all)]
pub async fn requeue_entry(pool: &Pool, id: Uuid) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE sync_queue SET state = 'queued', retry_count = 0 WHERE id = ? AND state = 'poisoned'",
    )
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn fetch_product(pool: &Pool, id: &str) -> Result<Option<CachedProduct>> {
    let id = resolve_alias(pool, id).await?;
    let row: Option<ProductRow> =
        sqlx::query_as(&format!("{} WHERE id = ? AND deleted = 0", SELECT_PRODUCTS))
            .bind(&id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(CachedProduct::from))
}

#[instrument(skip_all)]
pub async fn list_products(pool: &Pool) -> Result<Vec<CachedProduct>> {
    let rows: Vec<ProductRow> =
        sqlx::query_as(&format!("{} WHERE deleted = 0 ORDER BY name, id", SELECT_PRODUCTS))
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(CachedProduct::from).collect())
}

#[instrument(skip_all)]
pub async fn sync_status(pool: &Pool) -> Result<SyncStatus> {
    let queued: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue WHERE state = 'queued'")
        .fetch_one(pool)
        .await?;
    let poisoned: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue WHERE state = 'poisoned'")
            .fetch_one(pool)
            .await?;
    let unsynced_products: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM products WHERE synced = 0")
            .fetch_one(pool)
            .await?;
    Ok(SyncStatus {
        queued,
        poisoned,
        unsynced_products,
    })
}
