//! Durable queue of product mutations replayed against the inventory service.
//!
//! Entries are applied strictly one at a time in enqueue order. A failed or
//! poisoned entry blocks the later entries for the same product until it is
//! applied, discarded or requeued; other products keep flowing.

use crate::connectivity::Connectivity;
use crate::db::{self, Pool};
use crate::model::{
    CachedProduct, EntryState, Mutation, Operation, QueueEntry, ReplayOutcome, ReplayReport,
    SyncStatus,
};
use crate::remote::{InventoryApi, RemoteError};
use anyhow::{Context, Result};
use futures::stream::BoxStream;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_RETRIES: u32 = 5;

pub struct SyncQueue {
    pool: Pool,
    api: Arc<dyn InventoryApi>,
    connectivity: Connectivity,
    max_retries: u32,
    replay_guard: Mutex<()>,
}

impl SyncQueue {
    pub fn new(pool: Pool, api: Arc<dyn InventoryApi>, connectivity: Connectivity) -> Self {
        Self {
            pool,
            api,
            connectivity,
            max_retries: DEFAULT_MAX_RETRIES,
            replay_guard: Mutex::new(()),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Record a mutation and apply it to the product cache. Durable once it returns.
    #[instrument(skip_all, fields(operation = mutation.operation().as_str()))]
    pub async fn enqueue(&self, mutation: Mutation) -> Result<QueueEntry> {
        let entry = db::insert_entry(&self.pool, &mutation)
            .await
            .context("failed to persist queue entry")?;
        info!(entry_id = %entry.id, target_id = %entry.target_id, "mutation queued");
        Ok(entry)
    }

    /// Run one replay pass over the current queue.
    ///
    /// Remote failures are folded into the report; only local store errors
    /// come back as `Err`.
    #[instrument(skip_all)]
    pub async fn replay(&self) -> Result<ReplayOutcome> {
        let Ok(_guard) = self.replay_guard.try_lock() else {
            debug!("replay already in flight");
            return Ok(ReplayOutcome::AlreadyRunning);
        };
        if !self.connectivity.is_online() {
            debug!("offline; replay skipped");
            return Ok(ReplayOutcome::Offline);
        }

        let entries = db::list_entries(&self.pool)
            .await
            .context("failed to read sync queue")?;
        let mut report = ReplayReport::default();
        let mut blocked: HashSet<String> = HashSet::new();
        // Placeholder ids confirmed earlier in this pass.
        let mut renamed: HashMap<String, String> = HashMap::new();

        for mut entry in entries {
            if let Some(remote_id) = renamed.get(&entry.target_id) {
                entry.target_id = remote_id.clone();
            }
            if entry.is_poisoned() {
                blocked.insert(entry.target_id.clone());
                continue;
            }
            if blocked.contains(&entry.target_id) || !self.connectivity.is_online() {
                report.deferred += 1;
                continue;
            }

            match self.apply(&entry).await {
                Ok(remote_id) => {
                    let target = db::complete_entry(&self.pool, &entry, remote_id.as_deref())
                        .await
                        .context("failed to settle applied queue entry")?;
                    if target != entry.target_id {
                        renamed.insert(entry.target_id.clone(), target.clone());
                    }
                    report.applied += 1;
                    info!(
                        entry_id = %entry.id,
                        target_id = %target,
                        operation = entry.operation.as_str(),
                        "queue entry applied"
                    );
                }
                Err(err) => {
                    blocked.insert(entry.target_id.clone());
                    let retry_count = entry.retry_count.saturating_add(1);
                    let poison = !err.is_retryable() || retry_count > self.max_retries;
                    let state = if poison {
                        EntryState::Poisoned
                    } else {
                        EntryState::Queued
                    };
                    db::record_failure(&self.pool, entry.id, retry_count, state, &err.to_string())
                        .await
                        .context("failed to record replay failure")?;
                    if poison {
                        report.poisoned += 1;
                        warn!(
                            ?err,
                            entry_id = %entry.id,
                            target_id = %entry.target_id,
                            retry_count,
                            "queue entry poisoned; needs manual review"
                        );
                    } else {
                        report.deferred += 1;
                        warn!(
                            ?err,
                            entry_id = %entry.id,
                            target_id = %entry.target_id,
                            retry_count,
                            "queue entry failed; retrying on next pass"
                        );
                    }
                }
            }
        }

        info!(
            applied = report.applied,
            deferred = report.deferred,
            poisoned = report.poisoned,
            "replay pass finished"
        );
        Ok(ReplayOutcome::Completed(report))
    }

    /// Issue the remote call for one entry. `Some(id)` carries the id the
    /// server assigned on create.
    async fn apply(&self, entry: &QueueEntry) -> Result<Option<String>, RemoteError> {
        match (entry.operation, &entry.payload) {
            (Operation::Create, Some(fields)) => {
                let created = self.api.create_product(fields).await?;
                Ok(Some(created.id))
            }
            (Operation::Update, Some(fields)) => {
                self.api.update_product(&entry.target_id, fields).await?;
                Ok(None)
            }
            (Operation::Delete, _) => match self.api.delete_product(&entry.target_id).await {
                // Already gone upstream.
                Ok(()) | Err(RemoteError::NotFound) => Ok(None),
                Err(err) => Err(err),
            },
            (op, None) => Err(RemoteError::Invalid(format!(
                "{} entry has no payload",
                op.as_str()
            ))),
        }
    }

    /// Every entry, poisoned ones included, in replay order. Each call starts
    /// a fresh read; nothing is modified.
    pub fn pending(&self) -> BoxStream<'_, Result<QueueEntry>> {
        db::stream_entries(&self.pool)
    }

    pub async fn entry(&self, id: Uuid) -> Result<Option<QueueEntry>> {
        db::fetch_entry(&self.pool, id).await
    }

    /// Drop a poisoned entry. Returns `false` if it is unknown or not poisoned.
    #[instrument(skip(self))]
    pub async fn discard(&self, id: Uuid) -> Result<bool> {
        let removed = db::discard_entry(&self.pool, id)
            .await
            .context("failed to discard queue entry")?;
        if removed {
            info!(entry_id = %id, "poisoned entry discarded");
        }
        Ok(removed)
    }

    /// Put a poisoned entry back in line with a fresh retry budget.
    #[instrument(skip(self))]
    pub async fn requeue(&self, id: Uuid) -> Result<bool> {
        let requeued = db::requeue_entry(&self.pool, id)
            .await
            .context("failed to requeue entry")?;
        if requeued {
            info!(entry_id = %id, "poisoned entry requeued");
        }
        Ok(requeued)
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        db::sync_status(&self.pool).await
    }

    pub async fn product(&self, id: &str) -> Result<Option<CachedProduct>> {
        db::fetch_product(&self.pool, id).await
    }

    pub async fn products(&self) -> Result<Vec<CachedProduct>> {
        db::list_products(&self.pool).await
    }
}
