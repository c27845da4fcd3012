use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix of ids handed out to products created while offline.
pub const LOCAL_ID_PREFIX: &str = "local-";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryState {
    Queued,
    Poisoned,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Queued => "queued",
            EntryState::Poisoned => "poisoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(EntryState::Queued),
            "poisoned" => Some(EntryState::Poisoned),
            _ => None,
        }
    }
}

/// Business fields of a product, as sent to the inventory service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductFields {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub price: f64,
    pub quantity: i64,
    #[serde(default)]
    pub sku: String,
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// A mutation accepted locally. Fields are validated by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// `id` is `None` when the server has not assigned one yet.
    Create {
        id: Option<String>,
        fields: ProductFields,
    },
    Update {
        id: String,
        fields: ProductFields,
    },
    Delete {
        id: String,
    },
}

impl Mutation {
    pub fn operation(&self) -> Operation {
        match self {
            Mutation::Create { .. } => Operation::Create,
            Mutation::Update { .. } => Operation::Update,
            Mutation::Delete { .. } => Operation::Delete,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub id: Uuid,
    pub operation: Operation,
    pub target_id: String,
    /// `None` for deletes.
    pub payload: Option<ProductFields>,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub state: EntryState,
    pub last_error: Option<String>,
}

impl QueueEntry {
    pub fn is_poisoned(&self) -> bool {
        self.state == EntryState::Poisoned
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedProduct {
    pub id: String,
    #[serde(flatten)]
    pub fields: ProductFields,
    pub synced: bool,
    pub deleted: bool,
    pub last_modified: DateTime<Utc>,
    /// Set when a local change was discarded and the row may differ from the
    /// server. Cleared by the next local change or confirmed sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,
}

/// Counts produced by one replay pass.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ReplayReport {
    pub applied: usize,
    pub deferred: usize,
    pub poisoned: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    Completed(ReplayReport),
    /// Another pass was in flight; nothing was done.
    AlreadyRunning,
    /// Connectivity reported offline; no remote calls were made.
    Offline,
}

impl ReplayOutcome {
    pub fn report(&self) -> Option<ReplayReport> {
        match self {
            ReplayOutcome::Completed(report) => Some(*report),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct SyncStatus {
    pub queued: i64,
    pub poisoned: i64,
    pub unsynced_products: i64,
}

pub fn new_local_id() -> String {
    format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4())
}

pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}
