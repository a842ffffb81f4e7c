//! Persistence seam for command items
//!
//! The relational tables of a deployment sit behind [`CommandStore`]. The
//! only write that matters for correctness is [`CommandStore::transition`]:
//! it must change the status only if the row still has the expected one, and
//! either commit every field of the update or none of them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::types::{CommandId, CommandKind, CommandRecord, CommandStatus, StatusUpdate, UplinkId};
use crate::{Result, UplinkError};

#[async_trait]
pub trait CommandStore: Send + Sync + std::fmt::Debug {
    /// Insert a new `PENDING` item.
    async fn insert(&self, kind: CommandKind, payload: serde_json::Value) -> Result<CommandRecord>;

    async fn get(&self, kind: CommandKind, id: CommandId) -> Result<Option<CommandRecord>>;

    /// Items with `status`, oldest first (`created_at`, then id).
    async fn list_by_status(
        &self,
        kind: CommandKind,
        status: CommandStatus,
    ) -> Result<Vec<CommandRecord>>;

    /// Apply `update` if the item is currently `from`.
    ///
    /// Returns the updated record, or `None` when the item is missing or its
    /// status changed in the meantime.
    async fn transition(
        &self,
        kind: CommandKind,
        id: CommandId,
        from: CommandStatus,
        update: StatusUpdate,
    ) -> Result<Option<CommandRecord>>;

    /// Newest items first.
    async fn recent(&self, kind: CommandKind, limit: usize) -> Result<Vec<CommandRecord>>;

    async fn count_by_status(&self, kind: CommandKind) -> Result<BTreeMap<CommandStatus, usize>>;

    /// Next uplink id, unique across every service sharing this store.
    async fn allocate_uplink_id(&self) -> Result<UplinkId>;
}

#[derive(Debug, Default)]
struct Tables {
    next_id: CommandId,
    last_uplink: u64,
    rows: HashMap<CommandKind, Vec<CommandRecord>>,
}

/// In-memory command tables.
#[derive(Debug, Default)]
pub struct MemoryCommandStore {
    tables: Mutex<Tables>,
}

impl MemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tables<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> Result<T> {
        let mut tables =
            self.tables.lock().map_err(|_| UplinkError::persistence("command tables poisoned"))?;
        Ok(f(&mut tables))
    }
}

fn oldest_first(records: &mut [CommandRecord]) {
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

#[async_trait]
impl CommandStore for MemoryCommandStore {
    async fn insert(&self, kind: CommandKind, payload: serde_json::Value) -> Result<CommandRecord> {
        self.with_tables(|tables| {
            tables.next_id += 1;
            let now = Utc::now();
            let record = CommandRecord {
                id: tables.next_id,
                kind,
                payload,
                status: CommandStatus::Pending,
                error_message: None,
                device_response: None,
                delivered_in: None,
                created_at: now,
                updated_at: now,
            };
            tables.rows.entry(kind).or_default().push(record.clone());
            record
        })
    }

    async fn get(&self, kind: CommandKind, id: CommandId) -> Result<Option<CommandRecord>> {
        self.with_tables(|tables| {
            tables.rows.get(&kind).and_then(|rows| rows.iter().find(|row| row.id == id).cloned())
        })
    }

    async fn list_by_status(
        &self,
        kind: CommandKind,
        status: CommandStatus,
    ) -> Result<Vec<CommandRecord>> {
        self.with_tables(|tables| {
            let mut matching: Vec<CommandRecord> = tables
                .rows
                .get(&kind)
                .map(|rows| rows.iter().filter(|row| row.status == status).cloned().collect())
                .unwrap_or_default();
            oldest_first(&mut matching);
            matching
        })
    }

    async fn transition(
        &self,
        kind: CommandKind,
        id: CommandId,
        from: CommandStatus,
        update: StatusUpdate,
    ) -> Result<Option<CommandRecord>> {
        self.with_tables(|tables| {
            let row = tables
                .rows
                .get_mut(&kind)
                .and_then(|rows| rows.iter_mut().find(|row| row.id == id))?;
            if row.status != from {
                return None;
            }
            row.status = update.to;
            row.updated_at = Utc::now();
            if update.error_message.is_some() {
                row.error_message = update.error_message;
            }
            if update.device_response.is_some() {
                row.device_response = update.device_response;
            }
            if update.delivered_in.is_some() {
                row.delivered_in = update.delivered_in;
            }
            Some(row.clone())
        })
    }

    async fn recent(&self, kind: CommandKind, limit: usize) -> Result<Vec<CommandRecord>> {
        self.with_tables(|tables| {
            let mut rows = tables.rows.get(&kind).cloned().unwrap_or_default();
            oldest_first(&mut rows);
            rows.reverse();
            rows.truncate(limit);
            rows
        })
    }

    async fn count_by_status(&self, kind: CommandKind) -> Result<BTreeMap<CommandStatus, usize>> {
        self.with_tables(|tables| {
            let mut counts = BTreeMap::new();
            for row in tables.rows.get(&kind).into_iter().flatten() {
                *counts.entry(row.status).or_insert(0) += 1;
            }
            counts
        })
    }

    async fn allocate_uplink_id(&self) -> Result<UplinkId> {
        self.with_tables(|tables| {
            tables.last_uplink += 1;
            UplinkId(tables.last_uplink)
        })
    }
}

#[cfg(test)]
impl MemoryCommandStore {
    /// Move an item's last status change `age` into the past.
    pub(crate) fn backdate(&self, kind: CommandKind, id: CommandId, age: chrono::Duration) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(row) =
            tables.rows.get_mut(&kind).and_then(|rows| rows.iter_mut().find(|row| row.id == id))
        {
            row.updated_at = row.updated_at - age;
        }
    }
}
