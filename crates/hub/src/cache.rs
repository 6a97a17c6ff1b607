//! Latest-snapshot cache: per-unit status, last-seen time and most recent
//! reading, plus the api-key index used to authenticate devices.
//!
//! Each unit lives in its own [`UnitSlot`]. Holding a slot's lock is what
//! serializes ingestion, the presence sweep and deletion for that unit; the
//! outer map lock is only ever held for lookups and never while waiting on a
//! slot.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};

use crate::db::Db;
use crate::model::{CurrentState, Reading, Unit, UnitId, UnitStatus};

pub type UnitSlot = Arc<Mutex<UnitEntry>>;

#[derive(Debug)]
pub struct UnitEntry {
    pub unit: Unit,
    pub status: UnitStatus,
    pub last_seen_at: Option<OffsetDateTime>,
    pub latest: Option<Reading>,
    removed: bool,
}

impl UnitEntry {
    pub fn new(
        unit: Unit,
        status: UnitStatus,
        last_seen_at: Option<OffsetDateTime>,
        latest: Option<Reading>,
    ) -> Self {
        Self {
            unit,
            status,
            last_seen_at,
            latest,
            removed: false,
        }
    }

    /// Apply a reading that has just been committed to the store.
    pub fn set(&mut self, reading: Reading, status: UnitStatus, seen_at: OffsetDateTime) {
        self.latest = Some(reading);
        self.status = status;
        self.last_seen_at = Some(seen_at);
    }

    pub fn current_state(&self) -> CurrentState {
        CurrentState::new(self.status, self.last_seen_at, self.latest.as_ref())
    }

    /// A removed entry may still be referenced by a task that resolved it
    /// before deletion; such tasks must treat the unit as gone.
    pub fn is_removed(&self) -> bool {
        self.removed
    }
}

#[derive(Default)]
struct Index {
    slots: HashMap<UnitId, UnitSlot>,
    by_key: HashMap<String, UnitId>,
}

#[derive(Default)]
pub struct SnapshotCache {
    index: RwLock<Index>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the cache from the store: every unit with its persisted
    /// presence and its latest reading.
    pub async fn warm(db: &Db) -> Result<Self> {
        let cache = Self::new();
        for stored in db.load_units().await? {
            let latest = db.latest_reading(stored.unit.id).await?;
            cache
                .insert(UnitEntry::new(
                    stored.unit,
                    stored.status,
                    stored.last_seen_at,
                    latest,
                ))
                .await;
        }
        Ok(cache)
    }

    pub async fn insert(&self, entry: UnitEntry) {
        let id = entry.unit.id;
        let key = entry.unit.api_key.clone();
        let mut idx = self.index.write().await;
        idx.by_key.insert(key, id);
        idx.slots.insert(id, Arc::new(Mutex::new(entry)));
    }

    pub async fn resolve_key(&self, api_key: &str) -> Option<UnitSlot> {
        let idx = self.index.read().await;
        let id = idx.by_key.get(api_key)?;
        idx.slots.get(id).cloned()
    }

    pub async fn slot(&self, id: UnitId) -> Option<UnitSlot> {
        self.index.read().await.slots.get(&id).cloned()
    }

    pub async fn slots(&self) -> Vec<(UnitId, UnitSlot)> {
        let idx = self.index.read().await;
        let mut out: Vec<_> = idx.slots.iter().map(|(id, s)| (*id, s.clone())).collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Current status and snapshot for a unit.
    pub async fn get(&self, id: UnitId) -> Option<CurrentState> {
        let slot = self.slot(id).await?;
        let entry = slot.lock().await;
        if entry.is_removed() {
            return None;
        }
        Some(entry.current_state())
    }

    /// Unit definitions with their presence, ordered by id.
    pub async fn units(&self) -> Vec<(Unit, UnitStatus, Option<OffsetDateTime>)> {
        let mut out = Vec::new();
        for (_, slot) in self.slots().await {
            let entry = slot.lock().await;
            if !entry.is_removed() {
                out.push((entry.unit.clone(), entry.status, entry.last_seen_at));
            }
        }
        out
    }

    /// Drop a unit whose store rows are already gone. The caller holds the
    /// slot lock and passes the guarded entry in.
    pub async fn forget(&self, entry: &mut UnitEntry) {
        entry.removed = true;
        let mut idx = self.index.write().await;
        idx.by_key.remove(&entry.unit.api_key);
        idx.slots.remove(&entry.unit.id);
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.slots.len()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
