//! Presence tracking: demotes units to OFFLINE when their heartbeat lapses.
//!
//! ## Per-unit state machine
//!
//! ```text
//! OFFLINE ──[reading accepted by ingestion]──▶ ONLINE
//!    ▲                                           │
//!    └──[sweep: now - last_seen >= timeout]──────┘
//! ```
//!
//! Only ingestion promotes and only the sweep demotes. The sweep decides
//! while holding the unit's slot lock and the store write is a
//! compare-and-set on `last_seen_at`, so a reading that lands mid-sweep is
//! never overwritten into OFFLINE.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broadcast::{Broadcaster, LiveEvent};
use crate::cache::{SnapshotCache, UnitSlot};
use crate::db::Db;
use crate::model::{UnitId, UnitStatus};
use crate::state::SharedState;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub demoted: usize,
    pub failed: usize,
}

enum Outcome {
    Kept,
    Demoted,
    Failed,
}

pub struct PresenceTracker {
    db: Db,
    cache: Arc<SnapshotCache>,
    broadcaster: Arc<Broadcaster>,
    shared: SharedState,
    interval: Duration,
    timeout: Duration,
}

impl PresenceTracker {
    pub fn new(
        db: Db,
        cache: Arc<SnapshotCache>,
        broadcaster: Arc<Broadcaster>,
        shared: SharedState,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            cache,
            broadcaster,
            shared,
            interval,
            timeout,
        }
    }

    /// Start the sweep ticker. It runs until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!(
                interval_sec = self.interval.as_secs(),
                timeout_sec = self.timeout.as_secs(),
                "presence sweep started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.sweep().await;
                        if report.demoted > 0 || report.failed > 0 {
                            info!(
                                checked = report.checked,
                                demoted = report.demoted,
                                failed = report.failed,
                                "presence sweep"
                            );
                        }
                    }
                }
            }

            info!("presence sweep stopped");
        })
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(OffsetDateTime::now_utc()).await
    }

    /// One pass over every unit, judged against `now`. A failure on one
    /// unit is logged and the pass moves on.
    pub async fn sweep_at(&self, now: OffsetDateTime) -> SweepReport {
        let mut report = SweepReport::default();
        for (unit_id, slot) in self.cache.slots().await {
            report.checked += 1;
            match self.check_unit(unit_id, &slot, now).await {
                Outcome::Kept => {}
                Outcome::Demoted => report.demoted += 1,
                Outcome::Failed => report.failed += 1,
            }
        }
        report
    }

    async fn check_unit(&self, unit_id: UnitId, slot: &UnitSlot, now: OffsetDateTime) -> Outcome {
        let mut entry = slot.lock().await;
        if entry.is_removed() || entry.status == UnitStatus::Offline {
            return Outcome::Kept;
        }

        // Re-read under the lock: this is the value ingestion last wrote.
        let Some(seen_at) = entry.last_seen_at else {
            warn!(unit_id, "presence: ONLINE unit without last_seen_at");
            return Outcome::Kept;
        };
        let idle = now - seen_at;
        if idle < self.timeout {
            return Outcome::Kept;
        }

        match self.db.mark_offline(unit_id, seen_at).await {
            Ok(true) => {}
            Ok(false) => {
                // Store and cache disagree; the store wins on next warm start.
                warn!(unit_id, "presence: store rejected OFFLINE transition");
                return Outcome::Failed;
            }
            Err(e) => {
                error!(unit_id, error = %format!("{e:#}"), "presence: mark_offline failed");
                return Outcome::Failed;
            }
        }

        entry.status = UnitStatus::Offline;
        info!(
            unit_id,
            unit = %entry.unit.name,
            idle_sec = idle.whole_seconds(),
            "unit OFFLINE"
        );

        let delivery = self
            .broadcaster
            .publish(
                &entry.unit.topic(),
                &LiveEvent::StatusChanged {
                    unit_id,
                    status: UnitStatus::Offline,
                    last_seen_at: Some(seen_at),
                },
            )
            .await;
        debug!(unit_id, delivered = delivery.delivered, "presence: status broadcast");
        drop(entry);

        self.shared
            .write()
            .await
            .record_presence(unit_id, UnitStatus::Offline);

        Outcome::Demoted
    }
}

// ===========================================================================
// Tests
// ===========================================================================
