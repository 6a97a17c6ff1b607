//! Telemetry ingestion: authenticate, validate, commit, publish.
//!
//! A submission holds its unit's slot lock from validation through the
//! broadcast, so store order, snapshot and published order all agree for a
//! unit. Different units never contend.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::broadcast::{Broadcaster, LiveEvent};
use crate::cache::{SnapshotCache, UnitEntry, UnitSlot};
use crate::db::Db;
use crate::error::IngestError;
use crate::model::{now_ms_precision, Reading, Thresholds, Unit, UnitId, UnitStatus};
use crate::payload::{self, Limits, Telemetry};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub success: bool,
    pub unit_id: UnitId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(skip)]
    pub reading: Reading,
    /// The unit was OFFLINE before this reading.
    #[serde(skip)]
    pub came_online: bool,
}

pub struct Ingestor {
    db: Db,
    cache: Arc<SnapshotCache>,
    broadcaster: Arc<Broadcaster>,
    thresholds: Thresholds,
    limits: Limits,
}

impl Ingestor {
    pub fn new(
        db: Db,
        cache: Arc<SnapshotCache>,
        broadcaster: Arc<Broadcaster>,
        thresholds: Thresholds,
        limits: Limits,
    ) -> Self {
        Self {
            db,
            cache,
            broadcaster,
            thresholds,
            limits,
        }
    }

    /// Record one telemetry sample for the unit owning `api_key`.
    pub async fn submit(&self, api_key: Option<&str>, payload: &Value) -> Result<Ack, IngestError> {
        let slot = self.authorize(api_key).await?;
        let mut entry = slot.lock().await;
        self.record(&mut entry, payload).await
    }

    /// Like [`Ingestor::submit`] for an undecoded body. The credential is
    /// checked before the body is parsed, so a bad key is always an auth
    /// failure.
    pub async fn submit_raw(&self, api_key: Option<&str>, raw: &[u8]) -> Result<Ack, IngestError> {
        let slot = self.authorize(api_key).await?;
        let mut entry = slot.lock().await;
        if entry.is_removed() {
            return Err(IngestError::Auth);
        }
        let payload = payload::parse_body(raw).inspect_err(
            |e| debug!(unit_id = entry.unit.id, error = %e, "ingest: body rejected"),
        )?;
        self.record(&mut entry, &payload).await
    }

    async fn authorize(&self, api_key: Option<&str>) -> Result<UnitSlot, IngestError> {
        let api_key = api_key.map(str::trim).filter(|k| !k.is_empty());
        let Some(api_key) = api_key else {
            debug!("ingest: rejected submission without api key");
            return Err(IngestError::Auth);
        };
        match self.cache.resolve_key(api_key).await {
            Some(slot) => Ok(slot),
            None => {
                warn!("ingest: rejected submission with unknown api key");
                Err(IngestError::Auth)
            }
        }
    }

    /// Runs with the unit's slot lock held.
    async fn record(&self, entry: &mut UnitEntry, payload: &Value) -> Result<Ack, IngestError> {
        if entry.is_removed() {
            return Err(IngestError::Auth);
        }
        let unit_id = entry.unit.id;

        let telemetry = payload::validate(payload, entry.unit.number_of_sensors, &self.limits)
            .inspect_err(|e| debug!(unit_id, error = %e, "ingest: payload rejected"))?;

        let now = now_ms_precision();
        let reading = build_reading(
            &entry.unit,
            entry.latest.as_ref(),
            &telemetry,
            &self.thresholds,
            now,
        );

        if let Err(e) = self.db.append_reading(&reading, now).await {
            warn!(unit_id, error = %format!("{e:#}"), "ingest: append failed");
            return Err(IngestError::Storage(e));
        }

        let came_online = entry.status == UnitStatus::Offline;
        entry.set(reading.clone(), UnitStatus::Online, now);

        if came_online {
            info!(unit_id, unit = %entry.unit.name, "unit ONLINE");
            self.broadcaster
                .publish(
                    &entry.unit.topic(),
                    &LiveEvent::StatusChanged {
                        unit_id,
                        status: UnitStatus::Online,
                        last_seen_at: Some(now),
                    },
                )
                .await;
        }

        let delivery = self
            .broadcaster
            .publish(
                &entry.unit.topic(),
                &LiveEvent::UnitUpdate {
                    unit_id,
                    reading: reading.clone(),
                },
            )
            .await;
        if delivery.dropped > 0 {
            debug!(
                unit_id,
                dropped = delivery.dropped,
                "ingest: live update not delivered to all subscribers"
            );
        }

        debug!(
            unit_id,
            water_level = reading.water_level,
            temperature = reading.temperature,
            subscribers = delivery.delivered,
            "ingest: reading stored"
        );

        Ok(Ack {
            success: true,
            unit_id,
            timestamp: reading.timestamp,
            reading,
            came_online,
        })
    }
}

/// Derive a full reading from validated telemetry and the unit's previous
/// reading. Timestamps never repeat or go backwards for a unit.
pub fn build_reading(
    unit: &Unit,
    previous: Option<&Reading>,
    t: &Telemetry,
    system: &Thresholds,
    now: OffsetDateTime,
) -> Reading {
    let thresholds = unit.thresholds(system);
    let prev_count = previous.map_or(0, |p| p.vibration_count);
    let timestamp = match previous {
        Some(p) if p.timestamp >= now => p.timestamp + Duration::milliseconds(1),
        _ => now,
    };

    Reading {
        unit_id: unit.id,
        water_level: t.water_level,
        temperature: t.temperature,
        vibration_detected: t.vibration,
        vibration_count: prev_count + u64::from(t.vibration),
        float_switches: t.float_switches.clone(),
        is_low_level: t.water_level < thresholds.low_level,
        is_high_temp: t.temperature > thresholds.high_temp,
        timestamp,
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::tests::{draft, test_db};
    use serde_json::json;

    pub(crate) struct Fixture {
        pub db: Db,
        pub cache: Arc<SnapshotCache>,
        pub broadcaster: Arc<Broadcaster>,
        pub ingestor: Ingestor,
    }

    /// One unit with `sensors` float switches and api key "key-1".
    pub(crate) async fn fixture(sensors: usize) -> Fixture {
        let db = test_db().await;
        db.insert_unit(&draft("tank-1", "key-1", sensors)).await.unwrap();
        let cache = Arc::new(SnapshotCache::warm(&db).await.unwrap());
        let broadcaster = Arc::new(Broadcaster::new(16));
        let ingestor = Ingestor::new(
            db.clone(),
            cache.clone(),
            broadcaster.clone(),
            Thresholds {
                low_level: 20.0,
                high_temp: 75.0,
            },
            Limits::default(),
        );
        Fixture {
            db,
            cache,
            broadcaster,
            ingestor,
        }
    }

    fn telemetry(level: f64, vibration: bool) -> Telemetry {
        Telemetry {
            water_level: level,
            temperature: 20.0,
            vibration,
            float_switches: vec![false],
        }
    }

    fn unit() -> Unit {
        Unit {
            id: 1,
            name: "tank".into(),
            location: "x".into(),
            unit_type: crate::model::UnitType::Tank,
            number_of_sensors: 1,
            api_key: "k".into(),
            low_level_threshold: None,
            high_temp_threshold: None,
        }
    }

    // -- build_reading ------------------------------------------------------

    #[test]
    fn vibration_count_increments_only_when_vibrating() {
        let now = now_ms_precision();
        let first = build_reading(&unit(), None, &telemetry(50.0, true), &Thresholds::default(), now);
        assert_eq!(first.vibration_count, 1);

        let second = build_reading(
            &unit(),
            Some(&first),
            &telemetry(50.0, false),
            &Thresholds::default(),
            now + Duration::seconds(1),
        );
        assert_eq!(second.vibration_count, 1);
        assert!(!second.vibration_detected);
    }

    #[test]
    fn timestamp_strictly_increases_on_clock_stall() {
        let now = now_ms_precision();
        let first = build_reading(&unit(), None, &telemetry(50.0, false), &Thresholds::default(), now);
        let second = build_reading(
            &unit(),
            Some(&first),
            &telemetry(50.0, false),
            &Thresholds::default(),
            now - Duration::seconds(2),
        );
        assert_eq!(second.timestamp, now + Duration::milliseconds(1));
    }

    #[test]
    fn unit_thresholds_override_system() {
        let mut u = unit();
        u.low_level_threshold = Some(60.0);
        let r = build_reading(&u, None, &telemetry(50.0, false), &Thresholds::default(), now_ms_precision());
        assert!(r.is_low_level);
    }

    // -- submit -------------------------------------------------------------

    #[tokio::test]
    async fn alert_scenario_sets_all_flags() {
        let f = fixture(4).await;
        let ack = f
            .ingestor
            .submit(
                Some("key-1"),
                &json!({"waterLevel": 15, "temperature": 80, "vibration": true,
                        "floatSwitches": [true, false, false, false]}),
            )
            .await
            .unwrap();
        assert!(ack.came_online);

        let state = f.cache.get(ack.unit_id).await.unwrap();
        assert!(state.is_low_level);
        assert!(state.is_high_temp);
        assert!(state.is_vibrating);
        assert_eq!(state.vibration_count, 1);
        assert_eq!(state.status, UnitStatus::Online);
        assert_eq!(state.float_switches, vec![true, false, false, false]);
    }

    #[tokio::test]
    async fn valid_reading_is_returned_verbatim() {
        let f = fixture(2).await;
        let ack = f
            .ingestor
            .submit(
                Some("key-1"),
                &json!({"waterLevel": 73.25, "temperature": 24.5, "vibration": false,
                        "floatSwitches": [true, true]}),
            )
            .await
            .unwrap();

        let state = f.cache.get(ack.unit_id).await.unwrap();
        assert_eq!(state.water_level, 73.25);
        assert_eq!(state.temperature, 24.5);
        assert!(!state.is_vibrating);
        assert_eq!(state.timestamp, Some(ack.timestamp));
        assert_eq!(state.last_seen_at, Some(ack.timestamp));

        let stored = f.db.latest_reading(ack.unit_id).await.unwrap().unwrap();
        assert_eq!(stored, ack.reading);
    }

    #[tokio::test]
    async fn unknown_key_changes_nothing() {
        let f = fixture(1).await;
        let err = f
            .ingestor
            .submit(
                Some("not-a-key"),
                &json!({"waterLevel": 50, "temperature": 20, "floatSwitches": [true]}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Auth));
        assert!(!err.to_string().contains("not-a-key"));

        let err = f.ingestor.submit(None, &json!({})).await.unwrap_err();
        assert!(matches!(err, IngestError::Auth));

        let state = f.cache.get(1).await.unwrap();
        assert_eq!(state.status, UnitStatus::Offline);
        assert!(state.timestamp.is_none());
        assert_eq!(f.db.count_readings(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sensor_count_mismatch_changes_nothing() {
        let f = fixture(4).await;
        let err = f
            .ingestor
            .submit(
                Some("key-1"),
                &json!({"waterLevel": 50, "temperature": 20, "floatSwitches": [true, false]}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));

        let state = f.cache.get(1).await.unwrap();
        assert_eq!(state.status, UnitStatus::Offline);
        assert_eq!(f.db.count_readings(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn storage_failure_leaves_snapshot_untouched() {
        let f = fixture(1).await;
        f.ingestor
            .submit(
                Some("key-1"),
                &json!({"waterLevel": 40, "temperature": 20, "floatSwitches": [true]}),
            )
            .await
            .unwrap();
        let before = f.cache.get(1).await.unwrap();

        sqlx::query("DROP TABLE readings")
            .execute(f.db.pool())
            .await
            .unwrap();

        let err = f
            .ingestor
            .submit(
                Some("key-1"),
                &json!({"waterLevel": 90, "temperature": 20, "floatSwitches": [false]}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Storage(_)));
        assert_eq!(f.cache.get(1).await.unwrap(), before);
    }

    #[tokio::test]
    async fn subscribers_get_update_after_ack() {
        let f = fixture(1).await;
        let (client, mut rx) = f.broadcaster.connect().await;
        f.broadcaster.subscribe(client, "unit-1").await;

        f.ingestor
            .submit(
                Some("key-1"),
                &json!({"waterLevel": 40, "temperature": 20, "floatSwitches": [true]}),
            )
            .await
            .unwrap();

        let status: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(status["type"], "statusChanged");
        assert_eq!(status["status"], "ONLINE");
        let update: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(update["type"], "unitUpdate");
        assert_eq!(update["reading"]["waterLevel"], 40.0);
    }

    #[tokio::test]
    async fn concurrent_submissions_for_one_unit_serialize() {
        let f = Arc::new(fixture(1).await);
        let (client, mut rx) = f.broadcaster.connect().await;
        f.broadcaster.subscribe(client, "unit-1").await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let f = f.clone();
            handles.push(tokio::spawn(async move {
                f.ingestor
                    .submit(
                        Some("key-1"),
                        &json!({"waterLevel": i * 10, "temperature": 20,
                                "vibration": true, "floatSwitches": [true]}),
                    )
                    .await
                    .unwrap()
            }));
        }
        let mut acks = Vec::new();
        for h in handles {
            acks.push(h.await.unwrap());
        }

        assert_eq!(f.db.count_readings(1).await.unwrap(), 8);
        let last = acks.iter().max_by_key(|a| a.timestamp).unwrap();
        let state = f.cache.get(1).await.unwrap();
        assert_eq!(state.timestamp, Some(last.timestamp));
        assert_eq!(state.water_level, last.reading.water_level);
        // every sample vibrated, so the serialized counter reached 8
        assert_eq!(state.vibration_count, 8);
        let stored = f.db.latest_reading(1).await.unwrap().unwrap();
        assert_eq!(stored, last.reading);

        // live updates arrive in the same order the store holds them
        let history = f
            .db
            .readings_between(
                1,
                OffsetDateTime::UNIX_EPOCH,
                last.timestamp + Duration::seconds(1),
                100,
            )
            .await
            .unwrap();
        let mut delivered = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let event: Value = serde_json::from_str(&frame).unwrap();
            if event["type"] == "unitUpdate" {
                let ts = event["reading"]["timestamp"].as_str().unwrap();
                let ts = OffsetDateTime::parse(ts, &time::format_description::well_known::Rfc3339)
                    .unwrap();
                delivered.push((ts, event["reading"]["waterLevel"].as_f64().unwrap()));
            }
        }
        let expected: Vec<_> = history.iter().map(|r| (r.timestamp, r.water_level)).collect();
        assert_eq!(delivered.len(), 8);
        assert!(delivered.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(delivered, expected);
    }

    #[tokio::test]
    async fn raw_body_is_parsed_after_credentials() {
        let f = fixture(1).await;

        let err = f.ingestor.submit_raw(Some("nope"), b"{not json").await.unwrap_err();
        assert!(matches!(err, IngestError::Auth));
        let err = f.ingestor.submit_raw(None, b"[1,2]").await.unwrap_err();
        assert!(matches!(err, IngestError::Auth));
        let err = f.ingestor.submit_raw(Some("key-1"), b"{not json").await.unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));

        let ack = f
            .ingestor
            .submit_raw(
                Some("key-1"),
                br#"{"waterLevel":55,"temperature":20,"floatSwitches":[true]}"#,
            )
            .await
            .unwrap();
        assert_eq!(ack.unit_id, 1);
        assert_eq!(f.db.count_readings(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn deleted_unit_key_is_rejected() {
        let f = fixture(1).await;
        let slot = f.cache.slot(1).await.unwrap();
        {
            let mut entry = slot.lock().await;
            f.db.delete_unit(1).await.unwrap();
            f.cache.forget(&mut entry).await;
        }
        let err = f
            .ingestor
            .submit(
                Some("key-1"),
                &json!({"waterLevel": 40, "temperature": 20, "floatSwitches": [true]}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Auth));
    }
}
