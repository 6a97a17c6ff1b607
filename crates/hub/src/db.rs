//! SQLite-backed unit registry and historical reading log.

use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::model::{
    from_unix_ms, to_unix_ms, Reading, Unit, UnitId, UnitStatus, UnitType,
};

/// Upper bound on rows returned by a single range query.
pub const MAX_RANGE_ROWS: u32 = 5000;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// Everything needed to persist a new unit.
#[derive(Debug, Clone)]
pub struct UnitDraft {
    pub name: String,
    pub location: String,
    pub unit_type: UnitType,
    pub number_of_sensors: usize,
    pub api_key: String,
    pub low_level_threshold: Option<f64>,
    pub high_temp_threshold: Option<f64>,
}

/// A unit together with its persisted presence fields.
#[derive(Debug, Clone)]
pub struct StoredUnit {
    pub unit: Unit,
    pub status: UnitStatus,
    pub last_seen_at: Option<OffsetDateTime>,
}

#[derive(sqlx::FromRow)]
struct UnitRow {
    id: i64,
    name: String,
    location: String,
    unit_type: String,
    number_of_sensors: i64,
    api_key: String,
    status: String,
    last_seen_at: Option<i64>,
    low_level_threshold: Option<f64>,
    high_temp_threshold: Option<f64>,
}

impl UnitRow {
    fn into_stored(self) -> Result<StoredUnit> {
        let unit_type = UnitType::parse(&self.unit_type)
            .ok_or_else(|| anyhow!("unit {}: unknown unit_type '{}'", self.id, self.unit_type))?;
        Ok(StoredUnit {
            unit: Unit {
                id: self.id,
                name: self.name,
                location: self.location,
                unit_type,
                number_of_sensors: self.number_of_sensors.max(0) as usize,
                api_key: self.api_key,
                low_level_threshold: self.low_level_threshold,
                high_temp_threshold: self.high_temp_threshold,
            },
            status: UnitStatus::parse(&self.status),
            last_seen_at: self.last_seen_at.map(from_unix_ms),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ReadingRow {
    unit_id: i64,
    ts: i64,
    water_level: f64,
    temperature: f64,
    vibration_detected: bool,
    vibration_count: i64,
    float_switches: String,
    is_low_level: bool,
    is_high_temp: bool,
}

impl ReadingRow {
    fn into_reading(self) -> Result<Reading> {
        let float_switches: Vec<bool> = serde_json::from_str(&self.float_switches)
            .with_context(|| format!("unit {}: corrupt float_switches column", self.unit_id))?;
        Ok(Reading {
            unit_id: self.unit_id,
            water_level: self.water_level,
            temperature: self.temperature,
            vibration_detected: self.vibration_detected,
            vibration_count: self.vibration_count.max(0) as u64,
            float_switches,
            is_low_level: self.is_low_level,
            is_high_temp: self.is_high_temp,
            timestamp: from_unix_ms(self.ts),
        })
    }
}

const UNIT_COLUMNS: &str = "id, name, location, unit_type, number_of_sensors, api_key, \
     status, last_seen_at, low_level_threshold, high_temp_threshold";

const READING_COLUMNS: &str = "unit_id, ts, water_level, temperature, vibration_detected, \
     vibration_count, float_switches, is_low_level, is_high_temp";

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/tank-hub/tank-hub.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // An in-memory database only lives as long as its connections.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ----------------------------
    // Units
    // ----------------------------

    pub async fn insert_unit(&self, d: &UnitDraft) -> Result<Unit> {
        let now = to_unix_ms(OffsetDateTime::now_utc());
        let id = sqlx::query(
            r#"
            INSERT INTO units (
              name, location, unit_type, number_of_sensors, api_key,
              status, last_seen_at, low_level_threshold, high_temp_threshold, created_at
            ) VALUES (?, ?, ?, ?, ?, 'OFFLINE', NULL, ?, ?, ?)
            "#,
        )
        .bind(&d.name)
        .bind(&d.location)
        .bind(d.unit_type.as_str())
        .bind(d.number_of_sensors as i64)
        .bind(&d.api_key)
        .bind(d.low_level_threshold)
        .bind(d.high_temp_threshold)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("insert_unit failed")?
        .last_insert_rowid();

        Ok(Unit {
            id,
            name: d.name.clone(),
            location: d.location.clone(),
            unit_type: d.unit_type,
            number_of_sensors: d.number_of_sensors,
            api_key: d.api_key.clone(),
            low_level_threshold: d.low_level_threshold,
            high_temp_threshold: d.high_temp_threshold,
        })
    }

    pub async fn load_units(&self) -> Result<Vec<StoredUnit>> {
        let rows: Vec<UnitRow> =
            sqlx::query_as(&format!("SELECT {UNIT_COLUMNS} FROM units ORDER BY id"))
                .fetch_all(&self.pool)
                .await
                .context("load_units failed")?;
        rows.into_iter().map(UnitRow::into_stored).collect()
    }

    #[cfg(test)]
    pub async fn get_unit(&self, id: UnitId) -> Result<Option<StoredUnit>> {
        let row: Option<UnitRow> =
            sqlx::query_as(&format!("SELECT {UNIT_COLUMNS} FROM units WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context("get_unit failed")?;
        row.map(UnitRow::into_stored).transpose()
    }

    pub async fn find_unit_by_name(&self, name: &str) -> Result<Option<StoredUnit>> {
        let row: Option<UnitRow> =
            sqlx::query_as(&format!("SELECT {UNIT_COLUMNS} FROM units WHERE name = ?"))
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .context("find_unit_by_name failed")?;
        row.map(UnitRow::into_stored).transpose()
    }

    /// Delete a unit and purge its readings in one transaction. Returns
    /// false when the unit did not exist.
    pub async fn delete_unit(&self, id: UnitId) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("delete_unit: begin failed")?;

        sqlx::query("DELETE FROM readings WHERE unit_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("delete_unit: purge readings failed")?;

        let deleted = sqlx::query("DELETE FROM units WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("delete_unit failed")?
            .rows_affected();

        tx.commit().await.context("delete_unit: commit failed")?;
        Ok(deleted == 1)
    }

    // ----------------------------
    // Presence
    // ----------------------------

    /// Compare-and-set ONLINE→OFFLINE: only succeeds if the unit is still
    /// ONLINE with the `last_seen_at` the caller observed.
    pub async fn mark_offline(&self, id: UnitId, seen_at: OffsetDateTime) -> Result<bool> {
        let changed = sqlx::query(
            r#"
            UPDATE units SET status = 'OFFLINE'
            WHERE id = ? AND status = 'ONLINE' AND last_seen_at = ?
            "#,
        )
        .bind(id)
        .bind(to_unix_ms(seen_at))
        .execute(&self.pool)
        .await
        .context("mark_offline failed")?
        .rows_affected();
        Ok(changed == 1)
    }

    // ----------------------------
    // Readings
    // ----------------------------

    /// Append a reading and mark its unit ONLINE as one transaction.
    pub async fn append_reading(&self, r: &Reading, seen_at: OffsetDateTime) -> Result<()> {
        let switches =
            serde_json::to_string(&r.float_switches).context("encode float_switches")?;

        let mut tx = self.pool.begin().await.context("append_reading: begin failed")?;

        sqlx::query(&format!(
            "INSERT INTO readings ({READING_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(r.unit_id)
        .bind(to_unix_ms(r.timestamp))
        .bind(r.water_level)
        .bind(r.temperature)
        .bind(r.vibration_detected)
        .bind(r.vibration_count as i64)
        .bind(switches)
        .bind(r.is_low_level)
        .bind(r.is_high_temp)
        .execute(&mut *tx)
        .await
        .context("append_reading: insert failed")?;

        let updated = sqlx::query(
            "UPDATE units SET status = 'ONLINE', last_seen_at = ? WHERE id = ?",
        )
        .bind(to_unix_ms(seen_at))
        .bind(r.unit_id)
        .execute(&mut *tx)
        .await
        .context("append_reading: status update failed")?
        .rows_affected();

        if updated != 1 {
            // Dropping the transaction rolls the insert back.
            return Err(anyhow!("append_reading: unit {} no longer exists", r.unit_id));
        }

        tx.commit().await.context("append_reading: commit failed")?;
        Ok(())
    }

    pub async fn latest_reading(&self, unit_id: UnitId) -> Result<Option<Reading>> {
        let row: Option<ReadingRow> = sqlx::query_as(&format!(
            "SELECT {READING_COLUMNS} FROM readings WHERE unit_id = ? ORDER BY ts DESC LIMIT 1"
        ))
        .bind(unit_id)
        .fetch_optional(&self.pool)
        .await
        .context("latest_reading failed")?;
        row.map(ReadingRow::into_reading).transpose()
    }

    /// Readings with `from <= ts < to`, oldest first.
    pub async fn readings_between(
        &self,
        unit_id: UnitId,
        from: OffsetDateTime,
        to: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<Reading>> {
        let rows: Vec<ReadingRow> = sqlx::query_as(&format!(
            r#"
            SELECT {READING_COLUMNS} FROM readings
            WHERE unit_id = ? AND ts >= ? AND ts < ?
            ORDER BY ts ASC
            LIMIT ?
            "#
        ))
        .bind(unit_id)
        .bind(to_unix_ms(from))
        .bind(to_unix_ms(to))
        .bind(limit.min(MAX_RANGE_ROWS) as i64)
        .fetch_all(&self.pool)
        .await
        .context("readings_between failed")?;
        rows.into_iter().map(ReadingRow::into_reading).collect()
    }

    #[cfg(test)]
    pub async fn count_readings(&self, unit_id: UnitId) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM readings WHERE unit_id = ?")
            .bind(unit_id)
            .fetch_one(&self.pool)
            .await
            .context("count_readings failed")?;
        Ok(n)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
