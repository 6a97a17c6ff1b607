//! Unit provisioning: create units with fresh api keys, delete them with
//! their history.

use rand::Rng;
use std::sync::Arc;
use tracing::{info, warn};

use crate::broadcast::{Broadcaster, LiveEvent};
use crate::cache::{SnapshotCache, UnitEntry};
use crate::db::{Db, UnitDraft};
use crate::error::ProvisionError;
use crate::model::{NewUnit, Unit, UnitId, UnitStatus, UnitType, MAX_SENSORS, UNITS_TOPIC};

const API_KEY_BYTES: usize = 32;

/// 64 hex characters from the thread-local CSPRNG.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; API_KEY_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Check a provisioning request and turn it into a storable draft.
pub fn draft(req: &NewUnit, api_key: String) -> Result<UnitDraft, ProvisionError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ProvisionError::Invalid("name is required".into()));
    }
    let unit_type = UnitType::parse(&req.unit_type).ok_or_else(|| {
        ProvisionError::Invalid(format!(
            "type must be TANK or CISTERN, got '{}'",
            req.unit_type
        ))
    })?;
    if req.number_of_sensors < 1 || req.number_of_sensors > MAX_SENSORS as i64 {
        return Err(ProvisionError::Invalid(format!(
            "numberOfSensors must be between 1 and {MAX_SENSORS}, got {}",
            req.number_of_sensors
        )));
    }
    if let Some(low) = req.low_level_threshold {
        if !(0.0..=100.0).contains(&low) {
            return Err(ProvisionError::Invalid(format!(
                "lowLevelThreshold must be within [0, 100], got {low}"
            )));
        }
    }
    if let Some(high) = req.high_temp_threshold {
        if !high.is_finite() {
            return Err(ProvisionError::Invalid(
                "highTempThreshold must be a finite number".into(),
            ));
        }
    }
    if api_key.trim().is_empty() {
        return Err(ProvisionError::Invalid("api key must not be empty".into()));
    }

    Ok(UnitDraft {
        name: name.to_string(),
        location: req.location.trim().to_string(),
        unit_type,
        number_of_sensors: req.number_of_sensors as usize,
        api_key,
        low_level_threshold: req.low_level_threshold,
        high_temp_threshold: req.high_temp_threshold,
    })
}

fn is_unique_violation(e: &anyhow::Error) -> bool {
    e.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .is_some_and(|d| d.is_unique_violation())
}

pub struct Provisioner {
    db: Db,
    cache: Arc<SnapshotCache>,
    broadcaster: Arc<Broadcaster>,
}

impl Provisioner {
    pub fn new(db: Db, cache: Arc<SnapshotCache>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            db,
            cache,
            broadcaster,
        }
    }

    /// Create a unit with a freshly generated api key. The key is returned
    /// here and nowhere else.
    pub async fn create(&self, req: NewUnit) -> Result<(Unit, String), ProvisionError> {
        let key = generate_api_key();
        let unit = self.create_with_key(&req, key.clone()).await?;
        Ok((unit, key))
    }

    /// Create a unit that authenticates with `api_key`.
    pub async fn create_with_key(
        &self,
        req: &NewUnit,
        api_key: String,
    ) -> Result<Unit, ProvisionError> {
        let draft = draft(req, api_key)?;

        let existing = self
            .db
            .find_unit_by_name(&draft.name)
            .await
            .map_err(ProvisionError::Storage)?;
        if existing.is_some() {
            return Err(ProvisionError::Conflict(format!(
                "a unit named '{}' already exists",
                draft.name
            )));
        }

        let unit = self.db.insert_unit(&draft).await.map_err(|e| {
            if is_unique_violation(&e) {
                ProvisionError::Conflict(format!(
                    "unit '{}' conflicts with an existing unit",
                    draft.name
                ))
            } else {
                ProvisionError::Storage(e)
            }
        })?;

        self.cache
            .insert(UnitEntry::new(unit.clone(), UnitStatus::Offline, None, None))
            .await;
        info!(
            unit_id = unit.id,
            unit = %unit.name,
            r#type = unit.unit_type.as_str(),
            sensors = unit.number_of_sensors,
            "unit created"
        );

        self.broadcaster
            .publish(UNITS_TOPIC, &LiveEvent::UnitCreated { unit: unit.clone() })
            .await;
        Ok(unit)
    }

    /// Delete a unit and its readings. In-flight submissions for the unit
    /// fail authentication once this returns.
    pub async fn delete(&self, id: UnitId) -> Result<Unit, ProvisionError> {
        let Some(slot) = self.cache.slot(id).await else {
            return Err(ProvisionError::NotFound(id));
        };
        let mut entry = slot.lock().await;
        if entry.is_removed() {
            return Err(ProvisionError::NotFound(id));
        }

        let deleted = self
            .db
            .delete_unit(id)
            .await
            .map_err(ProvisionError::Storage)?;
        if !deleted {
            warn!(unit_id = id, "delete: unit was cached but missing from store");
        }

        self.cache.forget(&mut entry).await;
        let unit = entry.unit.clone();
        drop(entry);

        info!(unit_id = id, unit = %unit.name, "unit deleted");
        let event = LiveEvent::UnitDeleted { unit_id: id };
        self.broadcaster.publish(&unit.topic(), &event).await;
        self.broadcaster.publish(UNITS_TOPIC, &event).await;
        Ok(unit)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
