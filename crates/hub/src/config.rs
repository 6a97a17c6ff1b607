//! TOML config file loading, validation, env overrides, and seeding of
//! pre-provisioned units.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::db::Db;
use crate::model::{NewUnit, Thresholds, UnitType, MAX_SENSORS};
use crate::payload::Limits;
use crate::provision::Provisioner;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub web: WebSettings,
    pub presence: PresenceSettings,
    pub thresholds: Thresholds,
    pub limits: Limits,
    pub broadcast: BroadcastSettings,
    pub mqtt: MqttSettings,
    pub units: Vec<SeedUnit>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSettings {
    pub port: u16,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self { port: 3000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PresenceSettings {
    pub sweep_interval_sec: u64,
    pub offline_timeout_sec: u64,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            sweep_interval_sec: 30,
            offline_timeout_sec: 120,
        }
    }
}

impl PresenceSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_sec)
    }

    pub fn offline_timeout(&self) -> Duration {
        Duration::from_secs(self.offline_timeout_sec)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastSettings {
    /// Per-client outbound queue depth.
    pub subscriber_buffer: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            subscriber_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "tank-hub".to_string(),
        }
    }
}

/// A unit provisioned from the config file with a fixed api key.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedUnit {
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(rename = "type")]
    pub unit_type: String,
    #[serde(default = "default_seed_sensors")]
    pub number_of_sensors: i64,
    pub api_key: String,
    #[serde(default)]
    pub low_level_threshold: Option<f64>,
    #[serde(default)]
    pub high_temp_threshold: Option<f64>,
}

fn default_seed_sensors() -> i64 {
    4
}

impl SeedUnit {
    fn to_request(&self) -> NewUnit {
        NewUnit {
            name: self.name.clone(),
            location: self.location.clone(),
            unit_type: self.unit_type.clone(),
            number_of_sensors: self.number_of_sensors,
            low_level_threshold: self.low_level_threshold,
            high_temp_threshold: self.high_temp_threshold,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all settings. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_settings(&mut errors);
        self.validate_units(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_settings(&self, errors: &mut Vec<String>) {
        // ── Presence ────────────────────────────────────────
        let p = &self.presence;
        if p.sweep_interval_sec == 0 {
            errors.push("presence: sweep_interval_sec must be positive".into());
        }
        if p.offline_timeout_sec == 0 {
            errors.push("presence: offline_timeout_sec must be positive".into());
        }
        if p.offline_timeout_sec > 0 && p.offline_timeout_sec < p.sweep_interval_sec {
            errors.push(format!(
                "presence: offline_timeout_sec ({}) is shorter than sweep_interval_sec ({})",
                p.offline_timeout_sec, p.sweep_interval_sec
            ));
        }

        // ── Thresholds ──────────────────────────────────────
        let t = &self.thresholds;
        if !(0.0..=100.0).contains(&t.low_level) {
            errors.push(format!(
                "thresholds: low_level {} out of range [0, 100]",
                t.low_level
            ));
        }
        if !t.high_temp.is_finite() {
            errors.push("thresholds: high_temp must be a finite number".into());
        }

        // ── Limits ──────────────────────────────────────────
        let l = &self.limits;
        if l.water_level_min >= l.water_level_max {
            errors.push(format!(
                "limits: water_level_min ({}) must be below water_level_max ({})",
                l.water_level_min, l.water_level_max
            ));
        }
        if l.temperature_min >= l.temperature_max {
            errors.push(format!(
                "limits: temperature_min ({}) must be below temperature_max ({})",
                l.temperature_min, l.temperature_max
            ));
        }

        // ── Broadcast / transports ──────────────────────────
        if self.broadcast.subscriber_buffer == 0 {
            errors.push("broadcast: subscriber_buffer must be positive".into());
        }
        if self.web.port == 0 {
            errors.push("web: port must be non-zero".into());
        }
        if self.mqtt.enabled {
            if self.mqtt.host.trim().is_empty() {
                errors.push("mqtt: host is empty".into());
            }
            if self.mqtt.port == 0 {
                errors.push("mqtt: port must be non-zero".into());
            }
            if self.mqtt.client_id.trim().is_empty() {
                errors.push("mqtt: client_id is empty".into());
            }
        }
    }

    fn validate_units(&self, errors: &mut Vec<String>) {
        let mut seen_names: HashSet<&str> = HashSet::new();
        let mut seen_keys: HashSet<&str> = HashSet::new();

        for (i, u) in self.units.iter().enumerate() {
            let ctx = || {
                if u.name.trim().is_empty() {
                    format!("units[{i}]")
                } else {
                    format!("unit '{}'", u.name)
                }
            };

            // ── Identity ────────────────────────────────────────
            if u.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen_names.insert(u.name.trim()) {
                errors.push(format!("{}: duplicate name", ctx()));
            }

            if u.api_key.trim().is_empty() {
                errors.push(format!("{}: api_key is empty", ctx()));
            } else if !seen_keys.insert(u.api_key.trim()) {
                errors.push(format!("{}: api_key is already used by another unit", ctx()));
            }

            // ── Shape ───────────────────────────────────────────
            if UnitType::parse(&u.unit_type).is_none() {
                errors.push(format!(
                    "{}: type '{}' is not TANK or CISTERN",
                    ctx(),
                    u.unit_type
                ));
            }
            if u.number_of_sensors < 1 || u.number_of_sensors > MAX_SENSORS as i64 {
                errors.push(format!(
                    "{}: number_of_sensors {} out of range [1, {MAX_SENSORS}]",
                    ctx(),
                    u.number_of_sensors
                ));
            }
            if let Some(low) = u.low_level_threshold {
                if !(0.0..=100.0).contains(&low) {
                    errors.push(format!(
                        "{}: low_level_threshold {low} out of range [0, 100]",
                        ctx()
                    ));
                }
            }
        }
    }

    /// Override file settings from the environment (`WEB_PORT`, `MQTT_HOST`,
    /// `MQTT_PORT`). Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("WEB_PORT") {
            match v.parse() {
                Ok(port) => self.web.port = port,
                Err(_) => warn!(value = %v, "ignoring invalid WEB_PORT"),
            }
        }
        if let Some(v) = var("MQTT_HOST") {
            self.mqtt.host = v;
        }
        if let Some(v) = var("MQTT_PORT") {
            match v.parse() {
                Ok(port) => self.mqtt.port = port,
                Err(_) => warn!(value = %v, "ignoring invalid MQTT_PORT"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file, then apply env overrides.
/// A missing file yields the built-in defaults.
pub fn load(path: &str) -> Result<Config> {
    load_with(path, |k| std::env::var(k).ok())
}

/// [`load`] with the environment supplied by the caller.
pub fn load_with(path: &str, var: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        warn!(path, "config file not found, using defaults");
        Config::default()
    };
    config.apply_env(var);
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Provision every `[[units]]` entry not already in the store. Existing
/// units keep their stored definition and api key.
pub async fn apply(config: &Config, db: &Db, provisioner: &Provisioner) -> Result<()> {
    let mut created = 0usize;
    for seed in &config.units {
        let name = seed.name.trim();
        let existing = db
            .find_unit_by_name(name)
            .await
            .with_context(|| format!("failed to look up unit '{name}'"))?;
        if existing.is_some() {
            continue;
        }
        provisioner
            .create_with_key(&seed.to_request(), seed.api_key.trim().to_string())
            .await
            .with_context(|| format!("failed to provision unit '{name}'"))?;
        created += 1;
    }

    info!(
        configured = config.units.len(),
        created = created,
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
