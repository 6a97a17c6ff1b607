//! Schema-validation boundary between loosely-typed device JSON and the
//! typed telemetry the ingestion core works with.

use serde::Deserialize;
use serde_json::Value;

use crate::error::IngestError;

// ---------------------------------------------------------------------------
// Range limits
// ---------------------------------------------------------------------------

/// What to do with a waterLevel/temperature outside the configured range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangePolicy {
    #[default]
    Reject,
    Clamp,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub water_level_min: f64,
    pub water_level_max: f64,
    pub temperature_min: f64,
    pub temperature_max: f64,
    pub out_of_range: RangePolicy,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            water_level_min: 0.0,
            water_level_max: 100.0,
            temperature_min: -40.0,
            temperature_max: 125.0,
            out_of_range: RangePolicy::Reject,
        }
    }
}

// ---------------------------------------------------------------------------
// Typed telemetry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    pub water_level: f64,
    pub temperature: f64,
    pub vibration: bool,
    pub float_switches: Vec<bool>,
}

/// Parse a raw request body. Anything that is not a JSON object is a
/// validation failure.
pub fn parse_body(body: &[u8]) -> Result<Value, IngestError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| IngestError::Validation(format!("body is not valid JSON: {e}")))?;
    if !value.is_object() {
        return Err(IngestError::Validation("body must be a JSON object".into()));
    }
    Ok(value)
}

/// Convert an untyped payload into [`Telemetry`] for a unit with
/// `number_of_sensors` float switches.
pub fn validate(
    payload: &Value,
    number_of_sensors: usize,
    limits: &Limits,
) -> Result<Telemetry, IngestError> {
    let obj = payload
        .as_object()
        .ok_or_else(|| IngestError::Validation("payload must be a JSON object".into()))?;

    let water_level = number_field(obj.get("waterLevel"), "waterLevel")?;
    let temperature = number_field(obj.get("temperature"), "temperature")?;

    let water_level = apply_range(
        "waterLevel",
        water_level,
        limits.water_level_min,
        limits.water_level_max,
        limits.out_of_range,
    )?;
    let temperature = apply_range(
        "temperature",
        temperature,
        limits.temperature_min,
        limits.temperature_max,
        limits.out_of_range,
    )?;

    let vibration = match obj.get("vibration") {
        None | Some(Value::Null) => false,
        Some(v) => switch_state(v)
            .ok_or_else(|| IngestError::Validation("vibration must be a boolean".into()))?,
    };

    let switches = obj
        .get("floatSwitches")
        .or_else(|| obj.get("boias"))
        .ok_or_else(|| IngestError::Validation("floatSwitches is required".into()))?;
    let switches = switches
        .as_array()
        .ok_or_else(|| IngestError::Validation("floatSwitches must be an array".into()))?;

    if switches.len() != number_of_sensors {
        return Err(IngestError::Validation(format!(
            "floatSwitches has {} entr{}, unit has {number_of_sensors} sensor{}",
            switches.len(),
            if switches.len() == 1 { "y" } else { "ies" },
            if number_of_sensors == 1 { "" } else { "s" },
        )));
    }

    let float_switches = switches
        .iter()
        .enumerate()
        .map(|(i, v)| {
            switch_state(v).ok_or_else(|| {
                IngestError::Validation(format!("floatSwitches[{i}] is not a switch state"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Telemetry {
        water_level,
        temperature,
        vibration,
        float_switches,
    })
}

fn number_field(v: Option<&Value>, name: &str) -> Result<f64, IngestError> {
    match v {
        None | Some(Value::Null) => Err(IngestError::Validation(format!("{name} is required"))),
        Some(Value::Number(n)) => n
            .as_f64()
            .filter(|f| f.is_finite())
            .ok_or_else(|| IngestError::Validation(format!("{name} is not a finite number"))),
        Some(_) => Err(IngestError::Validation(format!("{name} must be a number"))),
    }
}

fn apply_range(
    name: &str,
    value: f64,
    min: f64,
    max: f64,
    policy: RangePolicy,
) -> Result<f64, IngestError> {
    if (min..=max).contains(&value) {
        return Ok(value);
    }
    match policy {
        RangePolicy::Clamp => Ok(value.clamp(min, max)),
        RangePolicy::Reject => Err(IngestError::Validation(format!(
            "{name} {value} outside [{min}, {max}]"
        ))),
    }
}

/// Float switches and the vibration flag arrive as booleans from newer
/// firmware, 0/1 or "on"/"off" from older boards.
fn switch_state(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "high" | "1" => Some(true),
            "off" | "false" | "low" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
