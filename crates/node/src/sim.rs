//! Stateful water tank simulator for local development.
//!
//! Models a tank site the way the hub sees it:
//! - Water level drawn down by consumption, refilled by a pump with hysteresis
//! - Level sensor noise on top of the true level
//! - Diurnal temperature cycle with sensor noise
//! - Vibration while the pump runs, plus occasional stray knocks
//! - Float switches mounted at evenly spaced heights

use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Steady consumption, pump refills between 30% and 95%. Mild weather.
    Normal,
    /// Pump is broken: the tank drains and stays empty. Exercises the
    /// low-level alert.
    Draining,
    /// Rooftop tank in the sun, temperature sits above 75.
    Hot,
    /// Worn pump mount: frequent vibration even while idle.
    Shaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "draining" => Self::Draining,
            "hot" => Self::Hot,
            "shaky" => Self::Shaky,
            _ => Self::Normal,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Draining => write!(f, "draining"),
            Self::Hot => write!(f, "hot"),
            Self::Shaky => write!(f, "shaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Sample
// ---------------------------------------------------------------------------

/// One telemetry sample, in the units the hub expects.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Percent full, 0..=100.
    pub water_level: f64,
    /// Degrees Celsius.
    pub temperature: f64,
    pub vibration: bool,
    /// One entry per float switch, lowest first. `true` means submerged.
    pub float_switches: Vec<bool>,
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

pub struct TankSim {
    /// True level in percent.
    level: f64,
    pump_on: bool,
    pump_works: bool,
    refill_at: f64,
    refill_to: f64,

    consumption: f64,
    consumption_sigma: f64,
    pump_rate: f64,
    level_noise: f64,

    temp_base: f64,
    temp_amplitude: f64,
    temp_noise: f64,
    diurnal_period_s: f64,

    knock_prob: f32,

    /// Switch mounting heights in percent.
    switch_heights: Vec<f64>,
}

impl TankSim {
    /// `diurnal_period_s` controls the day/night cycle length. Use 600
    /// (10 min) for fast dev iteration or 86400 for real-time.
    pub fn new(scenario: Scenario, switch_count: usize, diurnal_period_s: f64) -> Self {
        let (start, pump_works, consumption, temp_base, knock_prob) = match scenario {
            Scenario::Normal => (70.0, true, 1.5, 24.0, 0.02_f32),
            Scenario::Draining => (40.0, false, 2.5, 24.0, 0.02),
            Scenario::Hot => (70.0, true, 1.5, 79.0, 0.02),
            Scenario::Shaky => (70.0, true, 1.5, 24.0, 0.35),
        };

        let switch_heights = (0..switch_count)
            .map(|i| (i as f64 + 1.0) * 100.0 / (switch_count as f64 + 1.0))
            .collect();

        Self {
            level: start,
            pump_on: false,
            pump_works,
            refill_at: 30.0,
            refill_to: 95.0,
            consumption,
            consumption_sigma: 0.5,
            pump_rate: 6.0,
            level_noise: 0.4,
            temp_base,
            temp_amplitude: 4.0,
            temp_noise: 0.3,
            diurnal_period_s,
            knock_prob,
            switch_heights,
        }
    }

    /// Advance one sampling tick and return what the sensors report.
    pub fn sample(&mut self) -> Sample {
        // -- Pump hysteresis ----------------------------------------------
        if self.pump_works {
            if self.level <= self.refill_at {
                self.pump_on = true;
            } else if self.level >= self.refill_to {
                self.pump_on = false;
            }
        }

        // -- Evolve the true level ------------------------------------------
        let draw = gaussian(self.consumption, self.consumption_sigma).max(0.0);
        let fill = if self.pump_on { self.pump_rate } else { 0.0 };
        self.level = (self.level - draw + fill).clamp(0.0, 100.0);

        // -- Instantaneous readings -----------------------------------------
        let water_level = (self.level + gaussian(0.0, self.level_noise)).clamp(0.0, 100.0);
        let water_level = (water_level * 10.0).round() / 10.0;

        let now_s = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let phase = 2.0 * std::f64::consts::PI * now_s / self.diurnal_period_s;
        let temperature =
            self.temp_base + self.temp_amplitude * phase.sin() + gaussian(0.0, self.temp_noise);
        let temperature = (temperature * 10.0).round() / 10.0;

        let vibration = self.pump_on || fastrand::f32() < self.knock_prob;

        // Switches follow the true level; they do not see sensor noise.
        let float_switches = self
            .switch_heights
            .iter()
            .map(|h| self.level >= *h)
            .collect();

        Sample {
            water_level,
            temperature,
            vibration,
            float_switches,
        }
    }

    pub fn switch_count(&self) -> usize {
        self.switch_heights.len()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn run(sim: &mut TankSim, n: usize) -> Vec<Sample> {
        (0..n).map(|_| sim.sample()).collect()
    }

    #[test]
    fn readings_within_physical_range() {
        let mut sim = TankSim::new(Scenario::Normal, 4, 600.0);
        for s in run(&mut sim, 500) {
            assert!((0.0..=100.0).contains(&s.water_level), "level {}", s.water_level);
            assert!((-40.0..=125.0).contains(&s.temperature), "temp {}", s.temperature);
            assert_eq!(s.float_switches.len(), 4);
        }
    }

    #[test]
    fn float_switches_fill_from_the_bottom() {
        let mut sim = TankSim::new(Scenario::Normal, 4, 600.0);
        for s in run(&mut sim, 300) {
            // once a switch is dry, every switch above it is dry too
            let first_dry = s.float_switches.iter().position(|on| !on);
            if let Some(i) = first_dry {
                assert!(s.float_switches[i..].iter().all(|on| !on), "{:?}", s.float_switches);
            }
        }
    }

    #[test]
    fn pump_keeps_normal_tank_from_emptying() {
        let mut sim = TankSim::new(Scenario::Normal, 2, 600.0);
        let samples = run(&mut sim, 400);
        let min = samples.iter().map(|s| s.water_level).fold(f64::MAX, f64::min);
        assert!(min > 15.0, "tank ran dry: min={min:.1}");
        assert!(samples.iter().any(|s| s.vibration), "pump never ran");
    }

    #[test]
    fn draining_tank_runs_low() {
        let mut sim = TankSim::new(Scenario::Draining, 4, 600.0);
        let last = run(&mut sim, 100).pop().unwrap();
        assert!(last.water_level < 20.0, "level={:.1}", last.water_level);
        assert!(last.float_switches.iter().all(|on| !on));
    }

    #[test]
    fn hot_scenario_runs_above_normal() {
        let avg = |scenario| {
            let mut sim = TankSim::new(scenario, 1, 600.0);
            run(&mut sim, 100).iter().map(|s| s.temperature).sum::<f64>() / 100.0
        };
        let hot = avg(Scenario::Hot);
        let normal = avg(Scenario::Normal);
        assert!(hot > 70.0, "hot avg={hot:.1}");
        assert!(hot > normal + 40.0);
    }

    #[test]
    fn shaky_scenario_vibrates_more() {
        let count = |scenario| {
            let mut sim = TankSim::new(scenario, 1, 600.0);
            run(&mut sim, 300).iter().filter(|s| s.vibration).count()
        };
        assert!(count(Scenario::Shaky) > count(Scenario::Draining));
    }

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("normal"), Scenario::Normal);
        assert_eq!(Scenario::from_str_lossy("DRAINING"), Scenario::Draining);
        assert_eq!(Scenario::from_str_lossy("Hot"), Scenario::Hot);
        assert_eq!(Scenario::from_str_lossy("shaky"), Scenario::Shaky);
        assert_eq!(Scenario::from_str_lossy("unknown"), Scenario::Normal);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Normal);
    }

    #[test]
    fn scenario_display() {
        assert_eq!(Scenario::Normal.to_string(), "normal");
        assert_eq!(Scenario::Draining.to_string(), "draining");
        assert_eq!(Scenario::Hot.to_string(), "hot");
        assert_eq!(Scenario::Shaky.to_string(), "shaky");
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let n = 5000;
        let sum: f64 = (0..n).map(|_| approx_std_normal()).sum();
        let mean = sum / n as f64;
        assert!(
            mean.abs() < 0.15,
            "approx_std_normal mean should be near zero: {mean}"
        );
    }
}
