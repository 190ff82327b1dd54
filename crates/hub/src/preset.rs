//! Device configuration presets: named bundles of thresholds and schedules
//! for the pump, fan and cover.
//!
//! Schedule times stay as the operator typed them (`"05:00"`). They are parsed
//! at evaluation time so that one malformed entry only disables itself.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::device::CoverPosition;

// ---------------------------------------------------------------------------
// Preset structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub pump: PumpSettings,
    pub fan: FanSettings,
    pub cover: CoverSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpSettings {
    /// Soil moisture (%) below which the pump is wanted, checked only inside
    /// `check_intervals`.
    pub soil_moisture_threshold: f64,
    #[serde(default)]
    pub schedules: Vec<PumpSchedule>,
    #[serde(default)]
    pub check_intervals: Vec<CheckInterval>,
}

/// A window during which soil moisture is checked every `interval` minutes,
/// counted from `start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckInterval {
    pub start: String,
    pub end: String,
    pub interval: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpSchedule {
    /// `HH:MM`, local time.
    pub time: String,
    /// Run time in minutes.
    pub duration: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanSettings {
    pub temp_threshold: f64,
    pub humidity_threshold: f64,
    /// Run time in minutes once triggered.
    pub duration: u32,
    /// Minutes between threshold checks.
    pub check_interval: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverSettings {
    pub temp_threshold: f64,
    #[serde(default)]
    pub schedules: Vec<CoverSchedule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverSchedule {
    pub start: String,
    pub end: String,
    pub position: CoverPosition,
}

// ---------------------------------------------------------------------------
// Time parsing
// ---------------------------------------------------------------------------

/// Parse `HH:MM` (or `H:MM`) into minutes since midnight.
pub fn parse_hhmm(s: &str) -> Option<u16> {
    let (h, m) = s.trim().split_once(':')?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return None;
    }
    if !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }
    let h: u16 = h.parse().ok()?;
    let m: u16 = m.parse().ok()?;
    (h < 24 && m < 60).then_some(h * 60 + m)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

const PERCENT: std::ops::RangeInclusive<f64> = 0.0..=100.0;
const CELSIUS: std::ops::RangeInclusive<f64> = -40.0..=80.0;

/// Longest run any reversal timer may be asked for.
const MAX_RUN_MIN: u32 = 24 * 60;

impl DeviceConfig {
    /// Every problem with this preset, prefixed with the preset name.
    pub fn problems(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let ctx = if self.name.trim().is_empty() {
            "preset <unnamed>".to_string()
        } else {
            format!("preset '{}'", self.name)
        };

        if self.name.trim().is_empty() {
            errors.push(format!("{ctx}: name is empty"));
        }

        // ── Pump ────────────────────────────────────────────
        if !PERCENT.contains(&self.pump.soil_moisture_threshold) {
            errors.push(format!(
                "{ctx}: pump.soil_moisture_threshold {} out of range [0, 100]",
                self.pump.soil_moisture_threshold
            ));
        }
        let mut seen_times = HashSet::new();
        for (i, s) in self.pump.schedules.iter().enumerate() {
            match parse_hhmm(&s.time) {
                None => errors.push(format!(
                    "{ctx}: pump.schedules[{i}].time '{}' is not HH:MM",
                    s.time
                )),
                Some(m) if !seen_times.insert(m) => errors.push(format!(
                    "{ctx}: pump.schedules[{i}].time '{}' is listed twice",
                    s.time
                )),
                Some(_) => {}
            }
            if s.duration == 0 || s.duration > MAX_RUN_MIN {
                errors.push(format!(
                    "{ctx}: pump.schedules[{i}].duration must be 1-{MAX_RUN_MIN} minutes, got {}",
                    s.duration
                ));
            }
        }

        for (i, c) in self.pump.check_intervals.iter().enumerate() {
            let start = parse_hhmm(&c.start);
            let end = parse_hhmm(&c.end);
            for (field, value, parsed) in [("start", &c.start, start), ("end", &c.end, end)] {
                if parsed.is_none() {
                    errors.push(format!(
                        "{ctx}: pump.check_intervals[{i}].{field} '{value}' is not HH:MM"
                    ));
                }
            }
            if start.is_some() && start == end {
                errors.push(format!(
                    "{ctx}: pump.check_intervals[{i}] starts and ends at {}",
                    c.start
                ));
            }
            if c.interval == 0 || c.interval > MAX_RUN_MIN {
                errors.push(format!(
                    "{ctx}: pump.check_intervals[{i}].interval must be 1-{MAX_RUN_MIN} minutes, got {}",
                    c.interval
                ));
            }
        }

        // ── Fan ─────────────────────────────────────────────
        if !CELSIUS.contains(&self.fan.temp_threshold) {
            errors.push(format!(
                "{ctx}: fan.temp_threshold {} out of range [-40, 80]",
                self.fan.temp_threshold
            ));
        }
        if !PERCENT.contains(&self.fan.humidity_threshold) {
            errors.push(format!(
                "{ctx}: fan.humidity_threshold {} out of range [0, 100]",
                self.fan.humidity_threshold
            ));
        }
        if self.fan.duration == 0 || self.fan.duration > MAX_RUN_MIN {
            errors.push(format!(
                "{ctx}: fan.duration must be 1-{MAX_RUN_MIN} minutes, got {}",
                self.fan.duration
            ));
        }
        if self.fan.check_interval == 0 || self.fan.check_interval > MAX_RUN_MIN {
            errors.push(format!(
                "{ctx}: fan.check_interval must be 1-{MAX_RUN_MIN} minutes, got {}",
                self.fan.check_interval
            ));
        }

        // ── Cover ───────────────────────────────────────────
        if !CELSIUS.contains(&self.cover.temp_threshold) {
            errors.push(format!(
                "{ctx}: cover.temp_threshold {} out of range [-40, 80]",
                self.cover.temp_threshold
            ));
        }
        for (i, s) in self.cover.schedules.iter().enumerate() {
            let start = parse_hhmm(&s.start);
            let end = parse_hhmm(&s.end);
            if start.is_none() {
                errors.push(format!(
                    "{ctx}: cover.schedules[{i}].start '{}' is not HH:MM",
                    s.start
                ));
            }
            if end.is_none() {
                errors.push(format!(
                    "{ctx}: cover.schedules[{i}].end '{}' is not HH:MM",
                    s.end
                ));
            }
            if start.is_some() && start == end {
                errors.push(format!(
                    "{ctx}: cover.schedules[{i}] starts and ends at {}",
                    s.start
                ));
            }
        }

        errors
    }
}

// ===========================================================================
// Tests
// ===========================================================================
