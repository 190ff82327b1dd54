//! Pure schedule and threshold evaluation.
//!
//! Given the active preset, the current local time and the last-known sensor
//! and device state, decide which actions should be attempted this minute.
//! Nothing here touches the network or the store. The one piece of memory
//! between ticks, whether the cover is in its over-temperature override, is
//! passed in and handed back by the caller.

use serde::Serialize;
use time::OffsetDateTime;
use tracing::warn;

use crate::clock::{hhmm, minute_of_day};
use crate::device::{Action, CoverPosition, Device};
use crate::preset::{
    parse_hhmm, CheckInterval, CoverSchedule, CoverSettings, DeviceConfig, FanSettings, PumpSettings,
};
use crate::state::{DeviceStatus, SensorSnapshot};

// ---------------------------------------------------------------------------
// Candidate actions
// ---------------------------------------------------------------------------

/// Why a candidate was produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    PumpSchedule { time: String },
    SoilMoisture { moisture: f64, window_start: String },
    CoverWindow { start: String, end: String },
    CoverOverheat { temperature: f64 },
    CoverCooled,
    FanThreshold { temperature: Option<f64>, humidity: Option<f64> },
    FanClear,
    Reversal,
    Manual,
}

/// An action the evaluator (or an operator) would like executed, plus the
/// reversal to arm once it succeeds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub action: Action,
    pub revert_after_min: Option<u32>,
    pub trigger: Trigger,
}

impl Candidate {
    pub fn manual(action: Action) -> Self {
        Self {
            action,
            revert_after_min: None,
            trigger: Trigger::Manual,
        }
    }

    /// The follow-up that switches `device` back off.
    pub fn reversal(device: Device) -> Option<Self> {
        Action::switch_off(device).map(|action| Self {
            action,
            revert_after_min: None,
            trigger: Trigger::Reversal,
        })
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Evaluate every device for the minute containing `now`. The fan is only
/// considered on its check-interval boundary, soil moisture only on the
/// boundaries of its check intervals.
///
/// `cover_was_hot` is the override state after the previous tick; the new
/// state is `cover_overheated(&config.cover, sensors, cover_was_hot)`.
pub fn evaluate(
    now: OffsetDateTime,
    config: &DeviceConfig,
    sensors: &SensorSnapshot,
    devices: &DeviceStatus,
    cover_was_hot: bool,
) -> Vec<Candidate> {
    let minute = minute_of_day(now);

    let mut out = pump_candidates(minute, &config.pump);
    if out.is_empty() {
        out.extend(moisture_candidate(minute, &config.pump, sensors, devices));
    }
    out.extend(cover_with_override(minute, &config.cover, sensors, cover_was_hot));
    if fan_gate_open(minute, config.fan.check_interval) {
        out.extend(fan_candidate(&config.fan, sensors, devices));
    }
    out
}

// ---------------------------------------------------------------------------
// Pump
// ---------------------------------------------------------------------------

fn pump_candidates(minute: u16, pump: &PumpSettings) -> Vec<Candidate> {
    let mut out = Vec::new();
    for s in &pump.schedules {
        let Some(at) = parse_hhmm(&s.time) else {
            warn!(time = %s.time, "pump schedule skipped: time is not HH:MM");
            continue;
        };
        if s.duration == 0 {
            warn!(time = %s.time, "pump schedule skipped: zero duration");
            continue;
        }
        if at == minute {
            out.push(Candidate {
                action: Action::Pump { on: true },
                revert_after_min: Some(s.duration),
                trigger: Trigger::PumpSchedule {
                    time: hhmm(at),
                },
            });
        }
    }
    out
}

/// Run time for a moisture-triggered watering: the first schedule's duration.
const DEFAULT_MOISTURE_RUN_MIN: u32 = 5;

/// Whether `minute` falls on a check inside `ci`: within the window and a
/// whole number of intervals after its start.
pub fn check_interval_due(minute: u16, ci: &CheckInterval) -> bool {
    let (Some(start), Some(end)) = (parse_hhmm(&ci.start), parse_hhmm(&ci.end)) else {
        warn!(start = %ci.start, end = %ci.end, "moisture check skipped: bad window");
        return false;
    };
    if ci.interval == 0 {
        warn!(start = %ci.start, "moisture check skipped: zero interval");
        return false;
    }
    let since_start = (u32::from(minute) + 1440 - u32::from(start)) % 1440;
    in_window(minute, start, end) && since_start % ci.interval == 0
}

/// Dry-soil watering. Skipped while the pump already runs.
fn moisture_candidate(
    minute: u16,
    pump: &PumpSettings,
    sensors: &SensorSnapshot,
    devices: &DeviceStatus,
) -> Option<Candidate> {
    if devices.pump {
        return None;
    }
    let moisture = sensors.soil_moisture?;
    if moisture >= pump.soil_moisture_threshold {
        return None;
    }
    let window = pump
        .check_intervals
        .iter()
        .find(|ci| check_interval_due(minute, ci))?;

    let run = pump
        .schedules
        .first()
        .map(|s| s.duration)
        .filter(|d| *d > 0)
        .unwrap_or(DEFAULT_MOISTURE_RUN_MIN);
    Some(Candidate {
        action: Action::Pump { on: true },
        revert_after_min: Some(run),
        trigger: Trigger::SoilMoisture {
            moisture,
            window_start: window.start.clone(),
        },
    })
}

// ---------------------------------------------------------------------------
// Cover
// ---------------------------------------------------------------------------

/// Membership of `minute` in a `[start, end]` window that may wrap midnight.
pub fn in_window(minute: u16, start: u16, end: u16) -> bool {
    if start > end {
        minute >= start || minute <= end
    } else {
        start <= minute && minute <= end
    }
}

fn cover_candidates(minute: u16, cover: &CoverSettings) -> Vec<Candidate> {
    let mut out = Vec::new();
    for s in &cover.schedules {
        let (Some(start), Some(_)) = (parse_hhmm(&s.start), parse_hhmm(&s.end)) else {
            warn!(start = %s.start, end = %s.end, "cover schedule skipped: bad window");
            continue;
        };
        // Only the entry boundary asserts a position.
        if start == minute {
            out.push(Candidate {
                action: Action::Cover {
                    position: s.position,
                },
                revert_after_min: None,
                trigger: Trigger::CoverWindow {
                    start: s.start.clone(),
                    end: s.end.clone(),
                },
            });
        }
    }
    out
}

/// Whether the cover override is engaged. A missing temperature keeps the
/// previous state.
pub fn cover_overheated(cover: &CoverSettings, sensors: &SensorSnapshot, was_hot: bool) -> bool {
    sensors
        .temperature
        .map_or(was_hot, |t| t > cover.temp_threshold)
}

/// Window entries, overridden by a forced close while too hot. The close is
/// asserted once when the threshold is crossed; on cooling the window's
/// position is restored.
fn cover_with_override(
    minute: u16,
    cover: &CoverSettings,
    sensors: &SensorSnapshot,
    was_hot: bool,
) -> Vec<Candidate> {
    let hot = cover_overheated(cover, sensors, was_hot);
    match (was_hot, hot) {
        (false, true) => vec![Candidate {
            action: Action::Cover {
                position: CoverPosition::Closed,
            },
            revert_after_min: None,
            trigger: Trigger::CoverOverheat {
                temperature: sensors.temperature.unwrap_or(cover.temp_threshold),
            },
        }],
        (true, true) => Vec::new(),
        (true, false) => {
            let entries = cover_candidates(minute, cover);
            if !entries.is_empty() {
                return entries;
            }
            expected_cover(minute, cover)
                .map(|(_, position)| Candidate {
                    action: Action::Cover { position },
                    revert_after_min: None,
                    trigger: Trigger::CoverCooled,
                })
                .into_iter()
                .collect()
        }
        (false, false) => cover_candidates(minute, cover),
    }
}

/// The first cover window containing `minute`, with the position it asks for.
pub fn expected_cover(minute: u16, cover: &CoverSettings) -> Option<(&CoverSchedule, CoverPosition)> {
    cover.schedules.iter().find_map(|s| {
        let start = parse_hhmm(&s.start)?;
        let end = parse_hhmm(&s.end)?;
        in_window(minute, start, end).then_some((s, s.position))
    })
}

// ---------------------------------------------------------------------------
// Fan
// ---------------------------------------------------------------------------

/// Whether the fan is due for a threshold check at `minute`. A zero interval
/// is a configuration error and never opens the gate.
pub fn fan_gate_open(minute: u16, check_interval: u32) -> bool {
    if check_interval == 0 {
        warn!("fan check skipped: check_interval is zero");
        return false;
    }
    u32::from(minute) % check_interval == 0
}

/// Threshold decision for the fan, ignoring the interval gate.
pub fn fan_candidate(
    fan: &FanSettings,
    sensors: &SensorSnapshot,
    devices: &DeviceStatus,
) -> Option<Candidate> {
    let too_hot = sensors.temperature.is_some_and(|t| t > fan.temp_threshold);
    let too_humid = sensors.humidity.is_some_and(|h| h > fan.humidity_threshold);

    if too_hot || too_humid {
        if fan.duration == 0 {
            warn!("fan run skipped: zero duration");
            return None;
        }
        return Some(Candidate {
            action: Action::Fan { on: true },
            revert_after_min: Some(fan.duration),
            trigger: Trigger::FanThreshold {
                temperature: sensors.temperature,
                humidity: sensors.humidity,
            },
        });
    }

    devices.fan.then(|| Candidate {
        action: Action::Fan { on: false },
        revert_after_min: None,
        trigger: Trigger::FanClear,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preset::tests::sample_preset;
    use crate::preset::PumpSchedule;
    use time::macros::datetime;

    fn sensors(temp: f64, humidity: f64) -> SensorSnapshot {
        SensorSnapshot {
            temperature: Some(temp),
            humidity: Some(humidity),
            ..Default::default()
        }
    }

    fn mild() -> SensorSnapshot {
        sensors(22.0, 50.0)
    }

    fn dry(moisture: f64) -> SensorSnapshot {
        SensorSnapshot {
            soil_moisture: Some(moisture),
            ..mild()
        }
    }

    /// Evaluate with every device off and the cover override released.
    fn idle(now: OffsetDateTime, cfg: &DeviceConfig, s: &SensorSnapshot) -> Vec<Candidate> {
        evaluate(now, cfg, s, &DeviceStatus::default(), false)
    }

    fn with_daytime_checks(mut cfg: DeviceConfig) -> DeviceConfig {
        cfg.pump.check_intervals = vec![CheckInterval {
            start: "06:00".into(),
            end: "18:00".into(),
            interval: 60,
        }];
        cfg
    }

    fn for_device(out: &[Candidate], device: Device) -> Vec<Candidate> {
        out.iter().filter(|c| c.action.device() == device).cloned().collect()
    }

    // -- Cover windows --------------------------------------------------

    #[test]
    fn overnight_window_membership() {
        let start = parse_hhmm("18:00").unwrap();
        let end = parse_hhmm("06:00").unwrap();
        assert!(in_window(parse_hhmm("23:00").unwrap(), start, end));
        assert!(in_window(parse_hhmm("02:00").unwrap(), start, end));
        assert!(!in_window(parse_hhmm("12:00").unwrap(), start, end));
    }

    #[test]
    fn same_day_window_is_inclusive() {
        let (start, end) = (parse_hhmm("08:00").unwrap(), parse_hhmm("12:00").unwrap());
        assert!(in_window(start, start, end));
        assert!(in_window(end, start, end));
        assert!(!in_window(parse_hhmm("12:01").unwrap(), start, end));
        assert!(!in_window(parse_hhmm("07:59").unwrap(), start, end));
    }

    #[test]
    fn cover_fires_only_on_window_entry() {
        let cfg = sample_preset();
        let at_start = idle(datetime!(2024-06-01 18:00 UTC), &cfg, &mild());
        assert_eq!(
            at_start.iter().map(|c| c.action).collect::<Vec<_>>(),
            vec![Action::Cover {
                position: CoverPosition::Open
            }]
        );

        let inside = idle(datetime!(2024-06-01 23:00 UTC), &cfg, &mild());
        assert!(inside.iter().all(|c| c.action.device() != Device::Cover));
    }

    #[test]
    fn expected_cover_picks_containing_window() {
        let cfg = sample_preset();
        let (s, pos) = expected_cover(parse_hhmm("02:00").unwrap(), &cfg.cover).unwrap();
        assert_eq!(s.start, "18:00");
        assert_eq!(pos, CoverPosition::Open);
        assert!(expected_cover(parse_hhmm("12:00").unwrap(), &cfg.cover).is_none());
    }

    // -- Pump -----------------------------------------------------------

    #[test]
    fn pump_fires_on_exact_minute_with_reversal() {
        let cfg = sample_preset();
        let out = idle(datetime!(2024-06-01 05:00 UTC), &cfg, &mild());
        let pump: Vec<_> = out.iter().filter(|c| c.action.device() == Device::Pump).collect();
        assert_eq!(pump.len(), 1);
        assert_eq!(pump[0].action, Action::Pump { on: true });
        assert_eq!(pump[0].revert_after_min, Some(5));
        assert_eq!(
            pump[0].trigger,
            Trigger::PumpSchedule {
                time: "05:00".into()
            }
        );
    }

    #[test]
    fn pump_ignores_neighbouring_minutes() {
        let cfg = sample_preset();
        for now in [datetime!(2024-06-01 04:59 UTC), datetime!(2024-06-01 05:01 UTC)] {
            let out = idle(now, &cfg, &mild());
            assert!(out.iter().all(|c| c.action.device() != Device::Pump));
        }
    }

    #[test]
    fn malformed_entry_does_not_block_others() {
        let mut cfg = sample_preset();
        cfg.pump.schedules.insert(
            0,
            PumpSchedule {
                time: "5 o'clock".into(),
                duration: 5,
            },
        );
        cfg.cover.schedules[0].end = "nope".into();

        let out = idle(datetime!(2024-06-01 05:00 UTC), &cfg, &mild());
        assert_eq!(
            out.iter().filter(|c| c.action == Action::Pump { on: true }).count(),
            1
        );
    }

    // -- Soil moisture ---------------------------------------------------

    #[test]
    fn dry_soil_waters_on_check_boundary() {
        let cfg = with_daytime_checks(sample_preset());
        let out = for_device(&idle(datetime!(2024-06-01 09:00 UTC), &cfg, &dry(12.0)), Device::Pump);
        assert_eq!(
            out,
            vec![Candidate {
                action: Action::Pump { on: true },
                revert_after_min: Some(5),
                trigger: Trigger::SoilMoisture {
                    moisture: 12.0,
                    window_start: "06:00".into()
                },
            }]
        );
    }

    #[test]
    fn moisture_checked_only_on_interval_steps_inside_window() {
        let cfg = with_daytime_checks(sample_preset());
        for now in [
            datetime!(2024-06-01 09:30 UTC),
            datetime!(2024-06-01 05:59 UTC),
            datetime!(2024-06-01 19:00 UTC),
        ] {
            assert!(for_device(&idle(now, &cfg, &dry(12.0)), Device::Pump).is_empty(), "{now}");
        }
        assert_eq!(for_device(&idle(datetime!(2024-06-01 18:00 UTC), &cfg, &dry(12.0)), Device::Pump).len(), 1);
    }

    #[test]
    fn moist_soil_or_running_pump_left_alone() {
        let cfg = with_daytime_checks(sample_preset());
        let now = datetime!(2024-06-01 09:00 UTC);
        assert!(for_device(&idle(now, &cfg, &dry(30.0)), Device::Pump).is_empty());
        assert!(for_device(&idle(now, &cfg, &mild()), Device::Pump).is_empty());

        let running = DeviceStatus {
            pump: true,
            ..Default::default()
        };
        let out = evaluate(now, &cfg, &dry(12.0), &running, false);
        assert!(for_device(&out, Device::Pump).is_empty());
    }

    #[test]
    fn no_check_intervals_means_no_moisture_watering() {
        let cfg = sample_preset();
        assert!(for_device(&idle(datetime!(2024-06-01 09:00 UTC), &cfg, &dry(5.0)), Device::Pump).is_empty());
    }

    #[test]
    fn schedule_wins_over_moisture_in_same_minute() {
        let mut cfg = with_daytime_checks(sample_preset());
        cfg.pump.schedules[0].time = "09:00".into();
        cfg.pump.schedules[0].duration = 7;
        let out = for_device(&idle(datetime!(2024-06-01 09:00 UTC), &cfg, &dry(12.0)), Device::Pump);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].revert_after_min, Some(7));
        assert!(matches!(out[0].trigger, Trigger::PumpSchedule { .. }));
    }

    #[test]
    fn moisture_run_falls_back_without_schedules() {
        let mut cfg = with_daytime_checks(sample_preset());
        cfg.pump.schedules.clear();
        let out = for_device(&idle(datetime!(2024-06-01 07:00 UTC), &cfg, &dry(12.0)), Device::Pump);
        assert_eq!(out[0].revert_after_min, Some(DEFAULT_MOISTURE_RUN_MIN));
    }

    #[test]
    fn overnight_check_window_steps_from_its_start() {
        let ci = CheckInterval {
            start: "22:00".into(),
            end: "02:00".into(),
            interval: 90,
        };
        assert!(check_interval_due(parse_hhmm("22:00").unwrap(), &ci));
        assert!(check_interval_due(parse_hhmm("23:30").unwrap(), &ci));
        assert!(check_interval_due(parse_hhmm("01:00").unwrap(), &ci));
        assert!(!check_interval_due(parse_hhmm("00:00").unwrap(), &ci));
        assert!(!check_interval_due(parse_hhmm("02:30").unwrap(), &ci));
    }

    #[test]
    fn zero_interval_never_due() {
        let ci = CheckInterval {
            start: "06:00".into(),
            end: "18:00".into(),
            interval: 0,
        };
        assert!(!check_interval_due(parse_hhmm("06:00").unwrap(), &ci));
    }

    // -- Cover override ----------------------------------------------------

    fn closed() -> Action {
        Action::Cover {
            position: CoverPosition::Closed,
        }
    }

    #[test]
    fn crossing_threshold_closes_cover_once() {
        let cfg = sample_preset();
        let hot = sensors(40.0, 50.0);
        let now = datetime!(2024-06-01 12:00 UTC);

        let first = for_device(&idle(now, &cfg, &hot), Device::Cover);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].action, closed());
        assert_eq!(first[0].trigger, Trigger::CoverOverheat { temperature: 40.0 });
        assert!(cover_overheated(&cfg.cover, &hot, false));

        let again = evaluate(now, &cfg, &hot, &DeviceStatus::default(), true);
        assert!(for_device(&again, Device::Cover).is_empty());
    }

    #[test]
    fn overheat_overrides_window_entry() {
        let cfg = sample_preset();
        let hot = sensors(40.0, 50.0);
        let entry = datetime!(2024-06-01 18:00 UTC);

        let rising = for_device(&idle(entry, &cfg, &hot), Device::Cover);
        assert_eq!(rising.iter().map(|c| c.action).collect::<Vec<_>>(), vec![closed()]);

        let held = evaluate(entry, &cfg, &hot, &DeviceStatus::default(), true);
        assert!(for_device(&held, Device::Cover).is_empty());
    }

    #[test]
    fn threshold_is_strict() {
        let cfg = sample_preset();
        assert!(!cover_overheated(&cfg.cover, &sensors(38.0, 50.0), false));
        assert!(cover_overheated(&cfg.cover, &sensors(38.1, 50.0), false));
    }

    #[test]
    fn cooling_restores_window_position() {
        let cfg = sample_preset();
        let out = evaluate(datetime!(2024-06-01 23:00 UTC), &cfg, &mild(), &DeviceStatus::default(), true);
        let cover = for_device(&out, Device::Cover);
        assert_eq!(cover.len(), 1);
        assert_eq!(
            cover[0].action,
            Action::Cover {
                position: CoverPosition::Open
            }
        );
        assert_eq!(cover[0].trigger, Trigger::CoverCooled);
        assert!(!cover_overheated(&cfg.cover, &mild(), true));
    }

    #[test]
    fn cooling_outside_windows_leaves_cover_closed() {
        let cfg = sample_preset();
        let out = evaluate(datetime!(2024-06-01 12:00 UTC), &cfg, &mild(), &DeviceStatus::default(), true);
        assert!(for_device(&out, Device::Cover).is_empty());
    }

    #[test]
    fn missing_temperature_keeps_override_state() {
        let cfg = sample_preset();
        let blind = SensorSnapshot::default();
        assert!(cover_overheated(&cfg.cover, &blind, true));
        assert!(!cover_overheated(&cfg.cover, &blind, false));

        let out = evaluate(datetime!(2024-06-01 18:00 UTC), &cfg, &blind, &DeviceStatus::default(), true);
        assert!(for_device(&out, Device::Cover).is_empty());
    }

    // -- Fan ------------------------------------------------------------

    #[test]
    fn fan_gate_follows_check_interval() {
        assert!(fan_gate_open(0, 30));
        assert!(fan_gate_open(30, 30));
        assert!(fan_gate_open(750, 30));
        assert!(!fan_gate_open(31, 30));
        assert!(!fan_gate_open(45, 30));
        assert!(!fan_gate_open(60, 0));
    }

    #[test]
    fn fan_not_evaluated_off_interval() {
        let cfg = sample_preset();
        let out = idle(datetime!(2024-06-01 12:07 UTC), &cfg, &sensors(40.0, 95.0));
        assert!(out.iter().all(|c| c.action.device() != Device::Fan));
    }

    #[test]
    fn fan_on_when_too_hot_on_interval() {
        let cfg = sample_preset();
        let out = idle(datetime!(2024-06-01 12:30 UTC), &cfg, &sensors(35.0, 50.0));
        let fan: Vec<_> = out.iter().filter(|c| c.action.device() == Device::Fan).collect();
        assert_eq!(fan.len(), 1);
        assert_eq!(fan[0].action, Action::Fan { on: true });
        assert_eq!(fan[0].revert_after_min, Some(10));
    }

    #[test]
    fn fan_on_when_too_humid() {
        let cfg = sample_preset();
        let c = fan_candidate(&cfg.fan, &sensors(20.0, 90.0), &DeviceStatus::default()).unwrap();
        assert_eq!(c.action, Action::Fan { on: true });
    }

    #[test]
    fn thresholds_are_strict() {
        let cfg = sample_preset();
        assert!(fan_candidate(&cfg.fan, &sensors(30.0, 80.0), &DeviceStatus::default()).is_none());
    }

    #[test]
    fn fan_turned_off_when_clear_and_running() {
        let cfg = sample_preset();
        let running = DeviceStatus {
            fan: true,
            ..Default::default()
        };
        let c = fan_candidate(&cfg.fan, &mild(), &running).unwrap();
        assert_eq!(c.action, Action::Fan { on: false });
        assert_eq!(c.revert_after_min, None);
        assert_eq!(c.trigger, Trigger::FanClear);
    }

    #[test]
    fn fan_left_alone_when_clear_and_idle() {
        let cfg = sample_preset();
        assert!(fan_candidate(&cfg.fan, &mild(), &DeviceStatus::default()).is_none());
    }

    #[test]
    fn missing_readings_never_breach() {
        let cfg = sample_preset();
        assert!(fan_candidate(&cfg.fan, &SensorSnapshot::default(), &DeviceStatus::default()).is_none());
    }

    #[test]
    fn devices_evaluate_independently() {
        let mut cfg = sample_preset();
        cfg.pump.schedules[0].time = "18:00".into();
        cfg.fan.check_interval = 60;

        let out = idle(datetime!(2024-06-01 18:00 UTC), &cfg, &sensors(35.0, 50.0));
        let devices: Vec<_> = out.iter().map(|c| c.action.device()).collect();
        assert_eq!(devices, vec![Device::Pump, Device::Cover, Device::Fan]);
    }

    #[test]
    fn reversal_candidates() {
        assert_eq!(Candidate::reversal(Device::Pump).unwrap().action, Action::Pump { on: false });
        assert!(Candidate::reversal(Device::Cover).is_none());
    }
}
