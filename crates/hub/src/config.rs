//! TOML config file loading, validation, and database seeding for presets.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use time::macros::format_description;
use time::UtcOffset;

use crate::conflict::ResolutionPolicy;
use crate::db::Db;
use crate::preset::DeviceConfig;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub control: ControlSection,
    /// Seeds the active pointer when the database has none yet.
    #[serde(default)]
    pub active_preset: Option<String>,
    #[serde(default)]
    pub presets: Vec<DeviceConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    /// Base URL shared by `/sensors/latest`, `/devices/status` and
    /// `/devices/{id}/control`.
    pub base_url: String,
    pub timeout_sec: u64,
    pub poll_interval_sec: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000/api".to_string(),
            timeout_sec: 5,
            poll_interval_sec: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlSection {
    pub recency_window_sec: u64,
    pub policy: ResolutionPolicy,
    pub resolution_log_size: usize,
    pub cancel_reversals_on_activate: bool,
    /// Fixed offset such as "+07:00"; the host's local offset when absent.
    pub utc_offset: Option<String>,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            recency_window_sec: 60,
            policy: ResolutionPolicy::default(),
            resolution_log_size: 20,
            cancel_reversals_on_activate: false,
            utc_offset: None,
        }
    }
}

impl GatewaySection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec)
    }
}

impl ControlSection {
    pub fn recency_window(&self) -> Duration {
        Duration::from_secs(self.recency_window_sec)
    }

    pub fn utc_offset(&self) -> Result<Option<UtcOffset>> {
        self.utc_offset
            .as_deref()
            .map(parse_offset)
            .transpose()
    }
}

fn parse_offset(s: &str) -> Result<UtcOffset> {
    UtcOffset::parse(
        s.trim(),
        format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
    )
    .with_context(|| format!("utc_offset '{s}' is not ±HH:MM"))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Longest gateway timeout accepted; the tick must never stall for long.
const MAX_TIMEOUT_SEC: u64 = 60;

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_gateway(&mut errors);
        self.validate_control(&mut errors);
        self.validate_presets(&mut errors);

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

    fn validate_gateway(&self, errors: &mut Vec<String>) {
        let g = &self.gateway;
        if !(g.base_url.starts_with("http://") || g.base_url.starts_with("https://")) {
            errors.push(format!(
                "gateway.base_url '{}' must start with http:// or https://",
                g.base_url
            ));
        }
        if g.timeout_sec == 0 || g.timeout_sec > MAX_TIMEOUT_SEC {
            errors.push(format!(
                "gateway.timeout_sec must be 1-{MAX_TIMEOUT_SEC}, got {}",
                g.timeout_sec
            ));
        }
        if g.poll_interval_sec == 0 {
            errors.push("gateway.poll_interval_sec must be positive".to_string());
        }
    }

    fn validate_control(&self, errors: &mut Vec<String>) {
        let c = &self.control;
        if c.recency_window_sec == 0 {
            errors.push("control.recency_window_sec must be positive".to_string());
        }
        if c.resolution_log_size == 0 {
            errors.push("control.resolution_log_size must be positive".to_string());
        }
        if let Err(e) = c.utc_offset() {
            errors.push(format!("control.{e}"));
        }
    }

    fn validate_presets(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();
        for p in &self.presets {
            if !p.name.trim().is_empty() && !seen.insert(&p.name) {
                errors.push(format!("preset '{}': duplicate name", p.name));
            }
            errors.extend(p.problems());
        }

        if let Some(active) = &self.active_preset {
            if !seen.contains(active.as_str()) {
                errors.push(format!(
                    "active_preset '{active}' does not match any [[presets]] entry"
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Seed `[[presets]]` entries the database does not know yet, and the active
/// pointer if it is unset. Presets already stored belong to the operator and
/// are left untouched.
pub async fn apply(config: &Config, db: &Db, now_ts: i64) -> Result<()> {
    let mut seeded = 0;
    for p in &config.presets {
        if db
            .seed_preset(p, now_ts)
            .await
            .with_context(|| format!("failed to seed preset '{}'", p.name))?
        {
            seeded += 1;
        } else {
            tracing::debug!(preset = %p.name, "preset already stored, keeping it");
        }
    }

    if let Some(active) = &config.active_preset {
        if db.active_preset().await?.is_none() {
            db.set_active_preset(active).await?;
        }
    }

    tracing::info!(presets = config.presets.len(), seeded, "config applied");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
