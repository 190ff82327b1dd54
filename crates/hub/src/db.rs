use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;

use crate::preset::DeviceConfig;

const ACTIVE_PRESET_KEY: &str = "active_preset";

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// One row of the action journal.
#[derive(Debug, Clone, Serialize)]
pub struct ActionEvent {
    pub ts: i64,
    pub device: String,
    pub action: String,
    pub source: String,
    pub result: String,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/greenhouse/hub.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    // ----------------------------
    // Presets
    // ----------------------------

    pub async fn upsert_preset(&self, preset: &DeviceConfig, updated_at: i64) -> Result<()> {
        let body = serde_json::to_string(preset).context("failed to encode preset")?;
        sqlx::query(
            r#"
            INSERT INTO presets (name, body, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
              body=excluded.body,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(&preset.name)
        .bind(body)
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .context("upsert_preset failed")?;
        Ok(())
    }

    /// Insert `preset` only if no preset with that name exists yet. Returns
    /// whether a row was written.
    pub async fn seed_preset(&self, preset: &DeviceConfig, updated_at: i64) -> Result<bool> {
        let body = serde_json::to_string(preset).context("failed to encode preset")?;
        let result = sqlx::query(
            r#"
            INSERT INTO presets (name, body, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(&preset.name)
        .bind(body)
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .context("seed_preset failed")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn load_presets(&self) -> Result<Vec<DeviceConfig>> {
        let rows = sqlx::query("SELECT name, body FROM presets ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .context("load_presets failed")?;

        rows.iter()
            .map(|r| {
                let name: String = r.try_get("name")?;
                let body: String = r.try_get("body")?;
                decode_preset(&name, &body)
            })
            .collect()
    }

    pub async fn get_preset(&self, name: &str) -> Result<Option<DeviceConfig>> {
        let row = sqlx::query("SELECT body FROM presets WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("get_preset failed")?;

        match row {
            Some(r) => {
                let body: String = r.try_get("body")?;
                decode_preset(name, &body).map(Some)
            }
            None => Ok(None),
        }
    }

    // ----------------------------
    // Settings
    // ----------------------------

    pub async fn active_preset(&self) -> Result<Option<String>> {
        self.get_setting(ACTIVE_PRESET_KEY).await
    }

    pub async fn set_active_preset(&self, name: &str) -> Result<()> {
        self.set_setting(ACTIVE_PRESET_KEY, name).await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("get_setting({key}) failed"))?;
        Ok(row.map(|r| r.try_get("value")).transpose()?)
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value=excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("set_setting({key}) failed"))?;
        Ok(())
    }

    // ----------------------------
    // Action journal
    // ----------------------------

    pub async fn insert_action_event(&self, e: &ActionEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO action_events (ts, device, action, source, result)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(e.ts)
        .bind(&e.device)
        .bind(&e.action)
        .bind(&e.source)
        .bind(&e.result)
        .execute(&self.pool)
        .await
        .context("insert_action_event failed")?;
        Ok(())
    }

    /// Newest first.
    pub async fn recent_action_events(&self, limit: i64) -> Result<Vec<ActionEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT ts, device, action, source, result
            FROM action_events
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_action_events failed")?;

        rows.iter()
            .map(|r| -> Result<ActionEvent> {
                Ok(ActionEvent {
                    ts: r.try_get("ts")?,
                    device: r.try_get("device")?,
                    action: r.try_get("action")?,
                    source: r.try_get("source")?,
                    result: r.try_get("result")?,
                })
            })
            .collect()
    }
}

fn decode_preset(name: &str, body: &str) -> Result<DeviceConfig> {
    serde_json::from_str(body).with_context(|| format!("stored preset '{name}' is not valid JSON"))
}

// ===========================================================================
// Tests
// ===========================================================================
