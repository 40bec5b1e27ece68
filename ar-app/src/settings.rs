//! Live bot settings.
//!
//! Operators change these while the engine runs; the engine re-reads them at
//! the top of every iteration.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::store::{Database, now_rfc3339};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SettingKey {
    Active,
    TransportBaseUrl,
    TransportToken,
    TransportInstanceName,
    GenerationApiKey,
}

impl SettingKey {
    pub const ALL: [SettingKey; 5] = [
        Self::Active,
        Self::TransportBaseUrl,
        Self::TransportToken,
        Self::TransportInstanceName,
        Self::GenerationApiKey,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::TransportBaseUrl => "transport_base_url",
            Self::TransportToken => "transport_token",
            Self::TransportInstanceName => "transport_instance_name",
            Self::GenerationApiKey => "generation_api_key",
        }
    }

    fn is_secret(self) -> bool {
        matches!(self, Self::TransportToken | Self::GenerationApiKey)
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingKey {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|key| key.as_str() == raw.trim())
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|k| k.as_str()).collect();
                anyhow!("unknown setting {raw:?}; expected one of: {}", known.join(", "))
            })
    }
}

/// Snapshot of the live settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotSettings {
    pub active: bool,
    pub transport_base_url: String,
    pub transport_token: String,
    pub transport_instance_name: String,
    pub generation_api_key: String,
}

impl BotSettings {
    pub fn set(&mut self, key: SettingKey, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            SettingKey::Active => self.active = parse_bool(value)?,
            SettingKey::TransportBaseUrl => self.transport_base_url = value.to_string(),
            SettingKey::TransportToken => self.transport_token = value.to_string(),
            SettingKey::TransportInstanceName => {
                self.transport_instance_name = value.to_string()
            }
            SettingKey::GenerationApiKey => self.generation_api_key = value.to_string(),
        }
        Ok(())
    }

    pub fn get(&self, key: SettingKey) -> String {
        match key {
            SettingKey::Active => self.active.to_string(),
            SettingKey::TransportBaseUrl => self.transport_base_url.clone(),
            SettingKey::TransportToken => self.transport_token.clone(),
            SettingKey::TransportInstanceName => self.transport_instance_name.clone(),
            SettingKey::GenerationApiKey => self.generation_api_key.clone(),
        }
    }

    pub fn has_generation_key(&self) -> bool {
        !self.generation_api_key.trim().is_empty()
    }

    /// Safe to log or return over HTTP: secrets become `set`/`unset` markers.
    pub fn redacted(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        for key in SettingKey::ALL {
            let value = match key {
                SettingKey::Active => serde_json::Value::Bool(self.active),
                key if key.is_secret() => {
                    let set = !self.get(key).is_empty();
                    serde_json::Value::String(if set { "set" } else { "unset" }.to_string())
                }
                key => serde_json::Value::String(self.get(key)),
            };
            out.insert(key.as_str().to_string(), value);
        }
        serde_json::Value::Object(out)
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        other => Err(anyhow!("invalid boolean {other:?}")),
    }
}

/// Source of the settings snapshot read each engine iteration.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn load(&self) -> Result<BotSettings>;
}

/// Settings persisted as key/value rows in the `bot_settings` table.
#[derive(Clone)]
pub struct SqliteSettings {
    db: Database,
}

impl SqliteSettings {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Writes each entry only when the key has never been stored.
    pub async fn seed_missing(&self, entries: Vec<(SettingKey, String)>) -> Result<usize> {
        self.write(entries, false).await
    }

    /// Overwrites each entry.
    pub async fn apply(&self, entries: Vec<(SettingKey, String)>) -> Result<usize> {
        self.write(entries, true).await
    }

    pub async fn set(&self, key: SettingKey, value: &str) -> Result<()> {
        // Validate through the typed snapshot before persisting.
        BotSettings::default().set(key, value)?;
        self.apply(vec![(key, value.trim().to_string())]).await?;
        tracing::info!(setting = %key, "bot setting updated");
        Ok(())
    }

    async fn write(&self, entries: Vec<(SettingKey, String)>, overwrite: bool) -> Result<usize> {
        let sql = if overwrite {
            "INSERT INTO bot_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at"
        } else {
            "INSERT OR IGNORE INTO bot_settings (key, value, updated_at) VALUES (?1, ?2, ?3)"
        };
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut written = 0;
                {
                    let mut stmt = tx.prepare_cached(sql)?;
                    let now = now_rfc3339();
                    for (key, value) in &entries {
                        written += stmt.execute(params![key.as_str(), value, now])?;
                    }
                }
                tx.commit()?;
                Ok(written)
            })
            .await
    }
}

#[async_trait]
impl SettingsProvider for SqliteSettings {
    async fn load(&self) -> Result<BotSettings> {
        let rows = self
            .db
            .call(|conn| {
                let mut stmt = conn.prepare_cached("SELECT key, value FROM bot_settings")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;

        let mut settings = BotSettings::default();
        for (key, value) in rows {
            match key.parse::<SettingKey>() {
                Ok(key) => settings.set(key, &value)?,
                Err(_) => tracing::debug!(key = %key, "ignoring unknown stored setting"),
            }
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SqliteSettings {
        SqliteSettings::new(Database::open_in_memory().expect("in-memory db"))
    }

    #[tokio::test]
    async fn empty_table_loads_inactive_defaults() {
        let loaded = settings().load().await.expect("load");
        assert_eq!(loaded, BotSettings::default());
        assert!(!loaded.active);
        assert!(!loaded.has_generation_key());
    }

    #[tokio::test]
    async fn seeding_never_overwrites_but_apply_does() {
        let store = settings();
        store
            .seed_missing(vec![
                (SettingKey::TransportInstanceName, "loja".to_string()),
                (SettingKey::Active, "true".to_string()),
            ])
            .await
            .expect("seed");
        let written = store
            .seed_missing(vec![(SettingKey::TransportInstanceName, "outra".to_string())])
            .await
            .expect("seed again");
        assert_eq!(written, 0);

        let loaded = store.load().await.expect("load");
        assert!(loaded.active);
        assert_eq!(loaded.transport_instance_name, "loja");

        store
            .apply(vec![(SettingKey::TransportInstanceName, "outra".to_string())])
            .await
            .expect("apply");
        assert_eq!(
            store.load().await.expect("load").transport_instance_name,
            "outra"
        );
    }

    #[tokio::test]
    async fn set_validates_booleans() {
        let store = settings();
        assert!(store.set(SettingKey::Active, "maybe").await.is_err());
        store.set(SettingKey::Active, "on").await.expect("set");
        assert!(store.load().await.expect("load").active);
    }

    #[test]
    fn setting_keys_parse_by_name() {
        assert_eq!(
            "generation_api_key".parse::<SettingKey>().expect("key"),
            SettingKey::GenerationApiKey
        );
        assert!("api_key".parse::<SettingKey>().is_err());
    }

    #[test]
    fn redacted_view_hides_secrets() {
        let settings = BotSettings {
            active: true,
            transport_base_url: "https://evo.example.com".to_string(),
            transport_token: "secret-token".to_string(),
            transport_instance_name: "loja".to_string(),
            generation_api_key: String::new(),
        };
        let view = settings.redacted();
        assert_eq!(view["active"], serde_json::json!(true));
        assert_eq!(view["transport_token"], "set");
        assert_eq!(view["generation_api_key"], "unset");
        assert_eq!(view["transport_base_url"], "https://evo.example.com");
        assert!(!view.to_string().contains("secret-token"));
    }
}
