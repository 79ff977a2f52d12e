//! Engine configuration
//!
//! Defaults live in `EngineConfig::default()`. Any of them can be overridden by a
//! row in the `settings` table, which is how the host app changes endpoints or
//! retry caps without a release.

use std::time::Duration;

use sqlx::SqlitePool;

use crate::error::Result;

/// Default regulator endpoints
const DMF_SUBMIT_URL: &str = "https://harvest.dmf.example.gov/api/reports";
const DMF_WEBHOOK_URL: &str = "https://harvest.dmf.example.gov/api/confirmations";
const CONNECTIVITY_URL: &str = "https://harvest.dmf.example.gov/health";

/// Setting keys
pub mod setting_keys {
    pub const MAX_QUEUE_RETRIES: &str = "sync.max_queue_retries";
    pub const MAX_DMF_ATTEMPTS: &str = "sync.max_dmf_attempts";
    pub const MAX_WEBHOOK_ATTEMPTS: &str = "sync.max_webhook_attempts";
    pub const MAX_HISTORY_ENTRIES: &str = "sync.max_history_entries";
    pub const MAX_FAILED_ENTRIES: &str = "sync.max_failed_entries";
    pub const CONNECTIVITY_TTL_SECS: &str = "sync.connectivity_ttl_secs";
    pub const REQUEST_TIMEOUT_SECS: &str = "dmf.request_timeout_secs";
    pub const DMF_SUBMIT_URL: &str = "dmf.submit_url";
    pub const DMF_WEBHOOK_URL: &str = "dmf.webhook_url";
    pub const CONNECTIVITY_URL: &str = "dmf.connectivity_url";
    pub const CURRENT_DRAWING_ID: &str = "rewards.current_drawing_id";
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Failed drains before a queued report is dropped (System A)
    pub max_queue_retries: u32,
    /// Regulator attempts for a cache-resident report (System B)
    pub max_dmf_attempts: u32,
    /// Confirmation webhook attempts, independent of the submission caps
    pub max_webhook_attempts: u32,
    pub max_history_entries: usize,
    pub max_failed_entries: usize,
    pub connectivity_ttl: Duration,
    pub request_timeout: Duration,
    pub dmf_submit_url: String,
    pub dmf_webhook_url: String,
    pub connectivity_url: String,
    /// Drawing that opted-in reports are associated with
    pub current_drawing_id: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_queue_retries: 3,
            max_dmf_attempts: 3,
            max_webhook_attempts: 5,
            max_history_entries: 50,
            max_failed_entries: 50,
            connectivity_ttl: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            dmf_submit_url: DMF_SUBMIT_URL.to_string(),
            dmf_webhook_url: DMF_WEBHOOK_URL.to_string(),
            connectivity_url: CONNECTIVITY_URL.to_string(),
            current_drawing_id: None,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with whatever the `settings` table holds.
    ///
    /// Unparseable values are logged and ignored.
    pub async fn load(pool: &SqlitePool) -> Result<Self> {
        use setting_keys::*;

        let mut config = Self::default();

        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM settings")
            .fetch_all(pool)
            .await?;

        for (key, value) in rows {
            let value = value.trim();
            let applied = match key.as_str() {
                MAX_QUEUE_RETRIES => parse_into(value, &mut config.max_queue_retries),
                MAX_DMF_ATTEMPTS => parse_into(value, &mut config.max_dmf_attempts),
                MAX_WEBHOOK_ATTEMPTS => parse_into(value, &mut config.max_webhook_attempts),
                MAX_HISTORY_ENTRIES => parse_into(value, &mut config.max_history_entries),
                MAX_FAILED_ENTRIES => parse_into(value, &mut config.max_failed_entries),
                CONNECTIVITY_TTL_SECS => parse_secs(value, &mut config.connectivity_ttl),
                REQUEST_TIMEOUT_SECS => parse_secs(value, &mut config.request_timeout),
                DMF_SUBMIT_URL => set_string(value, &mut config.dmf_submit_url),
                DMF_WEBHOOK_URL => set_string(value, &mut config.dmf_webhook_url),
                CONNECTIVITY_URL => set_string(value, &mut config.connectivity_url),
                CURRENT_DRAWING_ID => {
                    config.current_drawing_id = (!value.is_empty()).then(|| value.to_string());
                    true
                }
                _ => true,
            };
            if !applied {
                log::warn!("Ignoring invalid setting {} = {:?}", key, value);
            }
        }

        Ok(config)
    }
}

fn parse_into<T: std::str::FromStr>(value: &str, target: &mut T) -> bool {
    match value.parse() {
        Ok(v) => {
            *target = v;
            true
        }
        Err(_) => false,
    }
}

fn parse_secs(value: &str, target: &mut Duration) -> bool {
    match value.parse::<u64>() {
        Ok(secs) => {
            *target = Duration::from_secs(secs);
            true
        }
        Err(_) => false,
    }
}

fn set_string(value: &str, target: &mut String) -> bool {
    if value.is_empty() {
        return false;
    }
    *target = value.to_string();
    true
}

pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let result = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(result)
}

pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    log::info!(
        "Setting {} = {}",
        key,
        if key.contains("password") || key.contains("token") {
            "***"
        } else {
            value
        }
    );

    sqlx::query(
        r#"INSERT INTO settings (key, value, updated_at)
           VALUES (?, ?, datetime('now'))
           ON CONFLICT(key) DO UPDATE SET
             value = excluded.value,
             updated_at = datetime('now')"#,
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;

    Ok(())
}
