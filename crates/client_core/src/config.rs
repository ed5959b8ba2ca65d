use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

use crate::error::SyncError;

pub const DEFAULT_SETTINGS_FILE: &str = "chat_client.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub server_url: String,
    pub poll_interval_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub typing_idle_ms: u64,
    pub typing_expiry_ms: u64,
    pub ping_interval_ms: u64,
    pub auth_cookie: Option<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".into(),
            poll_interval_ms: 2_000,
            reconnect_base_delay_ms: 2_000,
            max_reconnect_attempts: 5,
            typing_idle_ms: 2_000,
            typing_expiry_ms: 4_000,
            ping_interval_ms: 25_000,
            auth_cookie: None,
        }
    }
}

impl SyncSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }

    /// `None` disables keepalive pings.
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        let url = url::Url::parse(&self.server_url)
            .map_err(|err| SyncError::Config(format!("server_url '{}': {err}", self.server_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SyncError::Config(
                "server_url must start with http:// or https://".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(SyncError::Config("poll_interval_ms must be positive".into()));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(SyncError::Config(
                "max_reconnect_attempts must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Defaults, then the settings file (when present), then `APP__*` env overrides.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<SyncSettings> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_SETTINGS_FILE));
    let mut settings = if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
        parse_settings(&raw)
            .with_context(|| format!("failed to parse settings file '{}'", path.display()))?
    } else {
        SyncSettings::default()
    };

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

pub fn parse_settings(raw: &str) -> anyhow::Result<SyncSettings> {
    Ok(toml::from_str::<SyncSettings>(raw)?)
}

fn apply_env_overrides(settings: &mut SyncSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("APP__AUTH_COOKIE") {
        settings.auth_cookie = Some(v);
    }
    override_number(&lookup, "APP__POLL_INTERVAL_MS", &mut settings.poll_interval_ms);
    override_number(
        &lookup,
        "APP__RECONNECT_BASE_DELAY_MS",
        &mut settings.reconnect_base_delay_ms,
    );
    override_number(
        &lookup,
        "APP__MAX_RECONNECT_ATTEMPTS",
        &mut settings.max_reconnect_attempts,
    );
    override_number(&lookup, "APP__TYPING_IDLE_MS", &mut settings.typing_idle_ms);
    override_number(&lookup, "APP__TYPING_EXPIRY_MS", &mut settings.typing_expiry_ms);
    override_number(&lookup, "APP__PING_INTERVAL_MS", &mut settings.ping_interval_ms);
}

fn override_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!(key, value = %raw, "ignoring non-numeric settings override"),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
