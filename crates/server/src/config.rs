use std::{fs, time::Duration};

use tracing::warn;

pub const SERVER_CONFIG_FILE: &str = "server.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub delivery_interval_ms: u64,
    pub loopback_service: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:5000".into(),
            database_url: "sqlite://./data/relay.db".into(),
            delivery_interval_ms: 1000,
            loopback_service: "protocol_service".into(),
        }
    }
}

impl Settings {
    pub fn delivery_interval(&self) -> Duration {
        Duration::from_millis(self.delivery_interval_ms.max(1))
    }
}

pub fn load_settings() -> Settings {
    let file = fs::read_to_string(SERVER_CONFIG_FILE).ok();
    load_settings_from(file.as_deref(), |key| std::env::var(key).ok())
}

/// Defaults, then the TOML file body (if any), then the environment.
pub fn load_settings_from(
    file: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = file {
        match toml::from_str::<toml::Table>(raw) {
            Ok(file_cfg) => {
                let get = |key: &str| {
                    file_cfg.get(key).map(|value| match value {
                        toml::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                };
                if let Some(v) = get("bind_addr").or_else(|| get("server_bind")) {
                    settings.server_bind = v;
                }
                if let Some(v) = get("database_url") {
                    settings.database_url = v;
                }
                if let Some(v) = get("delivery_interval_ms") {
                    set_interval(&mut settings, &v);
                }
                if let Some(v) = get("loopback_service") {
                    settings.loopback_service = v;
                }
            }
            Err(err) => warn!(error = %err, "config: ignoring malformed {SERVER_CONFIG_FILE}"),
        }
    }

    if let Some(v) = env("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = env("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(v) = env("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = env("APP__DELIVERY_INTERVAL_MS") {
        set_interval(&mut settings, &v);
    }
    if let Some(v) = env("APP__LOOPBACK_SERVICE") {
        settings.loopback_service = v;
    }

    settings
}

fn set_interval(settings: &mut Settings, raw: &str) {
    match raw.trim().parse::<u64>() {
        Ok(parsed) => settings.delivery_interval_ms = parsed,
        Err(_) => warn!(value = raw, "config: ignoring unparsable delivery_interval_ms"),
    }
}

/// Normalises the configured URL into one sqlx accepts. `Storage::new`
/// creates the parent directory.
pub fn prepare_database_url(raw_database_url: &str) -> String {
    normalize_database_url(raw_database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        if has_windows_drive(path) {
            return format!("sqlite:{}", path.replace('\\', "/"));
        }
        return raw_database_url.to_string();
    }

    if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    let path = raw_database_url
        .strip_prefix("sqlite:")
        .unwrap_or(raw_database_url)
        .replace('\\', "/");
    if has_windows_drive(&path) {
        format!("sqlite:{path}")
    } else {
        format!("sqlite://{path}")
    }
}

fn has_windows_drive(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'/' || bytes[2] == b'\\')
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
