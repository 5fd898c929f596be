use std::{fs, time::Duration};

use tracing::warn;

pub const CLIENT_CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub poll_interval_ms: u64,
    pub call_timer_tick_ms: u64,
    pub mirror_local_preview: bool,
    pub handshake_send_attempts: u32,
    pub handshake_retry_delay_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".into(),
            poll_interval_ms: 2000,
            call_timer_tick_ms: 1000,
            mirror_local_preview: true,
            handshake_send_attempts: 3,
            handshake_retry_delay_ms: 500,
        }
    }
}

impl ClientSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn call_timer_tick(&self) -> Duration {
        Duration::from_millis(self.call_timer_tick_ms.max(1))
    }

    pub fn handshake_retry_delay(&self) -> Duration {
        Duration::from_millis(self.handshake_retry_delay_ms)
    }

    pub fn apply_file(&mut self, raw: &str) {
        let table = match toml::from_str::<toml::Table>(raw) {
            Ok(table) => table,
            Err(err) => {
                warn!(error = %err, "config: ignoring malformed {CLIENT_CONFIG_FILE}");
                return;
            }
        };
        for (key, value) in &table {
            let value = match value {
                toml::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            self.apply(key, &value);
        }
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("SERVER_URL") {
            self.apply("server_url", &v);
        }
        for key in [
            "server_url",
            "poll_interval_ms",
            "call_timer_tick_ms",
            "mirror_local_preview",
            "handshake_send_attempts",
            "handshake_retry_delay_ms",
        ] {
            if let Some(v) = lookup(&format!("APP__{}", key.to_ascii_uppercase())) {
                self.apply(key, &v);
            }
        }
    }

    fn apply(&mut self, key: &str, value: &str) {
        let value = value.trim();
        match key {
            "server_url" => self.server_url = value.trim_end_matches('/').to_string(),
            "poll_interval_ms" => set_parsed(&mut self.poll_interval_ms, key, value),
            "call_timer_tick_ms" => set_parsed(&mut self.call_timer_tick_ms, key, value),
            "mirror_local_preview" => set_parsed(&mut self.mirror_local_preview, key, value),
            "handshake_send_attempts" => {
                set_parsed(&mut self.handshake_send_attempts, key, value);
                self.handshake_send_attempts = self.handshake_send_attempts.max(1);
            }
            "handshake_retry_delay_ms" => {
                set_parsed(&mut self.handshake_retry_delay_ms, key, value)
            }
            _ => {}
        }
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, key: &str, value: &str) {
    match value.parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value, "config: ignoring unparsable value"),
    }
}

pub fn load_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();
    if let Ok(raw) = fs::read_to_string(CLIENT_CONFIG_FILE) {
        settings.apply_file(&raw);
    }
    settings.apply_env(|key| std::env::var(key).ok());
    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
