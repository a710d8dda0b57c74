use std::{collections::HashMap, fs, time::Duration};

#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Base URL of the portal backend, e.g. `https://portal.example.com`.
    pub server_url: String,
    /// Optional override for the live channel endpoint. When absent the
    /// socket URL is derived from `server_url` by swapping the scheme.
    pub socket_url: Option<String>,
    pub request_timeout_seconds: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            socket_url: None,
            request_timeout_seconds: 15,
            reconnect_base_ms: 500,
            reconnect_cap_ms: 30_000,
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect_cap_ms)
    }
}

pub fn load_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string("chat.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("server_url") {
                settings.server_url = v.clone();
            }
            if let Some(v) = file_cfg.get("socket_url") {
                settings.socket_url = Some(v.clone());
            }
            if let Some(v) = file_cfg.get("request_timeout_seconds") {
                if let Ok(parsed) = v.parse::<u64>() {
                    settings.request_timeout_seconds = parsed;
                }
            }
            if let Some(v) = file_cfg.get("reconnect_base_ms") {
                if let Ok(parsed) = v.parse::<u64>() {
                    settings.reconnect_base_ms = parsed;
                }
            }
            if let Some(v) = file_cfg.get("reconnect_cap_ms") {
                if let Ok(parsed) = v.parse::<u64>() {
                    settings.reconnect_cap_ms = parsed;
                }
            }
        }
    }

    if let Ok(v) = std::env::var("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_SOCKET_URL") {
        settings.socket_url = Some(v);
    }
    if let Ok(v) = std::env::var("CHAT_REQUEST_TIMEOUT_SECONDS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.request_timeout_seconds = parsed;
        }
    }
    if let Ok(v) = std::env::var("CHAT_RECONNECT_BASE_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_base_ms = parsed;
        }
    }
    if let Ok(v) = std::env::var("CHAT_RECONNECT_CAP_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_cap_ms = parsed;
        }
    }

    settings
}
