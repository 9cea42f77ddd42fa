use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use session_core::SessionManagerConfig;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    /// Required: `base64:<44 chars>` decoding to 32 bytes.
    pub master_key: Option<String>,
    pub reconnect_max_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub connect_timeout_seconds: u64,
    pub flush_debounce_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8090".into(),
            database_url: "sqlite://./data/sessions.db".into(),
            master_key: None,
            reconnect_max_attempts: 4,
            reconnect_delay_ms: 4000,
            connect_timeout_seconds: 30,
            flush_debounce_ms: 1000,
        }
    }
}

impl Settings {
    pub fn manager_config(&self) -> SessionManagerConfig {
        SessionManagerConfig {
            max_reconnect_attempts: self.reconnect_max_attempts,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds),
            flush_debounce: Duration::from_millis(self.flush_debounce_ms),
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("bind_addr") {
                settings.server_bind = v.clone();
            }
            if let Some(v) = file_cfg.get("database_url") {
                settings.database_url = v.clone();
            }
            if let Some(v) = file_cfg.get("master_key") {
                settings.master_key = Some(v.clone());
            }
        }
    }

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Ok(v) = std::env::var("MASTER_KEY") {
        settings.master_key = Some(v);
    }
    if let Ok(v) = std::env::var("APP__MASTER_KEY") {
        settings.master_key = Some(v);
    }

    if let Ok(v) = std::env::var("APP__RECONNECT_MAX_ATTEMPTS") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.reconnect_max_attempts = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__RECONNECT_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_delay_ms = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__CONNECT_TIMEOUT_SECONDS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.connect_timeout_seconds = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__FLUSH_DEBOUNCE_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.flush_debounce_ms = parsed;
        }
    }

    settings
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}
