use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tracing::warn;

const DEV_SESSION_SECRET: &str = "dev-session-secret";

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub session_secret: String,
    pub session_ttl_seconds: i64,
    pub google_maps_api_key: Option<String>,
    pub depot_address: String,
    pub request_timeout_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:3000".into(),
            database_url: "sqlite://./data/deliveries.db".into(),
            session_secret: DEV_SESSION_SECRET.into(),
            session_ttl_seconds: 12 * 3600,
            google_maps_api_key: None,
            depot_address: "357 Negombo - Colombo Main Rd, Negombo 11500".into(),
            request_timeout_seconds: 30,
        }
    }
}

impl Settings {
    pub fn uses_dev_session_secret(&self) -> bool {
        self.session_secret == DEV_SESSION_SECRET
    }
}

/// Defaults, then `server.toml` in the working directory, then environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    if let Ok(raw) = fs::read_to_string("server.toml") {
        apply_file(&mut settings, &raw);
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file(settings: &mut Settings, raw: &str) {
    let file_cfg = match toml::from_str::<HashMap<String, toml::Value>>(raw) {
        Ok(file_cfg) => file_cfg,
        Err(error) => {
            warn!(%error, "ignoring unreadable server.toml");
            return;
        }
    };
    let text = |key: &str| match file_cfg.get(key) {
        Some(toml::Value::String(v)) => Some(v.clone()),
        Some(toml::Value::Integer(v)) => Some(v.to_string()),
        _ => None,
    };

    if let Some(v) = text("bind_addr") {
        settings.server_bind = v;
    }
    if let Some(v) = text("database_url") {
        settings.database_url = v;
    }
    if let Some(v) = text("depot_address") {
        settings.depot_address = v;
    }
    if let Some(v) = text("request_timeout_seconds") {
        match v.parse::<u64>() {
            Ok(parsed) if parsed > 0 => settings.request_timeout_seconds = parsed,
            _ => warn!(value = %v, "ignoring invalid request_timeout_seconds in config file"),
        }
    }
    if let Some(v) = text("session_ttl_seconds") {
        match v.parse::<i64>() {
            Ok(parsed) if parsed > 0 => settings.session_ttl_seconds = parsed,
            _ => warn!(value = %v, "ignoring invalid session_ttl_seconds in config file"),
        }
    }
}

/// Later keys in each list win, so `APP__*` overrides the bare name.
fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    let last = |keys: &[&str]| keys.iter().filter_map(|key| lookup(*key)).last();

    if let Some(v) = last(&["SERVER_BIND", "APP__BIND_ADDR"]) {
        settings.server_bind = v;
    }
    if let Some(v) = last(&["DATABASE_URL", "APP__DATABASE_URL"]) {
        settings.database_url = v;
    }
    if let Some(v) = last(&["SESSION_SECRET", "APP__SESSION_SECRET"]) {
        settings.session_secret = v;
    }
    if let Some(v) = last(&["GOOGLE_MAPS_API_KEY", "APP__GOOGLE_MAPS_API_KEY"]) {
        settings.google_maps_api_key = Some(v).filter(|key| !key.trim().is_empty());
    }
    if let Some(v) = last(&["APP__DEPOT_ADDRESS"]) {
        settings.depot_address = v;
    }
    if let Some(v) = last(&["APP__REQUEST_TIMEOUT_SECONDS"]) {
        match v.parse::<u64>() {
            Ok(parsed) if parsed > 0 => settings.request_timeout_seconds = parsed,
            _ => warn!(value = %v, "ignoring invalid APP__REQUEST_TIMEOUT_SECONDS"),
        }
    }
    if let Some(v) = last(&["APP__SESSION_TTL_SECONDS"]) {
        match v.parse::<i64>() {
            Ok(parsed) if parsed > 0 => settings.session_ttl_seconds = parsed,
            _ => warn!(value = %v, "ignoring invalid APP__SESSION_TTL_SECONDS"),
        }
    }
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

    if raw_database_url.starts_with("sqlite:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(parent) = sqlite_path(database_url)
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
    else {
        return Ok(());
    };

    fs::create_dir_all(&parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    (!path.is_empty()).then(|| PathBuf::from(path))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
