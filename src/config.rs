use serde::Deserialize;
use std::path::Path;

use crate::communication::TransportKind;

pub const CONNECTION_TIMEOUT_ENV: &str = "VSTEST_CONNECTION_TIMEOUT";
pub const MAX_CONNECTION_TIMEOUT_MS: u64 = 3_600_000;
pub const MAX_CACHE_SIZE: usize = 1_000_000;

/// All configurable settings with their defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct HostSettings {
    pub connection_timeout_ms: u64,
    pub discovery_cache_size: usize,
    pub discovery_cache_timeout_ms: u64,
    pub run_cache_size: usize,
    pub run_cache_timeout_ms: u64,
    pub logger_queue_length: usize,
    pub logger_queue_size: usize,
    pub logger_queue_bounds: bool,
    pub transport: TransportKind,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 90_000,
            discovery_cache_size: 1_000,
            discovery_cache_timeout_ms: 1_500,
            run_cache_size: 100,
            run_cache_timeout_ms: 1_000,
            logger_queue_length: 500,
            logger_queue_size: 25_000_000,
            logger_queue_bounds: true,
            transport: TransportKind::Tcp,
        }
    }
}

/// Raw JSON representation; every field is optional so files can override a subset.
#[derive(Debug, Deserialize, Default)]
struct SettingsFile {
    #[serde(rename = "connection.timeoutMs")]
    connection_timeout_ms: Option<u64>,
    #[serde(rename = "discovery.cacheSize")]
    discovery_cache_size: Option<usize>,
    #[serde(rename = "discovery.cacheTimeoutMs")]
    discovery_cache_timeout_ms: Option<u64>,
    #[serde(rename = "run.cacheSize")]
    run_cache_size: Option<usize>,
    #[serde(rename = "run.cacheTimeoutMs")]
    run_cache_timeout_ms: Option<u64>,
    #[serde(rename = "logger.queueLength")]
    logger_queue_length: Option<usize>,
    #[serde(rename = "logger.queueSize")]
    logger_queue_size: Option<usize>,
    #[serde(rename = "logger.queueBounds")]
    logger_queue_bounds: Option<bool>,
    #[serde(rename = "connection.transport")]
    transport: Option<String>,
}

/// Resolve settings: defaults → user global → project-local → environment.
pub fn resolve(project_root: Option<&Path>) -> HostSettings {
    let global_path = dirs::home_dir().map(|h| h.join(".vstest/settings.json"));
    let project_path = project_root.map(|r| r.join(".vstest/settings.json"));
    let mut settings = resolve_with_paths(global_path.as_deref(), project_path.as_deref());
    apply_env(&mut settings, std::env::var(CONNECTION_TIMEOUT_ENV).ok().as_deref());
    settings
}

/// Testable resolver that accepts explicit file paths (no home dir dependency).
fn resolve_with_paths(global_path: Option<&Path>, project_path: Option<&Path>) -> HostSettings {
    let mut settings = HostSettings::default();

    if let Some(path) = global_path {
        apply_file(&mut settings, path);
    }
    if let Some(path) = project_path {
        apply_file(&mut settings, path);
    }

    settings
}

/// `VSTEST_CONNECTION_TIMEOUT` is in seconds.
fn apply_env(settings: &mut HostSettings, timeout_secs: Option<&str>) {
    let Some(raw) = timeout_secs else { return };
    let millis = raw.trim().parse::<u64>().ok().and_then(|s| s.checked_mul(1000));
    match millis {
        Some(ms) if ms > 0 && ms <= MAX_CONNECTION_TIMEOUT_MS => {
            settings.connection_timeout_ms = ms;
        }
        _ => tracing::warn!(
            "{} ({}) is not a valid number of seconds, ignoring",
            CONNECTION_TIMEOUT_ENV,
            raw
        ),
    }
}

fn apply_file(settings: &mut HostSettings, path: &Path) {
    let Ok(content) = std::fs::read_to_string(path) else { return };
    let Ok(file) = serde_json::from_str::<SettingsFile>(&content) else {
        tracing::warn!("Invalid settings file, ignoring: {}", path.display());
        return;
    };

    if let Some(v) = file.connection_timeout_ms {
        if (1_000..=MAX_CONNECTION_TIMEOUT_MS).contains(&v) {
            settings.connection_timeout_ms = v;
        } else {
            tracing::warn!(
                "connection.timeoutMs ({}) out of range (1000..{}), using default",
                v, MAX_CONNECTION_TIMEOUT_MS
            );
        }
    }
    if let Some(v) = file.discovery_cache_size {
        if v > 0 && v <= MAX_CACHE_SIZE {
            settings.discovery_cache_size = v;
        } else {
            tracing::warn!(
                "discovery.cacheSize ({}) out of range (1..{}), using default",
                v, MAX_CACHE_SIZE
            );
        }
    }
    if let Some(v) = file.discovery_cache_timeout_ms {
        settings.discovery_cache_timeout_ms = v;
    }
    if let Some(v) = file.run_cache_size {
        if v > 0 && v <= MAX_CACHE_SIZE {
            settings.run_cache_size = v;
        } else {
            tracing::warn!(
                "run.cacheSize ({}) out of range (1..{}), using default",
                v, MAX_CACHE_SIZE
            );
        }
    }
    if let Some(v) = file.run_cache_timeout_ms {
        settings.run_cache_timeout_ms = v;
    }
    if let Some(v) = file.logger_queue_length {
        if v > 0 {
            settings.logger_queue_length = v;
        } else {
            tracing::warn!("logger.queueLength must be at least 1, using default");
        }
    }
    if let Some(v) = file.logger_queue_size {
        if v > 0 {
            settings.logger_queue_size = v;
        } else {
            tracing::warn!("logger.queueSize must be at least 1, using default");
        }
    }
    if let Some(v) = file.logger_queue_bounds {
        settings.logger_queue_bounds = v;
    }
    if let Some(v) = file.transport {
        match v.parse::<TransportKind>() {
            Ok(kind) => settings.transport = kind,
            Err(_) => tracing::warn!(
                "connection.transport ({}) must be \"tcp\" or \"unix\", using default",
                v
            ),
        }
    }
}
