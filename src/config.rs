use anyhow::{Context, Result};
use std::path::{Component, PathBuf};

use crate::units::UnitSystem;

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub database_url: String,
    pub data_root: PathBuf,
    pub compile_interval_seconds: u64,
    pub timezone: chrono_tz::Tz,
    pub unit_system: UnitSystem,
}

impl RecorderConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("RECORDER_DATABASE_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .context("RECORDER_DATABASE_URL must be set for the recorder runtime")?;
        let database_url = normalize_database_url(database_url);

        let data_root = env_path("RECORDER_DATA_ROOT", "/var/lib/stats-recorder")?;
        validate_data_root(&data_root)?;

        let compile_interval_seconds =
            env_u64("RECORDER_COMPILE_INTERVAL_SECONDS", 300).clamp(60, 3600);

        let timezone = match env_optional_string("RECORDER_TIMEZONE") {
            Some(name) => name
                .parse::<chrono_tz::Tz>()
                .map_err(|err| anyhow::anyhow!("invalid RECORDER_TIMEZONE {name:?}: {err}"))?,
            None => system_timezone(),
        };

        let unit_system = match env_string("RECORDER_UNIT_SYSTEM", "metric").as_str() {
            "metric" => UnitSystem::Metric,
            "imperial" => UnitSystem::Imperial,
            other => anyhow::bail!("RECORDER_UNIT_SYSTEM must be metric or imperial, got {other:?}"),
        };

        Ok(Self {
            database_url,
            data_root,
            compile_interval_seconds,
            timezone,
            unit_system,
        })
    }
}

fn system_timezone() -> chrono_tz::Tz {
    iana_time_zone::get_timezone()
        .ok()
        .and_then(|name| name.parse::<chrono_tz::Tz>().ok())
        .unwrap_or(chrono_tz::UTC)
}

fn validate_data_root(path: &PathBuf) -> Result<()> {
    if !path.is_absolute() {
        anyhow::bail!("RECORDER_DATA_ROOT must be an absolute path");
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            anyhow::bail!("RECORDER_DATA_ROOT must not contain '..' segments");
        }
    }
    Ok(())
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_path(key: &str, default: &str) -> Result<PathBuf> {
    let value = env_optional_string(key).unwrap_or_else(|| default.to_string());
    let path = PathBuf::from(value);
    if path.as_os_str().is_empty() {
        anyhow::bail!("{key} resolved to an empty path");
    }
    Ok(path)
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_or_parent_data_root() {
        assert!(validate_data_root(&PathBuf::from("relative/path")).is_err());
        assert!(validate_data_root(&PathBuf::from("/var/../etc")).is_err());
        assert!(validate_data_root(&PathBuf::from("/var/lib/stats-recorder")).is_ok());
    }

    #[test]
    fn normalizes_sqlalchemy_style_urls() {
        assert_eq!(
            normalize_database_url("postgresql+psycopg://u@h/db".to_string()),
            "postgresql://u@h/db"
        );
        assert_eq!(
            normalize_database_url("postgresql://u@h/db".to_string()),
            "postgresql://u@h/db"
        );
    }
}
