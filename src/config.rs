use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::Source;
use crate::error::HarvestError;
use crate::registry::SourceRegistry;

pub const DEFAULT_MAX_AGE_HOURS: u64 = 24;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_BATCH_SIZE: u64 = 1000;
pub const DEFAULT_MAX_BATCHES: usize = 500;
pub const DEFAULT_MAX_RETRIES: usize = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 200;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub settings: SettingsEntry,
    #[serde(default)]
    pub sources: Vec<Source>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SettingsEntry {
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub max_age_hours: Option<u64>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub batch_size: Option<u64>,
    #[serde(default)]
    pub max_batches: Option<usize>,
    #[serde(default)]
    pub max_retries: Option<usize>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub cache_dir: Utf8PathBuf,
    pub output_dir: Utf8PathBuf,
    pub max_age_hours: u64,
    pub concurrency: usize,
    pub batch_size: u64,
    pub max_batches: usize,
    pub max_retries: usize,
    pub retry_delay: Duration,
}

impl Settings {
    pub fn validate(&self) -> Result<(), HarvestError> {
        if self.concurrency == 0 {
            return Err(HarvestError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(HarvestError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.max_batches == 0 {
            return Err(HarvestError::InvalidConfig(
                "max_batches must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub settings: Settings,
    pub registry: SourceRegistry,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("parcel-harvest.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(HarvestError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| HarvestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, HarvestError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(HarvestError::InvalidConfig(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let entry = config.settings;
        let cache_dir = match entry.cache_dir {
            Some(dir) => Utf8PathBuf::from(dir),
            None => default_cache_dir()?,
        };
        let settings = Settings {
            cache_dir,
            output_dir: Utf8PathBuf::from(entry.output_dir.unwrap_or_else(|| "data".to_string())),
            max_age_hours: entry.max_age_hours.unwrap_or(DEFAULT_MAX_AGE_HOURS),
            concurrency: entry.concurrency.unwrap_or(DEFAULT_CONCURRENCY),
            batch_size: entry.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            max_batches: entry.max_batches.unwrap_or(DEFAULT_MAX_BATCHES),
            max_retries: entry.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_delay: Duration::from_millis(
                entry.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
            ),
        };
        settings.validate()?;

        Ok(ResolvedConfig {
            schema_version,
            settings,
            registry: SourceRegistry::new(config.sources)?,
        })
    }
}

pub fn default_cache_dir() -> Result<Utf8PathBuf, HarvestError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("parcel-harvest")).ok()
        })
        .ok_or_else(|| HarvestError::Filesystem("unable to resolve cache directory".to_string()))
}
