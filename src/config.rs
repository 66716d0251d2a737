//! Service configuration, loaded from `PERSISTO_*` environment variables
//! (a `.env` file is honored through `dotenvy` before the first read).

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Top-level configuration for the service.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub settings: Settings,
    pub storage: StorageConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub name: String,
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(15),
            name: "persisto".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Structured logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some(PathBuf::from("logs.log")),
        }
    }
}

/// Placement policy knobs.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Promote/demote databases automatically based on access patterns.
    pub auto_stage_movement: bool,
    /// Stage newly created databases land on.
    pub default_creation_stage: u8,
    /// Highest tier from which data must never be implicitly evicted.
    pub persistence_stage: u8,
    /// Inactivity window after which a database is demoted.
    pub stage_timeout: Duration,
    /// Request count at which a promotion is scheduled.
    pub request_count_threshold: u64,
    /// Propagate writes to every tier above the active one.
    pub auto_sync_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_stage_movement: true,
            default_creation_stage: 3,
            persistence_stage: 3,
            stage_timeout: Duration::from_secs(300),
            request_count_threshold: 2,
            auto_sync_enabled: true,
        }
    }
}

/// Per-tier backend configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub memory: MemoryStageConfig,
    pub local: LocalStageConfig,
    pub remote: RemoteStageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            memory: MemoryStageConfig { stage_number: 1 },
            local: LocalStageConfig {
                stage_number: 2,
                directory_path: PathBuf::from("./storage"),
            },
            remote: RemoteStageConfig {
                stage_number: 3,
                access_key: String::new(),
                secret_key: String::new(),
                bucket: String::new(),
                endpoint: String::new(),
                region: "auto".to_string(),
                max_cache_bytes: 100 * 1024 * 1024,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryStageConfig {
    pub stage_number: u8,
}

#[derive(Debug, Clone)]
pub struct LocalStageConfig {
    pub stage_number: u8,
    pub directory_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RemoteStageConfig {
    pub stage_number: u8,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub endpoint: String,
    pub region: String,
    /// Upper bound for the per-handle sector cache.
    pub max_cache_bytes: usize,
}

impl Config {
    /// Read the full configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let server_defaults = ServerConfig::default();
        let settings_defaults = Settings::default();
        let storage_defaults = StorageConfig::default();
        let logging_defaults = LoggingConfig::default();

        Ok(Self {
            server: ServerConfig {
                port: env_parse("PERSISTO_SERVER_PORT", server_defaults.port)?,
                read_timeout: env_secs("PERSISTO_SERVER_READ_TIMEOUT_S", 10)?,
                write_timeout: env_secs("PERSISTO_SERVER_WRITE_TIMEOUT_S", 10)?,
                idle_timeout: env_secs("PERSISTO_SERVER_IDLE_TIMEOUT_S", 15)?,
                name: env_string("PERSISTO_SERVER_NAME", &server_defaults.name),
                version: server_defaults.version,
            },
            logging: LoggingConfig {
                level: env_string("PERSISTO_LOG_LEVEL", &logging_defaults.level),
                file: match env::var("PERSISTO_LOG_FILE") {
                    Ok(v) if v.is_empty() => None,
                    Ok(v) => Some(PathBuf::from(v)),
                    Err(_) => logging_defaults.file,
                },
            },
            settings: Settings {
                auto_stage_movement: env_bool(
                    "PERSISTO_AUTO_STAGE_MOVEMENT",
                    settings_defaults.auto_stage_movement,
                )?,
                default_creation_stage: env_parse(
                    "PERSISTO_DEFAULT_CREATION_STAGE",
                    settings_defaults.default_creation_stage,
                )?,
                persistence_stage: env_parse(
                    "PERSISTO_PERSISTENCE_STAGE",
                    settings_defaults.persistence_stage,
                )?,
                stage_timeout: env_secs("PERSISTO_STAGE_TIMEOUT_S", 300)?,
                request_count_threshold: env_parse(
                    "PERSISTO_REQUEST_COUNT_THRESHOLD",
                    settings_defaults.request_count_threshold,
                )?,
                auto_sync_enabled: env_bool(
                    "PERSISTO_AUTO_SYNC_ENABLED",
                    settings_defaults.auto_sync_enabled,
                )?,
            },
            storage: StorageConfig {
                memory: MemoryStageConfig {
                    stage_number: env_parse(
                        "PERSISTO_STORAGE_MEMORY_STAGE",
                        storage_defaults.memory.stage_number,
                    )?,
                },
                local: LocalStageConfig {
                    stage_number: env_parse(
                        "PERSISTO_STORAGE_LOCAL_STAGE",
                        storage_defaults.local.stage_number,
                    )?,
                    directory_path: PathBuf::from(env_string(
                        "PERSISTO_STORAGE_LOCAL_DIR",
                        "./storage",
                    )),
                },
                remote: RemoteStageConfig {
                    stage_number: env_parse(
                        "PERSISTO_STORAGE_REMOTE_STAGE",
                        storage_defaults.remote.stage_number,
                    )?,
                    access_key: env_string("PERSISTO_STORAGE_REMOTE_ACCESS_KEY", ""),
                    secret_key: env_string("PERSISTO_STORAGE_REMOTE_SECRET_KEY", ""),
                    bucket: env_string("PERSISTO_STORAGE_REMOTE_BUCKET", ""),
                    endpoint: env_string("PERSISTO_STORAGE_REMOTE_ENDPOINT", ""),
                    region: env_string("PERSISTO_STORAGE_REMOTE_REGION", "auto"),
                    max_cache_bytes: env_parse(
                        "PERSISTO_STORAGE_REMOTE_MAX_CACHE_BYTES",
                        storage_defaults.remote.max_cache_bytes,
                    )?,
                },
            },
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| Error::Config {
            detail: format!("{key}={raw:?} is not a valid value"),
        }),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(key, default)?))
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(Error::Config {
                detail: format!("{key}={raw:?} is not a valid boolean"),
            }),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults() {
        let settings = Settings::default();
        assert!(settings.auto_stage_movement);
        assert_eq!(settings.default_creation_stage, 3);
        assert_eq!(settings.persistence_stage, 3);
        assert_eq!(settings.stage_timeout, Duration::from_secs(300));
        assert_eq!(settings.request_count_threshold, 2);
        assert!(settings.auto_sync_enabled);
    }

    #[test]
    fn server_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.port, 8080);
        assert_eq!(server.read_timeout, Duration::from_secs(10));
        assert_eq!(server.idle_timeout, Duration::from_secs(15));
    }

    #[test]
    fn storage_defaults() {
        let storage = StorageConfig::default();
        assert_eq!(storage.memory.stage_number, 1);
        assert_eq!(storage.local.stage_number, 2);
        assert_eq!(storage.remote.stage_number, 3);
        assert_eq!(storage.remote.region, "auto");
        assert_eq!(storage.remote.max_cache_bytes, 100 * 1024 * 1024);
    }

    #[test]
    fn bool_parsing() {
        for (raw, expected) in [("1", true), ("TRUE", true), ("off", false), ("No", false)] {
            std::env::set_var("PERSISTO_TEST_BOOL", raw);
            assert_eq!(env_bool("PERSISTO_TEST_BOOL", !expected).unwrap(), expected);
        }
        std::env::set_var("PERSISTO_TEST_BOOL", "maybe");
        assert!(env_bool("PERSISTO_TEST_BOOL", true).is_err());
        std::env::remove_var("PERSISTO_TEST_BOOL");
    }
}
