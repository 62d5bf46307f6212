/// Configuration management for the flowrun engine
///
/// Handles server configuration, the data directory, and runtime parameters.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Executor and scheduler configuration
    pub engine: EngineConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Base directory for the database (default: "data")
    /// Creates: flowrun.db
    pub data_dir: String,
}

impl DatabaseConfig {
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("flowrun.db")
    }
}

/// Executor and scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Concurrency ceiling for flow executions
    pub max_workers: usize,
    /// Scheduler heartbeat in seconds
    pub heartbeat_secs: u64,
    /// How late a cron boundary may be evaluated and still fire
    pub misfire_grace_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: env_or("FLOWRUN_MAX_WORKERS", 4),
            heartbeat_secs: env_or("FLOWRUN_HEARTBEAT_SECS", 1),
            misfire_grace_secs: env_or("FLOWRUN_MISFIRE_GRACE_SECS", 30),
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("FLOWRUN_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("FLOWRUN_PORT", 3004),
            },
            database: DatabaseConfig {
                data_dir: std::env::var("FLOWRUN_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            },
            engine: EngineConfig::default(),
        }
    }
}

/// Parse an env var, falling back on absence or a bad value
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
