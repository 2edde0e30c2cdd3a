/// Configuration management for the Strandway engine
///
/// Handles server configuration, database location, and engine parameters.

use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Engine configuration
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

/// SQLite storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding the engine database (default: "data")
    pub data_dir: String,
}

/// Execution engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default iteration cap for whileLoop nodes
    pub loop_limit: usize,
    /// Bearer token guarding the scheduler poll endpoint; unset disables
    /// auth (local development only)
    pub scheduler_token: Option<String>,
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("STRANDWAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("STRANDWAY_PORT")
                    .unwrap_or_else(|_| "3010".to_string())
                    .parse()
                    .unwrap_or(3010),
            },
            database: DatabaseConfig {
                data_dir: std::env::var("STRANDWAY_DATA_DIR")
                    .unwrap_or_else(|_| "data".to_string()),
            },
            engine: EngineConfig {
                loop_limit: std::env::var("STRANDWAY_LOOP_LIMIT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(100),
                scheduler_token: std::env::var("STRANDWAY_SCHEDULER_TOKEN").ok(),
            },
        }
    }
}
