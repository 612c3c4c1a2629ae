//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS (comma-separated)
    pub client_origin: String,
    /// Bearer token required by the publish endpoint
    pub admin_token: String,

    /// Supabase project URL (persistence is in-memory when absent)
    pub supabase_url: Option<String>,
    /// Supabase service role key
    pub supabase_service_role_key: Option<String>,

    /// Gemini API key (AI collaborator is unavailable when absent)
    pub gemini_api_key: Option<String>,

    /// Knobs handed to every room
    pub engine: EngineConfig,
}

/// Per-room simulation settings
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Simulation ticks per second
    pub tick_rate: u32,
    /// How long an empty room stays in memory before hibernating
    pub hibernate_grace: Duration,
    /// Decimal places kept for numeric snapshot fields
    pub snapshot_precision: u32,
    /// Cell size of the broad-phase grids
    pub grid_cell_size: f64,
    /// Largest width or height an entity may have
    pub max_entity_size: f64,
    /// Edge length of one world block
    pub block_size: f64,
    /// Downward acceleration in px/s²
    pub gravity: f64,
    /// Terminal fall speed in px/s
    pub max_fall_speed: f64,
    /// Blocks placed from the build queue per tick
    pub build_blocks_per_tick: usize,
    /// Sandbox operation budget per hook call
    pub script_max_operations: u64,
    /// Sandbox call depth limit
    pub script_max_call_levels: usize,
    /// Persistence attempts before a hibernation save is given up
    pub save_retries: u32,
    /// Model used when a script does not name one
    pub default_ai_model: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            hibernate_grace: Duration::from_secs(10),
            snapshot_precision: 2,
            grid_cell_size: 64.0,
            max_entity_size: 2048.0,
            block_size: 40.0,
            gravity: 1800.0,
            max_fall_speed: 900.0,
            build_blocks_per_tick: 2,
            script_max_operations: 500_000,
            script_max_call_levels: 64,
            save_retries: 3,
            default_ai_model: "gemini-2.5-flash".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            client_origin: env::var("CLIENT_ORIGIN").unwrap_or_else(|_| "*".to_string()),
            admin_token: env::var("ADMIN_TOKEN").map_err(|_| ConfigError::Missing("ADMIN_TOKEN"))?,

            supabase_url: env::var("SUPABASE_URL").ok(),
            supabase_service_role_key: env::var("SUPABASE_SERVICE_ROLE_KEY").ok(),
            gemini_api_key: env::var("GEMINI_API_KEY").ok(),

            engine: EngineConfig::from_env()?,
        })
    }
}

impl EngineConfig {
    /// Read engine overrides, keeping defaults for unset keys
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            tick_rate: parse_or("TICK_RATE", defaults.tick_rate)?.max(1),
            hibernate_grace: Duration::from_secs(parse_or(
                "HIBERNATE_GRACE_SECS",
                defaults.hibernate_grace.as_secs(),
            )?),
            snapshot_precision: parse_or("SNAPSHOT_PRECISION", defaults.snapshot_precision)?,
            grid_cell_size: parse_or("GRID_CELL_SIZE", defaults.grid_cell_size)?,
            max_entity_size: parse_or("MAX_ENTITY_SIZE", defaults.max_entity_size)?.max(1.0),
            block_size: parse_or("BLOCK_SIZE", defaults.block_size)?,
            gravity: parse_or("GRAVITY", defaults.gravity)?,
            max_fall_speed: parse_or("MAX_FALL_SPEED", defaults.max_fall_speed)?,
            build_blocks_per_tick: parse_or("BUILD_BLOCKS_PER_TICK", defaults.build_blocks_per_tick)?,
            script_max_operations: parse_or("SCRIPT_MAX_OPERATIONS", defaults.script_max_operations)?,
            script_max_call_levels: parse_or(
                "SCRIPT_MAX_CALL_LEVELS",
                defaults.script_max_call_levels,
            )?,
            save_retries: parse_or("SAVE_RETRIES", defaults.save_retries)?.max(1),
            default_ai_model: env::var("GEMINI_MODEL").unwrap_or(defaults.default_ai_model),
        })
    }
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_or_falls_back_and_rejects_garbage() {
        env::remove_var("ROOM_ENGINE_TEST_UNSET");
        assert_eq!(parse_or("ROOM_ENGINE_TEST_UNSET", 7u32).unwrap(), 7);

        env::set_var("ROOM_ENGINE_TEST_BAD", "not-a-number");
        assert!(matches!(
            parse_or::<u32>("ROOM_ENGINE_TEST_BAD", 7),
            Err(ConfigError::Invalid("ROOM_ENGINE_TEST_BAD"))
        ));
        env::remove_var("ROOM_ENGINE_TEST_BAD");
    }
}
