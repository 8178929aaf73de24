/**
 * Server Configuration
 *
 * Configuration is loaded from environment variables with sensible defaults
 * for local development:
 *
 * - `COEDIT_BIND_ADDR`              (default "0.0.0.0")
 * - `COEDIT_PORT`                   (default 9980)
 * - `COEDIT_CHILD_ROOT`             jail root      (default "./jails")
 * - `COEDIT_CACHE_ROOT`             tile cache     (default "./cache")
 * - `COEDIT_TOKENDB_PATH`           token ledger; unset disables replay checks
 * - `COEDIT_KIT_COMMAND`            kit child command; unset disables the spawner
 * - `COEDIT_KIT_PREWARM`            pool target    (default 1)
 * - `COEDIT_IDLE_TIMEOUT_SECS`      (default 3600)
 * - `COEDIT_AUTOSAVE_SECS`          (default 30)
 * - `COEDIT_COMMAND_TIMEOUT_SECS`   (default 30)
 * - `COEDIT_SSL_ENABLE`             (default false)
 * - `COEDIT_SSL_TERMINATION`        (default false)
 * - `COEDIT_TILE_CACHE_PERSISTENT`  (default false)
 */

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::broker::document::{DEFAULT_COMMAND_TIMEOUT, POLL_TIMEOUT};

/// Configuration errors are fatal at startup; there is no point running
/// with a half-understood environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    BadValue {
        /// The environment variable
        key: String,
        /// The rejected value
        value: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Interface to bind the acceptor to
    pub bind_addr: String,
    /// TCP port to listen on
    pub port: u16,
    /// Root under which each kit's jail directory lives
    pub child_root: PathBuf,
    /// Root of the on-disk tile cache
    pub cache_root: PathBuf,
    /// Token ledger database; `None` disables replay protection
    pub tokendb_path: Option<PathBuf>,
    /// Command line for spawning kit children; `None` disables the spawner
    pub kit_command: Option<String>,
    /// How many kits the spawner keeps prewarmed
    pub kit_prewarm: usize,
    /// Inactivity threshold after which a broker self-destructs
    pub idle_timeout: Duration,
    /// Cadence of the forced autosave tick
    pub autosave_interval: Duration,
    /// Per-command deadline bounding saves and kit acquisition
    pub command_timeout: Duration,
    /// Broker loop tick; timers run at this cadence regardless of traffic
    pub poll_timeout: Duration,
    pub ssl_enabled: bool,
    pub ssl_termination: bool,
    /// Keep rendered tiles across broker teardowns
    pub tile_cache_persistent: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 9980,
            child_root: PathBuf::from("./jails"),
            cache_root: PathBuf::from("./cache"),
            tokendb_path: None,
            kit_command: None,
            kit_prewarm: 1,
            idle_timeout: Duration::from_secs(3600),
            autosave_interval: Duration::from_secs(30),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            poll_timeout: POLL_TIMEOUT,
            ssl_enabled: false,
            ssl_termination: false,
            tile_cache_persistent: false,
        }
    }
}

impl Config {
    /// Construct a `Config` from environment variables, falling back to
    /// the defaults above.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();
        Ok(Config {
            bind_addr: env::var("COEDIT_BIND_ADDR").unwrap_or(defaults.bind_addr),
            port: read_env_or("COEDIT_PORT", defaults.port)?,
            child_root: env::var("COEDIT_CHILD_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.child_root),
            cache_root: env::var("COEDIT_CACHE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_root),
            tokendb_path: env::var("COEDIT_TOKENDB_PATH").ok().map(PathBuf::from),
            kit_command: env::var("COEDIT_KIT_COMMAND").ok().filter(|c| !c.is_empty()),
            kit_prewarm: read_env_or("COEDIT_KIT_PREWARM", defaults.kit_prewarm)?,
            idle_timeout: Duration::from_secs(read_env_or(
                "COEDIT_IDLE_TIMEOUT_SECS",
                defaults.idle_timeout.as_secs(),
            )?),
            autosave_interval: Duration::from_secs(read_env_or(
                "COEDIT_AUTOSAVE_SECS",
                defaults.autosave_interval.as_secs(),
            )?),
            command_timeout: Duration::from_secs(read_env_or(
                "COEDIT_COMMAND_TIMEOUT_SECS",
                defaults.command_timeout.as_secs(),
            )?),
            poll_timeout: defaults.poll_timeout,
            ssl_enabled: read_env_flag("COEDIT_SSL_ENABLE"),
            ssl_termination: read_env_flag("COEDIT_SSL_TERMINATION"),
            tile_cache_persistent: read_env_flag("COEDIT_TILE_CACHE_PERSISTENT"),
        })
    }

    /// Convenience: `addr:port` socket string.
    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

fn read_env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
{
    match env::var(key) {
        Ok(value) => value.parse::<T>().map_err(|_| ConfigError::BadValue {
            key: key.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

fn read_env_flag(key: &str) -> bool {
    matches!(
        env::var(key).as_deref(),
        Ok("1") | Ok("true") | Ok("yes") | Ok("on")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 9980);
        assert_eq!(config.idle_timeout, Duration::from_secs(3600));
        assert_eq!(config.autosave_interval, Duration::from_secs(30));
        assert!(config.tokendb_path.is_none());
        assert!(!config.tile_cache_persistent);
    }

    #[test]
    fn test_socket_addr_string() {
        let config = Config {
            bind_addr: "127.0.0.1".to_string(),
            port: 9981,
            ..Config::default()
        };
        assert_eq!(config.socket_addr_string(), "127.0.0.1:9981");
    }
}
