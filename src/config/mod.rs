//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Durable store REST URL (PostgREST endpoint)
    pub store_url: String,
    /// Service key for the store (bypasses row security - server only!)
    pub store_service_key: String,
    /// Shared secret for bearer token verification
    pub auth_token_secret: String,

    /// Allowed client origin for CORS
    pub client_origin: String,

    /// Default per-turn duration in seconds for new sessions
    pub default_turn_seconds: u32,
    /// Heartbeat probe interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Seconds a socket may stay silent before it is considered dead
    pub heartbeat_timeout_secs: u64,

    /// How many public lobbies host bots try to keep open
    pub bot_min_public_lobbies: usize,
    /// Bot polling interval in milliseconds
    pub bot_poll_millis: u64,
    /// Seconds a host bot waits for a human before abandoning its lobby
    pub bot_lobby_wait_secs: u64,
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

            store_url: env::var("STORE_URL").map_err(|_| ConfigError::Missing("STORE_URL"))?,
            store_service_key: env::var("STORE_SERVICE_KEY")
                .map_err(|_| ConfigError::Missing("STORE_SERVICE_KEY"))?,
            auth_token_secret: env::var("AUTH_TOKEN_SECRET")
                .map_err(|_| ConfigError::Missing("AUTH_TOKEN_SECRET"))?,

            client_origin: env::var("CLIENT_ORIGIN")
                .map_err(|_| ConfigError::Missing("CLIENT_ORIGIN"))?,

            default_turn_seconds: parse_or("DEFAULT_TURN_SECONDS", 30)?,
            heartbeat_interval_secs: parse_or("HEARTBEAT_INTERVAL_SECS", 15)?,
            heartbeat_timeout_secs: parse_or("HEARTBEAT_TIMEOUT_SECS", 45)?,

            bot_min_public_lobbies: parse_or("BOT_MIN_PUBLIC_LOBBIES", 1)?,
            bot_poll_millis: parse_or("BOT_POLL_MILLIS", 2000)?,
            bot_lobby_wait_secs: parse_or("BOT_LOBBY_WAIT_SECS", 120)?,
        })
    }
}

fn parse_or<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid(key)),
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
