use secrecy::SecretString;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;
use url::Url;

/// Provider endpoint used when `ASSEMBLY_AI_WS_URL` is not set.
pub const DEFAULT_UPSTREAM_URL: &str = "wss://streaming.assemblyai.com/v3/ws";

/// Credential variable names, in order of precedence.
pub const API_KEY_VARS: [&str; 2] = ["ASSEMBLY_AI_TOKEN", "VUE_APP_ASSEMBLY_AI_TOKEN"];

pub const MIN_SILENCE_VAR: &str = "MIN_SILENCE_THRESHOLD";
pub const MAX_SILENCE_VAR: &str = "MAX_SILENCE_THRESHOLD";
pub const END_OF_TURN_VAR: &str = "END_OF_TURN_THRESHOLD";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Deployment mode. Only `Production` changes startup behaviour.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

/// Threshold values exactly as they appear in the environment.
///
/// These are validated per session rather than at startup, so a bad value
/// fails the sessions that need it instead of the whole process.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawThresholds {
    pub min_silence: Option<String>,
    pub max_silence: Option<String>,
    pub end_of_turn: Option<String>,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub log_level: Level,
    pub environment: Environment,
    pub upstream_url: Url,
    pub api_key: Option<SecretString>,
    pub thresholds: RawThresholds,
    pub upstream_debug: bool,
    pub handshake_timeout: Duration,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3001".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let environment = match std::env::var("APP_ENV")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "production" => Environment::Production,
            _ => Environment::Development,
        };

        let upstream_url_str =
            std::env::var("ASSEMBLY_AI_WS_URL").unwrap_or_else(|_| DEFAULT_UPSTREAM_URL.to_string());
        let upstream_url = Url::parse(&upstream_url_str).map_err(|e| {
            ConfigError::InvalidValue("ASSEMBLY_AI_WS_URL".to_string(), e.to_string())
        })?;
        if !matches!(upstream_url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidValue(
                "ASSEMBLY_AI_WS_URL".to_string(),
                format!("unsupported scheme '{}'", upstream_url.scheme()),
            ));
        }

        let api_key = API_KEY_VARS
            .iter()
            .filter_map(|name| non_empty_var(name))
            .next()
            .map(SecretString::from);

        let thresholds = RawThresholds {
            min_silence: non_empty_var(MIN_SILENCE_VAR),
            max_silence: non_empty_var(MAX_SILENCE_VAR),
            end_of_turn: non_empty_var(END_OF_TURN_VAR),
        };

        let upstream_debug = std::env::var("REALTIME_DEBUG")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let handshake_timeout = match std::env::var("HANDSHAKE_TIMEOUT_SECS") {
            Ok(v) => v.parse::<u64>().map(Duration::from_secs).map_err(|e| {
                ConfigError::InvalidValue("HANDSHAKE_TIMEOUT_SECS".to_string(), e.to_string())
            })?,
            Err(_) => Duration::from_secs(10),
        };

        if environment == Environment::Production && api_key.is_none() {
            return Err(ConfigError::MissingVar(format!(
                "{} must be set in production",
                API_KEY_VARS[0]
            )));
        }

        Ok(Self {
            bind_address,
            log_level,
            environment,
            upstream_url,
            api_key,
            thresholds,
            upstream_debug,
            handshake_timeout,
        })
    }
}

/// Reads a variable, treating an empty value the same as an unset one.
fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
