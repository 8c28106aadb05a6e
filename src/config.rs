//! Runtime configuration
//!
//! Everything is read once from the environment (after `dotenv`) in the binary
//! entry points and passed down explicitly.

use crate::error::OrchestrationError;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.8;
pub const DEFAULT_MAX_RETRIES: u32 = 4;
pub const DEFAULT_BLOCKING_LIMIT: u32 = 2;
pub const DEFAULT_MISSING_INPUT_LIMIT: u32 = 3;
pub const DEFAULT_MAX_ROUNDS_PER_TURN: u32 = 8;
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

/// Circuit breaker thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub max_retries: u32,
    pub blocking_limit: u32,
    pub missing_input_limit: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            blocking_limit: DEFAULT_BLOCKING_LIMIT,
            missing_input_limit: DEFAULT_MISSING_INPUT_LIMIT,
        }
    }
}

/// Knobs of the dispatch loop
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub confidence_threshold: f64,
    pub breaker: BreakerConfig,
    pub max_rounds_per_turn: u32,
    pub classifier_timeout: Duration,
    pub worker_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            breaker: BreakerConfig::default(),
            max_rounds_per_turn: DEFAULT_MAX_ROUNDS_PER_TURN,
            classifier_timeout: Duration::from_secs(20),
            worker_timeout: Duration::from_secs(60),
        }
    }
}

/// Process-level configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub semantic_search_url: Option<String>,
    pub database_url: Option<String>,
    pub port: u16,
    pub routing_patterns_path: Option<PathBuf>,
    pub dispatch: DispatchConfig,
}

impl AppConfig {
    pub fn from_env() -> crate::Result<Self> {
        let defaults = DispatchConfig::default();

        let confidence_threshold =
            parse_var("ROUTER_CONFIDENCE_THRESHOLD", defaults.confidence_threshold)?;
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(OrchestrationError::ConfigError(format!(
                "ROUTER_CONFIDENCE_THRESHOLD must be within [0, 1], got {}",
                confidence_threshold
            )));
        }

        let breaker = BreakerConfig {
            max_retries: parse_nonzero("BREAKER_MAX_RETRIES", defaults.breaker.max_retries)?,
            blocking_limit: parse_nonzero("BREAKER_BLOCKING_LIMIT", defaults.breaker.blocking_limit)?,
            missing_input_limit: parse_nonzero(
                "BREAKER_MISSING_INPUT_LIMIT",
                defaults.breaker.missing_input_limit,
            )?,
        };

        let dispatch = DispatchConfig {
            confidence_threshold,
            breaker,
            max_rounds_per_turn: parse_nonzero("MAX_ROUNDS_PER_TURN", defaults.max_rounds_per_turn)?,
            classifier_timeout: Duration::from_secs(parse_var(
                "CLASSIFIER_TIMEOUT_SECS",
                defaults.classifier_timeout.as_secs(),
            )?),
            worker_timeout: Duration::from_secs(parse_var(
                "WORKER_TIMEOUT_SECS",
                defaults.worker_timeout.as_secs(),
            )?),
        };

        let port = env::var("PORT")
            .or_else(|_| env::var("API_PORT"))
            .ok()
            .map(|raw| {
                raw.trim().parse::<u16>().map_err(|e| {
                    OrchestrationError::ConfigError(format!("invalid port '{}': {}", raw, e))
                })
            })
            .transpose()?
            .unwrap_or(8080);

        Ok(Self {
            gemini_api_key: non_empty("GEMINI_API_KEY"),
            gemini_model: non_empty("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            semantic_search_url: non_empty("SEMANTIC_SEARCH_URL"),
            database_url: non_empty("POSTGRES_URL").or_else(|| non_empty("DATABASE_URL")),
            port,
            routing_patterns_path: non_empty("ROUTING_PATTERNS_PATH").map(PathBuf::from),
            dispatch,
        })
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T>(key: &str, default: T) -> crate::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| OrchestrationError::ConfigError(format!("{}='{}': {}", key, raw, e))),
    }
}

fn parse_nonzero(key: &str, default: u32) -> crate::Result<u32> {
    let value = parse_var(key, default)?;
    if value == 0 {
        return Err(OrchestrationError::ConfigError(format!(
            "{} must be greater than zero",
            key
        )));
    }
    Ok(value)
}
