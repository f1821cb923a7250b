use std::env;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub dispatch_queue_size: usize,
    /// Per-job replay buffer capacity for reconnecting subscribers.
    pub event_buffer_size: usize,
    /// Allowed gap between a client's quoted total and the recomputed one.
    pub price_tolerance: f64,
    pub currency: String,
    pub default_max_active_jobs: u8,
    pub dispatch_retry_attempts: u32,
    pub dispatch_retry_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            dispatch_queue_size: 1024,
            event_buffer_size: 256,
            price_tolerance: 0.01,
            currency: "EUR".to_string(),
            default_max_active_jobs: 3,
            dispatch_retry_attempts: 5,
            dispatch_retry_delay_ms: 250,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Config::default();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            dispatch_queue_size: parse_or_default("DISPATCH_QUEUE_SIZE", defaults.dispatch_queue_size)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", defaults.event_buffer_size)?,
            price_tolerance: parse_or_default("PRICE_TOLERANCE", defaults.price_tolerance)?,
            currency: env::var("CURRENCY").unwrap_or(defaults.currency),
            default_max_active_jobs: parse_or_default("MAX_ACTIVE_JOBS", defaults.default_max_active_jobs)?,
            dispatch_retry_attempts: parse_or_default(
                "DISPATCH_RETRY_ATTEMPTS",
                defaults.dispatch_retry_attempts,
            )?,
            dispatch_retry_delay_ms: parse_or_default(
                "DISPATCH_RETRY_DELAY_MS",
                defaults.dispatch_retry_delay_ms,
            )?,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
