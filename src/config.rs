use std::env;
use std::time::Duration;

use crate::engine::locator::{DEFAULT_CANDIDATE_POOL_SIZE, DEFAULT_RADIUS_KM};
use crate::error::AppError;
use crate::geo::AVERAGE_SPEED_KMH;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub search_radius_km: f64,
    pub candidate_pool_size: usize,
    pub average_speed_kmh: f64,
    pub query_timeout_ms: u64,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub event_buffer_size: usize,
    pub seed_file: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let config = Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            search_radius_km: parse_or_default("SEARCH_RADIUS_KM", DEFAULT_RADIUS_KM)?,
            candidate_pool_size: parse_or_default("CANDIDATE_POOL_SIZE", DEFAULT_CANDIDATE_POOL_SIZE)?,
            average_speed_kmh: parse_or_default("AVERAGE_SPEED_KMH", AVERAGE_SPEED_KMH)?,
            query_timeout_ms: parse_or_default("QUERY_TIMEOUT_MS", 5_000)?,
            reconnect_max_attempts: parse_or_default("RECONNECT_MAX_ATTEMPTS", 5)?,
            reconnect_base_delay_ms: parse_or_default("RECONNECT_BASE_DELAY_MS", 200)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 256)?,
            seed_file: env::var("SEED_FILE").ok().filter(|path| !path.is_empty()),
        };

        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), AppError> {
        if !(self.search_radius_km.is_finite() && self.search_radius_km > 0.0) {
            return Err(AppError::Internal(
                "SEARCH_RADIUS_KM must be a positive number".to_string(),
            ));
        }
        if self.candidate_pool_size == 0 {
            return Err(AppError::Internal(
                "CANDIDATE_POOL_SIZE must be > 0".to_string(),
            ));
        }
        if self.query_timeout_ms == 0 {
            return Err(AppError::Internal("QUERY_TIMEOUT_MS must be > 0".to_string()));
        }
        if !(self.average_speed_kmh.is_finite() && self.average_speed_kmh > 0.0) {
            return Err(AppError::Internal(
                "AVERAGE_SPEED_KMH must be a positive number".to_string(),
            ));
        }
        if self.event_buffer_size == 0 {
            return Err(AppError::Internal(
                "EVENT_BUFFER_SIZE must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            search_radius_km: DEFAULT_RADIUS_KM,
            candidate_pool_size: DEFAULT_CANDIDATE_POOL_SIZE,
            average_speed_kmh: AVERAGE_SPEED_KMH,
            query_timeout_ms: 5_000,
            reconnect_max_attempts: 5,
            reconnect_base_delay_ms: 200,
            event_buffer_size: 256,
            seed_file: None,
        }
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
