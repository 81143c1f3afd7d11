use std::env;

use crate::error::AppError;

/// Process configuration, read once at startup. Values that operators tune
/// at runtime (search radius, location freshness, default cancellation fee)
/// live in the `system_settings` table instead; the fields here are only
/// the seeds written when that table is empty.
#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub database_url: String,
    pub log_level: String,
    pub jwt_secret: String,
    pub access_token_ttl_secs: i64,
    pub refresh_token_ttl_secs: i64,
    pub event_buffer_size: usize,
    pub default_search_radius_km: f64,
    pub default_location_freshness_mins: i64,
    pub default_cancellation_fee_percent: f64,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://haul_dispatch.db".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            jwt_secret: env::var("JWT_SECRET")
                .unwrap_or_else(|_| "haul-dispatch-dev-secret".to_string()),
            access_token_ttl_secs: parse_or_default("ACCESS_TOKEN_TTL_SECS", 900)?,
            refresh_token_ttl_secs: parse_or_default("REFRESH_TOKEN_TTL_SECS", 1_209_600)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            default_search_radius_km: parse_or_default("SEARCH_RADIUS_KM", 5.0)?,
            default_location_freshness_mins: parse_or_default("LOCATION_FRESHNESS_MINS", 10)?,
            default_cancellation_fee_percent: parse_or_default("CANCELLATION_FEE_PERCENT", 25.0)?,
        })
    }

    /// Fixed configuration for tests: in-memory store, throwaway secret, no
    /// environment reads.
    pub fn for_tests() -> Self {
        Self {
            http_port: 0,
            database_url: "sqlite::memory:".to_string(),
            log_level: "debug".to_string(),
            jwt_secret: "test-secret".to_string(),
            access_token_ttl_secs: 900,
            refresh_token_ttl_secs: 1_209_600,
            event_buffer_size: 64,
            default_search_radius_km: 5.0,
            default_location_freshness_mins: 10,
            default_cancellation_fee_percent: 25.0,
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
