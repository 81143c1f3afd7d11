use std::str::FromStr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use chrono::Duration as ChronoDuration;
use sqlx::FromRow;
use tracing::warn;

use crate::error::AppError;
use crate::models::order::OrderStatus;
use crate::store::Store;

const SETTINGS_TTL: Duration = Duration::from_secs(10);

/// Operator-tunable scope knobs, loaded from `system_settings`. Anything
/// missing or unparsable falls back to the configured default; a failed
/// query does not, it propagates so scope decisions fail closed.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub search_radius_km: f64,
    pub location_freshness_mins: i64,
    pub default_cancellation_fee_percent: f64,
}

impl Settings {
    pub fn freshness_window(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.location_freshness_mins)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SettingsDefaults {
    pub search_radius_km: f64,
    pub location_freshness_mins: i64,
    pub cancellation_fee_percent: f64,
}

#[derive(Debug, Clone, FromRow)]
pub struct PricingRule {
    pub vehicle_type: String,
    pub base_price: f64,
    pub per_km_price: f64,
    pub per_labor_price: f64,
}

/// Short-lived cache in front of `system_settings`. Serves the last loaded
/// value inside the TTL, reloads after it, and never serves stale values
/// across a load failure.
pub struct SettingsCache {
    defaults: SettingsDefaults,
    cached: RwLock<Option<(Settings, Instant)>>,
}

impl SettingsCache {
    pub fn new(defaults: SettingsDefaults) -> Self {
        Self {
            defaults,
            cached: RwLock::new(None),
        }
    }

    pub async fn current(&self, store: &Store) -> Result<Settings, AppError> {
        {
            let cached = self.cached.read().expect("settings cache lock poisoned");
            if let Some((settings, loaded_at)) = *cached {
                if loaded_at.elapsed() < SETTINGS_TTL {
                    return Ok(settings);
                }
            }
        }

        let settings = store.load_settings(&self.defaults).await?;
        let mut cached = self.cached.write().expect("settings cache lock poisoned");
        *cached = Some((settings, Instant::now()));
        Ok(settings)
    }

    /// Dropped after operator writes so the next read sees them.
    pub fn invalidate(&self) {
        let mut cached = self.cached.write().expect("settings cache lock poisoned");
        *cached = None;
    }
}

impl Store {
    pub async fn fetch_setting(&self, key: &str) -> Result<Option<String>, AppError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM system_settings WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO system_settings (key, value, updated_at) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(crate) async fn load_settings(
        &self,
        defaults: &SettingsDefaults,
    ) -> Result<Settings, AppError> {
        let search_radius_km = parse_or(
            "search_radius_km",
            self.fetch_setting("search_radius_km").await?,
            defaults.search_radius_km,
        );
        let location_freshness_mins = parse_or(
            "location_freshness_mins",
            self.fetch_setting("location_freshness_mins").await?,
            defaults.location_freshness_mins,
        );
        let default_cancellation_fee_percent = parse_or(
            "default_cancellation_fee_percent",
            self.fetch_setting("default_cancellation_fee_percent").await?,
            defaults.cancellation_fee_percent,
        );
        Ok(Settings {
            search_radius_km,
            location_freshness_mins,
            default_cancellation_fee_percent,
        })
    }

    /// Fee percent for cancelling out of the given status. Statuses with no
    /// seeded row charge the settings default.
    pub async fn cancellation_fee_percent(
        &self,
        status: OrderStatus,
        default_percent: f64,
    ) -> Result<f64, AppError> {
        let row: Option<(f64,)> =
            sqlx::query_as("SELECT percent FROM cancellation_fees WHERE status = $1")
                .bind(status.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(percent,)| percent).unwrap_or(default_percent))
    }

    pub async fn pricing_for(&self, vehicle_type: &str) -> Result<Option<PricingRule>, AppError> {
        let rule = sqlx::query_as("SELECT * FROM vehicle_type_pricing WHERE vehicle_type = $1")
            .bind(vehicle_type)
            .fetch_optional(&self.pool)
            .await?;
        Ok(rule)
    }
}

fn parse_or<T: FromStr + Copy>(key: &str, value: Option<String>, default: T) -> T {
    match value {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "unparsable setting, using default");
            default
        }),
        None => default,
    }
}
