use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder};

use crate::error::AppError;
use crate::models::presence::GeoPoint;
use crate::store::Store;

#[derive(Debug, Clone, FromRow)]
pub struct DriverProfile {
    pub id: i64,
    pub name: String,
    pub vehicle_type: String,
    pub rating: f64,
    pub approved: bool,
    pub active: bool,
    pub available: bool,
}

/// One driver's persisted eligibility facts, joined from the roster and the
/// last stored location. The validator decides from these alone; missing
/// rows never reach it because the join is keyed on the roster.
#[derive(Debug, Clone, FromRow)]
pub struct EligibilityRow {
    pub id: i64,
    pub approved: bool,
    pub active: bool,
    pub available: bool,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub last_location_update: Option<DateTime<Utc>>,
}

impl Store {
    pub async fn upsert_driver(
        &self,
        id: i64,
        name: &str,
        vehicle_type: &str,
        rating: f64,
        approved: bool,
        active: bool,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO drivers (id, name, vehicle_type, rating, approved, active, available) \
             VALUES ($1, $2, $3, $4, $5, $6, 0) \
             ON CONFLICT (id) DO UPDATE SET \
             name = excluded.name, vehicle_type = excluded.vehicle_type, \
             rating = excluded.rating, approved = excluded.approved, active = excluded.active",
        )
        .bind(id)
        .bind(name)
        .bind(vehicle_type)
        .bind(rating)
        .bind(approved)
        .bind(active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_driver_available(
        &self,
        driver_id: i64,
        available: bool,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE drivers SET available = $1 WHERE id = $2")
            .bind(available)
            .bind(driver_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn driver_profile(&self, driver_id: i64) -> Result<Option<DriverProfile>, AppError> {
        let profile = sqlx::query_as("SELECT * FROM drivers WHERE id = $1")
            .bind(driver_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(profile)
    }

    /// Persists a principal's reported position. Runs before any proximity
    /// recomputation so eligibility checks see the position they are
    /// ranking by.
    pub async fn update_user_location(
        &self,
        user_id: i64,
        location: GeoPoint,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO users (id, lat, lon, last_location_update) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET \
             lat = excluded.lat, lon = excluded.lon, \
             last_location_update = excluded.last_location_update",
        )
        .bind(user_id)
        .bind(location.lat)
        .bind(location.lon)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetches eligibility facts for the given driver ids in one query.
    /// Ids with no roster row simply do not come back, which callers treat
    /// the same as ineligible.
    pub async fn eligibility_snapshot(
        &self,
        driver_ids: &[i64],
    ) -> Result<Vec<EligibilityRow>, AppError> {
        if driver_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::new(
            "SELECT d.id, d.approved, d.active, d.available, \
             u.lat, u.lon, u.last_location_update \
             FROM drivers d LEFT JOIN users u ON u.id = d.id \
             WHERE d.id IN (",
        );
        let mut ids = builder.separated(", ");
        for id in driver_ids {
            ids.push_bind(id);
        }
        ids.push_unseparated(")");

        let rows = builder
            .build_query_as::<EligibilityRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}
