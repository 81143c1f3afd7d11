pub mod drivers;
pub mod orders;
pub mod settings;

use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;

use crate::error::AppError;

pub use drivers::{DriverProfile, EligibilityRow};
pub use settings::{PricingRule, Settings, SettingsCache, SettingsDefaults};

/// Handle to the persisted store. Cheap to clone; all call sites go through
/// the methods in this module's submodules so every status transition stays
/// behind a conditional update.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS orders (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        customer_id INTEGER NOT NULL,
        driver_id INTEGER,
        status TEXT NOT NULL DEFAULT 'pending',
        vehicle_type TEXT NOT NULL,
        pickup_lat REAL NOT NULL,
        pickup_lon REAL NOT NULL,
        dropoff_lat REAL NOT NULL,
        dropoff_lon REAL NOT NULL,
        total_price REAL NOT NULL,
        original_price REAL NOT NULL,
        labor_count INTEGER NOT NULL DEFAULT 0,
        cancellation_confirm_code TEXT,
        cancellation_fee REAL,
        created_at TIMESTAMP NOT NULL,
        updated_at TIMESTAMP NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_orders_status ON orders (status)",
    "CREATE TABLE IF NOT EXISTS order_status_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        order_id INTEGER NOT NULL,
        previous_status TEXT,
        new_status TEXT NOT NULL,
        changed_by TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_history_order ON order_status_history (order_id)",
    "CREATE TABLE IF NOT EXISTS drivers (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL DEFAULT '',
        vehicle_type TEXT NOT NULL DEFAULT 'van',
        rating REAL NOT NULL DEFAULT 5.0,
        approved INTEGER NOT NULL DEFAULT 0,
        active INTEGER NOT NULL DEFAULT 1,
        available INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL DEFAULT '',
        lat REAL,
        lon REAL,
        last_location_update TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS system_settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS cancellation_fees (
        status TEXT PRIMARY KEY,
        percent REAL NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS vehicle_type_pricing (
        vehicle_type TEXT PRIMARY KEY,
        base_price REAL NOT NULL,
        per_km_price REAL NOT NULL,
        per_labor_price REAL NOT NULL
    )",
];

/// Rows written only when absent, so operator edits survive restarts.
const SEEDS: &[&str] = &[
    "INSERT OR IGNORE INTO cancellation_fees (status, percent) VALUES ('pending', 0.0)",
    "INSERT OR IGNORE INTO cancellation_fees (status, percent) VALUES ('inspecting', 0.0)",
    "INSERT OR IGNORE INTO cancellation_fees (status, percent) VALUES \
     ('driver_accepted_awaiting_customer', 25.0)",
    "INSERT OR IGNORE INTO cancellation_fees (status, percent) VALUES \
     ('customer_price_approved', 25.0)",
    "INSERT OR IGNORE INTO cancellation_fees (status, percent) VALUES \
     ('driver_going_to_pickup', 25.0)",
    "INSERT OR IGNORE INTO cancellation_fees (status, percent) VALUES \
     ('pickup_completed', 25.0)",
    "INSERT OR IGNORE INTO vehicle_type_pricing \
     (vehicle_type, base_price, per_km_price, per_labor_price) VALUES ('van', 300.0, 15.0, 100.0)",
    "INSERT OR IGNORE INTO vehicle_type_pricing \
     (vehicle_type, base_price, per_km_price, per_labor_price) VALUES \
     ('small_truck', 500.0, 20.0, 150.0)",
    "INSERT OR IGNORE INTO vehicle_type_pricing \
     (vehicle_type, base_price, per_km_price, per_labor_price) VALUES \
     ('large_truck', 900.0, 35.0, 200.0)",
];

impl Store {
    /// Connects and prepares the schema. Callers treat failure as fatal:
    /// the dispatcher must not accept connections without its store.
    pub async fn connect(url: &str) -> Result<Self, AppError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|err| AppError::Internal(format!("invalid database url: {err}")))?
            .create_if_missing(true);

        // an in-memory database exists per connection; a wider pool would
        // hand each caller a different empty database
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let (max_conns, min_conns) = if in_memory { (1, 1) } else { (5, 0) };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_conns)
            .min_connections(min_conns)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate(url).await?;
        Ok(store)
    }

    async fn migrate(&self, url: &str) -> Result<(), AppError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        for statement in SEEDS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!(database = %url, "store ready");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes the pool. Subsequent queries fail, which the validator and
    /// router treat as "no eligible drivers".
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
