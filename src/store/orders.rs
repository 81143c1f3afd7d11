use chrono::Utc;
use tracing::debug;

use crate::error::AppError;
use crate::models::order::{NewOrder, Order, OrderStatus, StatusChange};
use crate::store::Store;

impl Store {
    pub async fn insert_order(&self, new: NewOrder) -> Result<Order, AppError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let order: Order = sqlx::query_as(
            r#"
            INSERT INTO orders (
                customer_id,
                vehicle_type,
                status,
                pickup_lat,
                pickup_lon,
                dropoff_lat,
                dropoff_lon,
                total_price,
                original_price,
                labor_count,
                created_at,
                updated_at
            ) VALUES ($1, $2, 'pending', $3, $4, $5, $6, $7, $8, 0, $9, $10)
            RETURNING *
            "#,
        )
        .bind(new.customer_id)
        .bind(&new.vehicle_type)
        .bind(new.pickup.lat)
        .bind(new.pickup.lon)
        .bind(new.dropoff.lat)
        .bind(new.dropoff.lon)
        .bind(new.estimated_price)
        .bind(new.estimated_price)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO order_status_history (order_id, previous_status, new_status, changed_by, created_at) \
             VALUES ($1, NULL, 'pending', $2, $3)",
        )
        .bind(order.id)
        .bind(format!("customer:{}", new.customer_id))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(order_id = order.id, customer_id = new.customer_id, "order created");
        Ok(order)
    }

    pub async fn fetch_order(&self, order_id: i64) -> Result<Option<Order>, AppError> {
        let order = sqlx::query_as("SELECT * FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(order)
    }

    /// Moves an order between statuses, guarded by a conditional update:
    /// the write only lands if the row still holds the status that was just
    /// read. Zero affected rows means another handler won the race and the
    /// caller gets a conflict, never a partial mutation.
    pub async fn transition_status(
        &self,
        order_id: i64,
        expected: &[OrderStatus],
        to: OrderStatus,
        changed_by: &str,
    ) -> Result<Order, AppError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let current: Option<(OrderStatus,)> =
            sqlx::query_as("SELECT status FROM orders WHERE id = $1")
                .bind(order_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((current,)) = current else {
            return Err(AppError::NotFound(format!("order {order_id} not found")));
        };
        if !expected.contains(&current) {
            return Err(AppError::Conflict(format!(
                "order {order_id} is {current}, not available for this action"
            )));
        }

        let updated = sqlx::query(
            "UPDATE orders SET status = $1, updated_at = $2 WHERE id = $3 AND status = $4",
        )
        .bind(to)
        .bind(now)
        .bind(order_id)
        .bind(current)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "order {order_id} changed concurrently"
            )));
        }

        self.append_history(&mut tx, order_id, Some(current), to, changed_by)
            .await?;

        let order = sqlx::query_as("SELECT * FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(order_id, from = %current, to = %to, changed_by, "order transition");
        Ok(order)
    }

    /// Same guarded update as `transition_status`, but the order records a
    /// pass through an intermediate status on its way to the final one.
    /// Both history rows commit together with the final status in one
    /// transaction, so a waypoint status with no outgoing edge can never
    /// be left behind as the stored status. The first hop is attributed to
    /// `changed_by`, the second to the system.
    pub async fn transition_status_through(
        &self,
        order_id: i64,
        expected: &[OrderStatus],
        via: OrderStatus,
        to: OrderStatus,
        changed_by: &str,
    ) -> Result<Order, AppError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let current: Option<(OrderStatus,)> =
            sqlx::query_as("SELECT status FROM orders WHERE id = $1")
                .bind(order_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((current,)) = current else {
            return Err(AppError::NotFound(format!("order {order_id} not found")));
        };
        if !expected.contains(&current) {
            return Err(AppError::Conflict(format!(
                "order {order_id} is {current}, not available for this action"
            )));
        }

        let updated = sqlx::query(
            "UPDATE orders SET status = $1, updated_at = $2 WHERE id = $3 AND status = $4",
        )
        .bind(to)
        .bind(now)
        .bind(order_id)
        .bind(current)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "order {order_id} changed concurrently"
            )));
        }

        self.append_history(&mut tx, order_id, Some(current), via, changed_by)
            .await?;
        self.append_history(&mut tx, order_id, Some(via), to, "system")
            .await?;

        let order = sqlx::query_as("SELECT * FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(order_id, from = %current, via = %via, to = %to, changed_by, "order transition");
        Ok(order)
    }

    /// The customer approved the proposed price: one conditional write
    /// assigns the driver together with the negotiated labor count and
    /// price, so a raced cancellation or timeout can never leave a
    /// half-assigned order behind.
    pub async fn approve_price(
        &self,
        order_id: i64,
        driver_id: i64,
        labor_count: u32,
        total_price: f64,
        changed_by: &str,
    ) -> Result<Order, AppError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE orders SET status = $1, driver_id = $2, labor_count = $3, total_price = $4, \
             updated_at = $5 WHERE id = $6 AND status = $7",
        )
        .bind(OrderStatus::CustomerPriceApproved)
        .bind(driver_id)
        .bind(i64::from(labor_count))
        .bind(total_price)
        .bind(now)
        .bind(order_id)
        .bind(OrderStatus::DriverAcceptedAwaitingCustomer)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "order {order_id} is no longer awaiting confirmation"
            )));
        }

        self.append_history(
            &mut tx,
            order_id,
            Some(OrderStatus::DriverAcceptedAwaitingCustomer),
            OrderStatus::CustomerPriceApproved,
            changed_by,
        )
        .await?;

        let order = sqlx::query_as("SELECT * FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(order)
    }

    /// First half of the cancellation sub-protocol: record the fee and the
    /// confirmation code without touching the status.
    pub async fn set_cancellation_request(
        &self,
        order_id: i64,
        confirm_code: &str,
        fee: f64,
    ) -> Result<(), AppError> {
        let updated = sqlx::query(
            "UPDATE orders SET cancellation_confirm_code = $1, cancellation_fee = $2, \
             updated_at = $3 WHERE id = $4",
        )
        .bind(confirm_code)
        .bind(fee)
        .bind(Utc::now())
        .bind(order_id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("order {order_id} not found")));
        }
        Ok(())
    }

    /// Second half: the code matched, so flip to `cancelled` if the order
    /// is still in a cancellable status, burning the code in the same
    /// write. A repeated confirmation finds either a non-cancellable
    /// status or no code and cannot charge twice.
    pub async fn finalize_cancellation(
        &self,
        order_id: i64,
        changed_by: &str,
    ) -> Result<Order, AppError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let current: Option<(OrderStatus,)> =
            sqlx::query_as("SELECT status FROM orders WHERE id = $1")
                .bind(order_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((current,)) = current else {
            return Err(AppError::NotFound(format!("order {order_id} not found")));
        };
        if !current.is_cancellable() {
            return Err(AppError::Conflict(format!(
                "order {order_id} is {current} and cannot be cancelled"
            )));
        }

        let updated = sqlx::query(
            "UPDATE orders SET status = $1, cancellation_confirm_code = NULL, updated_at = $2 \
             WHERE id = $3 AND status = $4",
        )
        .bind(OrderStatus::Cancelled)
        .bind(now)
        .bind(order_id)
        .bind(current)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "order {order_id} changed concurrently"
            )));
        }

        self.append_history(&mut tx, order_id, Some(current), OrderStatus::Cancelled, changed_by)
            .await?;

        let order = sqlx::query_as("SELECT * FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(order)
    }

    pub async fn fetch_status_history(
        &self,
        order_id: i64,
    ) -> Result<Vec<StatusChange>, AppError> {
        let rows = sqlx::query_as(
            "SELECT * FROM order_status_history WHERE order_id = $1 ORDER BY id ASC",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn append_history(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        order_id: i64,
        previous: Option<OrderStatus>,
        new_status: OrderStatus,
        changed_by: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO order_status_history (order_id, previous_status, new_status, changed_by, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(order_id)
        .bind(previous.map(|status| status.as_str()))
        .bind(new_status.as_str())
        .bind(changed_by)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::AppError;
    use crate::models::order::{NewOrder, OrderStatus};
    use crate::models::presence::GeoPoint;
    use crate::store::Store;

    async fn store() -> Store {
        Store::connect("sqlite::memory:").await.unwrap()
    }

    async fn pending_order(store: &Store) -> i64 {
        store
            .insert_order(NewOrder {
                customer_id: 31,
                vehicle_type: "van".into(),
                pickup: GeoPoint { lat: 40.98, lon: 29.03 },
                dropoff: GeoPoint { lat: 41.01, lon: 29.1 },
                estimated_price: 300.0,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn two_hop_transition_commits_both_history_rows() {
        let store = store().await;
        let order_id = pending_order(&store).await;
        store
            .transition_status(
                order_id,
                &[OrderStatus::Pending],
                OrderStatus::DriverAcceptedAwaitingCustomer,
                "driver:5",
            )
            .await
            .unwrap();

        let order = store
            .transition_status_through(
                order_id,
                &[OrderStatus::DriverAcceptedAwaitingCustomer],
                OrderStatus::CustomerConfirmationTimeout,
                OrderStatus::Pending,
                "system",
            )
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(order.status.is_acceptable());

        let history = store.fetch_status_history(order_id).await.unwrap();
        let trail: Vec<&str> = history.iter().map(|change| change.new_status.as_str()).collect();
        assert_eq!(
            trail,
            vec![
                "pending",
                "driver_accepted_awaiting_customer",
                "customer_confirmation_timeout",
                "pending",
            ]
        );
        assert_eq!(
            history[3].previous_status.as_deref(),
            Some("customer_confirmation_timeout")
        );
    }

    #[tokio::test]
    async fn two_hop_transition_attributes_each_hop() {
        let store = store().await;
        let order_id = pending_order(&store).await;
        store
            .transition_status(
                order_id,
                &[OrderStatus::Pending],
                OrderStatus::DriverAcceptedAwaitingCustomer,
                "driver:5",
            )
            .await
            .unwrap();

        let order = store
            .transition_status_through(
                order_id,
                &[OrderStatus::DriverAcceptedAwaitingCustomer],
                OrderStatus::CustomerPriceRejected,
                OrderStatus::Cancelled,
                "customer:31",
            )
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);

        let history = store.fetch_status_history(order_id).await.unwrap();
        assert_eq!(history[2].new_status, "customer_price_rejected");
        assert_eq!(history[2].changed_by, "customer:31");
        assert_eq!(history[3].new_status, "cancelled");
        assert_eq!(history[3].changed_by, "system");
    }

    #[tokio::test]
    async fn refused_two_hop_leaves_no_trace() {
        let store = store().await;
        let order_id = pending_order(&store).await;

        let err = store
            .transition_status_through(
                order_id,
                &[OrderStatus::DriverAcceptedAwaitingCustomer],
                OrderStatus::CustomerPriceRejected,
                OrderStatus::Cancelled,
                "customer:31",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let order = store.fetch_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        let history = store.fetch_status_history(order_id).await.unwrap();
        assert_eq!(history.len(), 1);
    }
}
