use crate::error::AppError;
use crate::protocol::ClientEvent;

const MAX_LABOR_COUNT: u32 = 50;

/// Syntactic checks on parsed payloads. Anything structural (unknown
/// events, wrong field types) already failed at the enum boundary; this
/// rejects values that parse but cannot be meant.
pub fn validate_payload(event: &ClientEvent) -> Result<(), AppError> {
    match event {
        ClientEvent::LocationUpdate { lat, lon, heading } => {
            check_coords(*lat, *lon)?;
            if let Some(heading) = heading {
                if !heading.is_finite() || !(0.0..360.0).contains(heading) {
                    return Err(AppError::Validation(
                        "heading must be within [0, 360)".into(),
                    ));
                }
            }
            Ok(())
        }
        ClientEvent::CustomerLocationUpdate { lat, lon } => check_coords(*lat, *lon),
        ClientEvent::CreateOrder {
            vehicle_type,
            pickup_lat,
            pickup_lon,
            dropoff_lat,
            dropoff_lon,
        } => {
            if vehicle_type.trim().is_empty() {
                return Err(AppError::Validation("vehicle_type is required".into()));
            }
            check_coords(*pickup_lat, *pickup_lon)?;
            check_coords(*dropoff_lat, *dropoff_lon)
        }
        ClientEvent::AcceptOrderWithLabor {
            order_id,
            labor_count,
        } => {
            check_order_id(*order_id)?;
            if *labor_count > MAX_LABOR_COUNT {
                return Err(AppError::Validation(format!(
                    "labor_count must be at most {MAX_LABOR_COUNT}"
                )));
            }
            Ok(())
        }
        ClientEvent::CancelOrderWithCode {
            order_id,
            confirm_code,
        } => {
            check_order_id(*order_id)?;
            if confirm_code.len() != 4 || !confirm_code.bytes().all(|b| b.is_ascii_digit()) {
                return Err(AppError::Validation(
                    "confirm_code must be a 4-digit code".into(),
                ));
            }
            Ok(())
        }
        ClientEvent::CancelOrder { order_id }
        | ClientEvent::ConfirmPriceWithCustomer { order_id }
        | ClientEvent::PriceConfirmationResponse { order_id, .. }
        | ClientEvent::DriverStartedNavigation { order_id }
        | ClientEvent::InspectOrder { order_id }
        | ClientEvent::StopInspectingOrder { order_id }
        | ClientEvent::UpdateOrderStatus { order_id, .. } => check_order_id(*order_id),
        ClientEvent::AvailabilityUpdate { .. } | ClientEvent::DriverGoingOffline => Ok(()),
    }
}

fn check_coords(lat: f64, lon: f64) -> Result<(), AppError> {
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(AppError::Validation(
            "lat must be within [-90, 90]".into(),
        ));
    }
    if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
        return Err(AppError::Validation(
            "lon must be within [-180, 180]".into(),
        ));
    }
    Ok(())
}

fn check_order_id(order_id: i64) -> Result<(), AppError> {
    if order_id <= 0 {
        return Err(AppError::Validation("order_id must be positive".into()));
    }
    Ok(())
}
