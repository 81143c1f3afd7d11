use crate::protocol::outbound::PriceBreakdown;
use crate::store::PricingRule;

/// A computed price with the components that produced it.
#[derive(Debug, Clone)]
pub struct Quote {
    pub total: f64,
    pub breakdown: PriceBreakdown,
}

/// Price for a trip of `distance_km` with `labor_count` helpers. The base
/// price is a floor: short trips with no labor still pay it.
pub fn quote(rule: &PricingRule, distance_km: f64, labor_count: u32) -> Quote {
    let distance_component = round_money(distance_km * rule.per_km_price);
    let labor_component = round_money(f64::from(labor_count) * rule.per_labor_price);
    let total = round_money((distance_component + labor_component).max(rule.base_price));

    Quote {
        total,
        breakdown: PriceBreakdown {
            base_price: rule.base_price,
            distance_km: round_money(distance_km),
            distance_component,
            labor_component,
        },
    }
}

pub(crate) fn round_money(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use crate::store::PricingRule;

    use super::quote;

    fn van() -> PricingRule {
        PricingRule {
            vehicle_type: "van".to_string(),
            base_price: 300.0,
            per_km_price: 15.0,
            per_labor_price: 100.0,
        }
    }

    #[test]
    fn short_trips_pay_the_base_price() {
        let q = quote(&van(), 2.0, 0);
        assert_eq!(q.total, 300.0);
        assert_eq!(q.breakdown.distance_component, 30.0);
    }

    #[test]
    fn long_trips_price_by_distance_and_labor() {
        let q = quote(&van(), 30.0, 2);
        assert_eq!(q.breakdown.distance_component, 450.0);
        assert_eq!(q.breakdown.labor_component, 200.0);
        assert_eq!(q.total, 650.0);
    }

    #[test]
    fn labor_alone_can_clear_the_floor() {
        let q = quote(&van(), 1.0, 4);
        assert_eq!(q.total, 415.0);
    }

    #[test]
    fn totals_are_rounded_to_cents() {
        let rule = PricingRule {
            vehicle_type: "van".to_string(),
            base_price: 1.0,
            per_km_price: 0.333,
            per_labor_price: 0.0,
        };
        let q = quote(&rule, 10.0, 0);
        assert_eq!(q.total, 3.33);
    }
}
