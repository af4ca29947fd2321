use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::geo::distance_between;
use crate::models::order::OrderStatus;
use crate::models::tracking::GeoPoint;

pub const DEFAULT_ASSUMED_SPEED_KMH: f64 = 30.0;

const PREPARING_READY_MINUTES: i64 = 15;
const PREPARING_DELIVERY_MINUTES: i64 = 30;
const READY_DELIVERY_MINUTES: i64 = 20;
const OUT_FOR_DELIVERY_FALLBACK_MINUTES: i64 = 15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EstimatedTimes {
    pub ready_at: Option<DateTime<Utc>>,
    pub delivery_at: Option<DateTime<Utc>>,
}

/// Heuristic ETAs. The fixed offsets and the constant travel speed are
/// approximations, not measured arrival times.
#[derive(Debug, Clone, Copy)]
pub struct EstimateCalculator {
    assumed_speed_kmh: f64,
}

impl Default for EstimateCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_ASSUMED_SPEED_KMH)
    }
}

impl EstimateCalculator {
    pub fn new(assumed_speed_kmh: f64) -> Self {
        Self { assumed_speed_kmh }
    }

    pub fn estimate(
        &self,
        status: OrderStatus,
        driver_location: Option<&GeoPoint>,
        user_location: Option<&GeoPoint>,
        now: DateTime<Utc>,
    ) -> EstimatedTimes {
        match status {
            OrderStatus::Preparing => EstimatedTimes {
                ready_at: Some(now + Duration::minutes(PREPARING_READY_MINUTES)),
                delivery_at: Some(now + Duration::minutes(PREPARING_DELIVERY_MINUTES)),
            },
            OrderStatus::Ready => EstimatedTimes {
                ready_at: None,
                delivery_at: Some(now + Duration::minutes(READY_DELIVERY_MINUTES)),
            },
            OrderStatus::OutForDelivery => {
                let travel = match (driver_location, user_location) {
                    (Some(driver), Some(user)) => self.travel_time(driver, user),
                    _ => Some(Duration::minutes(OUT_FOR_DELIVERY_FALLBACK_MINUTES)),
                };
                EstimatedTimes {
                    ready_at: None,
                    delivery_at: travel.and_then(|travel| now.checked_add_signed(travel)),
                }
            }
            _ => EstimatedTimes::default(),
        }
    }

    /// `None` when the speed yields no representable duration.
    fn travel_time(&self, from: &GeoPoint, to: &GeoPoint) -> Option<Duration> {
        let millis = distance_between(from, to) / self.assumed_speed_kmh * 3_600_000.0;
        if !millis.is_finite() || millis < 0.0 || millis >= i64::MAX as f64 {
            return None;
        }
        Duration::try_milliseconds(millis.round() as i64)
    }
}

/// `HH:MM` in UTC, or "TBD" when no estimate exists.
pub fn format_eta(at: Option<DateTime<Utc>>) -> String {
    match at {
        Some(at) => at.format("%H:%M").to_string(),
        None => "TBD".to_string(),
    }
}
