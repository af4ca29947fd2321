//! Contracts of the collaborators the tracking engine talks to.
//!
//! The engine only sees these traits; `memory` backs them in-process for the
//! demo binary and tests, `headless` stands in for device and platform APIs.

pub mod headless;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::order::{Order, OrderEvent, OrderItem};
use crate::models::tracking::{GeoPoint, TrackingSnapshot};

#[async_trait]
pub trait OrderService: Send + Sync {
    /// Fails with `AppError::NotFound` when the order does not exist for the caller.
    async fn get_order_by_id(&self, id: Uuid) -> Result<Order, AppError>;

    /// Oldest first.
    async fn get_order_events(&self, id: Uuid) -> Result<Vec<OrderEvent>, AppError>;

    /// Fails with `AppError::Validation` when `rating` is outside 1..=5.
    async fn rate_order(&self, id: Uuid, rating: u8, review: &str) -> Result<(), AppError>;
}

#[async_trait]
pub trait TrackingService: Send + Sync {
    async fn get_tracking_data(&self, order_id: Uuid) -> Result<TrackingSnapshot, AppError>;

    async fn get_driver_location(&self, driver_id: &str) -> Result<GeoPoint, AppError>;
}

/// Fire-and-forget. Implementations must not block or panic.
pub trait AnalyticsService: Send + Sync {
    fn track_event(&self, name: &str, payload: Value);
}

#[async_trait]
pub trait CartService: Send + Sync {
    async fn add_items(&self, items: &[OrderItem]) -> Result<(), AppError>;
}

#[async_trait]
pub trait GeolocationProvider: Send + Sync {
    /// Fails with `PermissionDenied` or `PositionUnavailable`.
    async fn current_position(&self) -> Result<GeoPoint, AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Granted,
    Denied,
    Default,
}

#[async_trait]
pub trait NotificationProvider: Send + Sync {
    /// Current permission without prompting.
    fn permission(&self) -> Permission;

    async fn request_permission(&self) -> Permission;

    fn show(&self, title: &str, body: &str) -> Result<(), AppError>;
}

#[async_trait]
pub trait ShareProvider: Send + Sync {
    async fn share(&self, title: &str, text: &str, url: &str) -> Result<(), AppError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
