use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::geo::step_towards;
use crate::models::order::{Address, Order, OrderEvent, OrderItem, OrderStatus, Restaurant};
use crate::models::tracking::{Driver, GeoPoint, TrackingSnapshot, Vehicle};
use crate::services::{CartService, OrderService, TrackingService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    GetOrder,
    GetOrderEvents,
    RateOrder,
    GetTracking,
    GetDriverLocation,
    AddToCart,
}

#[derive(Debug, Clone)]
pub struct Rating {
    pub rating: u8,
    pub review: String,
}

/// In-process order, tracking and cart backend.
///
/// Counts every call and can be told to fail the next N calls of a kind or to
/// answer slowly, so refresh behavior can be exercised without a network.
#[derive(Default)]
pub struct InMemoryBackend {
    orders: DashMap<Uuid, Order>,
    events: DashMap<Uuid, Vec<OrderEvent>>,
    tracking: DashMap<Uuid, TrackingSnapshot>,
    driver_locations: DashMap<String, GeoPoint>,
    ratings: DashMap<Uuid, Rating>,
    cart: RwLock<Vec<OrderItem>>,
    calls: DashMap<Call, AtomicUsize>,
    failures: DashMap<Call, usize>,
    latency: RwLock<Option<Duration>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_order(&self, order: Order) {
        self.events.entry(order.id).or_default().push(OrderEvent {
            timestamp: order.created_at,
            description: format!("Order {} placed", order.order_number),
        });
        self.orders.insert(order.id, order);
    }

    pub fn set_status(&self, id: Uuid, status: OrderStatus) -> Result<(), AppError> {
        let mut order = self
            .orders
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("order {id} not found")))?;

        let now = Utc::now();
        order.status = status;
        order.updated_at = now;
        self.events.entry(id).or_default().push(OrderEvent {
            timestamp: now,
            description: format!("Status changed to {status}"),
        });
        Ok(())
    }

    pub fn set_tracking(&self, order_id: Uuid, snapshot: TrackingSnapshot) {
        self.tracking.insert(order_id, snapshot);
    }

    pub fn set_driver_location(&self, driver_id: &str, location: GeoPoint) {
        self.driver_locations.insert(driver_id.to_string(), location);
    }

    pub fn driver_location(&self, driver_id: &str) -> Option<GeoPoint> {
        self.driver_locations.get(driver_id).map(|entry| entry.value().clone())
    }

    /// Fail the next `times` calls of kind `call` with an upstream error.
    pub fn fail_next(&self, call: Call, times: usize) {
        self.failures.insert(call, times);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    pub fn calls(&self, call: Call) -> usize {
        self.calls
            .get(&call)
            .map(|count| count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn rating(&self, order_id: Uuid) -> Option<Rating> {
        self.ratings.get(&order_id).map(|entry| entry.value().clone())
    }

    pub fn cart_items(&self) -> Vec<OrderItem> {
        self.cart.read().clone()
    }

    async fn enter(&self, call: Call) -> Result<(), AppError> {
        self.calls
            .entry(call)
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(mut remaining) = self.failures.get_mut(&call) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AppError::Upstream(format!("injected failure for {call:?}")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl OrderService for InMemoryBackend {
    async fn get_order_by_id(&self, id: Uuid) -> Result<Order, AppError> {
        self.enter(Call::GetOrder).await?;
        self.orders
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("order {id} not found")))
    }

    async fn get_order_events(&self, id: Uuid) -> Result<Vec<OrderEvent>, AppError> {
        self.enter(Call::GetOrderEvents).await?;
        if !self.orders.contains_key(&id) {
            return Err(AppError::NotFound(format!("order {id} not found")));
        }
        let mut events = self
            .events
            .get(&id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        events.sort_by_key(|event| event.timestamp);
        Ok(events)
    }

    async fn rate_order(&self, id: Uuid, rating: u8, review: &str) -> Result<(), AppError> {
        self.enter(Call::RateOrder).await?;
        if !(1..=5).contains(&rating) {
            return Err(AppError::Validation(format!(
                "rating must be between 1 and 5, got {rating}"
            )));
        }
        if !self.orders.contains_key(&id) {
            return Err(AppError::NotFound(format!("order {id} not found")));
        }
        self.ratings.insert(
            id,
            Rating {
                rating,
                review: review.to_string(),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl TrackingService for InMemoryBackend {
    async fn get_tracking_data(&self, order_id: Uuid) -> Result<TrackingSnapshot, AppError> {
        self.enter(Call::GetTracking).await?;
        Ok(self
            .tracking
            .get(&order_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn get_driver_location(&self, driver_id: &str) -> Result<GeoPoint, AppError> {
        self.enter(Call::GetDriverLocation).await?;
        self.driver_location(driver_id)
            .ok_or_else(|| AppError::NotFound(format!("no location for driver {driver_id}")))
    }
}

#[async_trait]
impl CartService for InMemoryBackend {
    async fn add_items(&self, items: &[OrderItem]) -> Result<(), AppError> {
        self.enter(Call::AddToCart).await?;
        self.cart.write().extend_from_slice(items);
        Ok(())
    }
}

pub const DEMO_DRIVER_ID: &str = "driver-7";

pub fn demo_order() -> Order {
    let now = Utc::now();
    Order {
        id: Uuid::new_v4(),
        order_number: "WG-1042".to_string(),
        status: OrderStatus::Pending,
        created_at: now,
        updated_at: now,
        restaurant: Restaurant {
            name: "Ember & Wing".to_string(),
            address: "12 Market St, San Francisco".to_string(),
            phone: "+1-415-555-0134".to_string(),
            location: Some(GeoPoint::new(37.7936, -122.3958)),
        },
        delivery_address: Address {
            street: "480 Castro St".to_string(),
            city: "San Francisco".to_string(),
            instructions: Some("Ring twice".to_string()),
            location: Some(GeoPoint::new(37.7617, -122.4351)),
        },
        items: vec![
            OrderItem {
                menu_item_id: "wings-12".to_string(),
                name: "Smoked wings (12)".to_string(),
                quantity: 1,
                unit_price: 16.5,
            },
            OrderItem {
                menu_item_id: "fries".to_string(),
                name: "Seasoned fries".to_string(),
                quantity: 2,
                unit_price: 4.0,
            },
        ],
    }
}

/// Walks an order through the lifecycle, one status per `step`, moving the
/// driver towards the delivery address while out for delivery.
pub async fn simulate_order_progress(backend: Arc<InMemoryBackend>, order_id: Uuid, step: Duration) {
    let sequence = [
        OrderStatus::Confirmed,
        OrderStatus::Preparing,
        OrderStatus::Ready,
        OrderStatus::OutForDelivery,
        OrderStatus::Delivered,
    ];

    let (origin, destination) = match backend.orders.get(&order_id) {
        Some(order) => (
            order.restaurant.location.clone(),
            order.delivery_address.location.clone(),
        ),
        None => {
            warn!(order_id = %order_id, "demo order missing; simulation not started");
            return;
        }
    };

    for status in sequence {
        tokio::time::sleep(step).await;

        if status == OrderStatus::Ready {
            backend.set_tracking(
                order_id,
                TrackingSnapshot {
                    driver_id: Some(DEMO_DRIVER_ID.to_string()),
                    driver: Some(Driver {
                        name: "Sam Rivera".to_string(),
                        rating: 4.9,
                        phone: "+1-415-555-0199".to_string(),
                    }),
                    vehicle: Some(Vehicle {
                        kind: "scooter".to_string(),
                        plate: "7XKR219".to_string(),
                        color: Some("red".to_string()),
                    }),
                    current_stage: Some(status.as_str().to_string()),
                },
            );
            if let Some(origin) = &origin {
                backend.set_driver_location(DEMO_DRIVER_ID, origin.clone());
            }
        }

        if status == OrderStatus::OutForDelivery {
            if let (Some(from), Some(to)) = (&origin, &destination) {
                for leg in 1..=4 {
                    backend.set_driver_location(DEMO_DRIVER_ID, step_towards(from, to, leg as f64 / 5.0));
                    tokio::time::sleep(step / 5).await;
                }
            }
        }

        if let Err(err) = backend.set_status(order_id, status) {
            warn!(order_id = %order_id, error = %err, "demo progression stopped");
            return;
        }
        info!(order_id = %order_id, status = %status, "demo order advanced");
    }
}
