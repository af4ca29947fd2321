use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::estimate::{format_eta, EstimateCalculator, EstimatedTimes};
use crate::engine::notifications::{NotificationDispatcher, Toast, ToastLevel};
use crate::engine::poller::{PollerHandle, PollerState, StatusChanged, TrackingPoller, TrackingState};
use crate::engine::progress::progress_percentage;
use crate::engine::timeline::{classify, ClassifiedStage, STAGES};
use crate::error::AppError;
use crate::models::order::{Order, OrderEvent, OrderStatus};
use crate::models::tracking::{GeoPoint, TrackingSnapshot};
use crate::observability::metrics::Metrics;
use crate::services::{
    AnalyticsService, CartService, Clock, GeolocationProvider, NotificationProvider, OrderService,
    ShareProvider, TrackingService,
};

/// Everything a tracking session talks to.
#[derive(Clone)]
pub struct TrackingDeps {
    pub orders: Arc<dyn OrderService>,
    pub tracking: Arc<dyn TrackingService>,
    pub analytics: Arc<dyn AnalyticsService>,
    pub cart: Arc<dyn CartService>,
    pub geolocation: Arc<dyn GeolocationProvider>,
    pub notifier: Arc<dyn NotificationProvider>,
    pub share: Arc<dyn ShareProvider>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub poll_interval: Duration,
    pub assumed_speed_kmh: f64,
    pub event_buffer_size: usize,
    pub auto_refresh: bool,
    pub notifications: bool,
    pub public_base_url: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            poll_interval: crate::engine::poller::DEFAULT_POLL_INTERVAL,
            assumed_speed_kmh: crate::engine::estimate::DEFAULT_ASSUMED_SPEED_KMH,
            event_buffer_size: 64,
            auto_refresh: true,
            notifications: true,
            public_base_url: "http://localhost:3000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tab {
    #[default]
    Status,
    Map,
    Details,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuickActionId {
    ContactRestaurant,
    ContactDriver,
    RequestLocation,
    Reorder,
    Rate,
    Share,
    Support,
}

impl QuickActionId {
    pub fn label(self) -> &'static str {
        match self {
            QuickActionId::ContactRestaurant => "Call restaurant",
            QuickActionId::ContactDriver => "Call driver",
            QuickActionId::RequestLocation => "Use my location",
            QuickActionId::Reorder => "Order again",
            QuickActionId::Rate => "Rate order",
            QuickActionId::Share => "Share tracking",
            QuickActionId::Support => "Get help",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QuickActionId::ContactRestaurant => "contact_restaurant",
            QuickActionId::ContactDriver => "contact_driver",
            QuickActionId::RequestLocation => "request_location",
            QuickActionId::Reorder => "reorder",
            QuickActionId::Rate => "rate",
            QuickActionId::Share => "share",
            QuickActionId::Support => "support",
        }
    }
}

impl std::str::FromStr for QuickActionId {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        [
            QuickActionId::ContactRestaurant,
            QuickActionId::ContactDriver,
            QuickActionId::RequestLocation,
            QuickActionId::Reorder,
            QuickActionId::Rate,
            QuickActionId::Share,
            QuickActionId::Support,
        ]
        .into_iter()
        .find(|id| id.as_str() == raw)
        .ok_or_else(|| AppError::NotFound(format!("unknown action {raw}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuickAction {
    pub id: QuickActionId,
    pub label: &'static str,
    pub disabled: bool,
}

impl QuickAction {
    fn new(id: QuickActionId, disabled: bool) -> Self {
        Self {
            id,
            label: id.label(),
            disabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContactTarget {
    pub name: String,
    pub phone: String,
    pub uri: String,
}

impl ContactTarget {
    fn phone(name: &str, phone: &str) -> Self {
        let dialable: String = phone
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '+')
            .collect();
        Self {
            name: name.to_string(),
            phone: phone.to_string(),
            uri: format!("tel:{dialable}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionResult {
    Contact(ContactTarget),
    Location(GeoPoint),
    OpenUrl { url: String },
    RatingPrompt,
    Done,
}

/// Quick actions for a status. Share and support are always offered.
pub fn quick_actions(
    status: Option<OrderStatus>,
    has_driver_phone: bool,
    rated: bool,
) -> Vec<QuickAction> {
    let mut actions = Vec::new();
    match status {
        Some(OrderStatus::Preparing) => {
            actions.push(QuickAction::new(QuickActionId::ContactRestaurant, false));
        }
        Some(OrderStatus::OutForDelivery) => {
            actions.push(QuickAction::new(QuickActionId::ContactDriver, !has_driver_phone));
            actions.push(QuickAction::new(QuickActionId::RequestLocation, false));
        }
        Some(OrderStatus::Delivered) => {
            actions.push(QuickAction::new(QuickActionId::Reorder, false));
            actions.push(QuickAction::new(QuickActionId::Rate, rated));
        }
        _ => {}
    }
    actions.push(QuickAction::new(QuickActionId::Share, false));
    actions.push(QuickAction::new(QuickActionId::Support, false));
    actions
}

/// Everything the presentation layer renders for one tracked order.
#[derive(Debug, Clone, Serialize)]
pub struct TrackingView {
    pub order_id: Uuid,
    pub poller_state: PollerState,
    pub order: Option<Order>,
    pub snapshot: Option<TrackingSnapshot>,
    pub driver_location: Option<GeoPoint>,
    pub user_location: Option<GeoPoint>,
    pub stages: Vec<ClassifiedStage>,
    pub progress_percentage: u8,
    pub estimated_times: EstimatedTimes,
    pub ready_eta: String,
    pub delivery_eta: String,
    pub quick_actions: Vec<QuickAction>,
    pub active_tab: Tab,
    pub auto_refresh: bool,
    pub notifications_enabled: bool,
    pub restaurant_contact: Option<ContactTarget>,
    pub driver_contact: Option<ContactTarget>,
    pub rating_prompt_open: bool,
    pub rated: bool,
    pub events: Vec<OrderEvent>,
    pub notices: Vec<Toast>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct UiState {
    active_tab: Tab,
    auto_refresh: bool,
    user_location: Option<GeoPoint>,
    rating_prompt_open: bool,
    rated: bool,
    events: Vec<OrderEvent>,
}

/// View-facing state of one order tracking session.
///
/// Reads the poller's committed state and never writes it; user actions go to
/// the external services directly.
pub struct TrackingViewModel {
    order_id: Uuid,
    deps: TrackingDeps,
    options: SessionOptions,
    estimator: EstimateCalculator,
    poller: PollerHandle,
    dispatcher: Arc<NotificationDispatcher>,
    ui: Arc<RwLock<UiState>>,
    cancel: CancellationToken,
    reactor: JoinHandle<()>,
}

impl TrackingViewModel {
    /// Opens a session: resolves notification permission, loads the order and
    /// starts the refresh loop. Fails only when the order cannot be loaded.
    pub async fn open(
        order_id: Uuid,
        deps: TrackingDeps,
        options: SessionOptions,
        metrics: Metrics,
    ) -> Result<Self, AppError> {
        let dispatcher = Arc::new(NotificationDispatcher::new(
            deps.notifier.clone(),
            deps.clock.clone(),
            options.notifications,
            options.event_buffer_size,
            metrics.clone(),
        ));
        dispatcher.init_permission().await;

        let poller = TrackingPoller::new(
            order_id,
            deps.orders.clone(),
            deps.tracking.clone(),
            deps.clock.clone(),
            options.poll_interval,
            options.event_buffer_size,
            metrics,
        );
        let events = poller.subscribe();
        let poller = poller.start(options.auto_refresh).await?;

        let ui = Arc::new(RwLock::new(UiState {
            auto_refresh: options.auto_refresh,
            ..UiState::default()
        }));
        let cancel = CancellationToken::new();
        let reactor = tokio::spawn(react_to_status_changes(
            events,
            dispatcher.clone(),
            deps.analytics.clone(),
            ui.clone(),
            cancel.clone(),
        ));

        deps.analytics.track_event(
            "order_tracking_viewed",
            json!({ "order_id": order_id }),
        );

        Ok(Self {
            order_id,
            estimator: EstimateCalculator::new(options.assumed_speed_kmh),
            deps,
            options,
            poller,
            dispatcher,
            ui,
            cancel,
            reactor,
        })
    }

    pub fn order_id(&self) -> Uuid {
        self.order_id
    }

    pub fn subscribe_status(&self) -> tokio::sync::broadcast::Receiver<StatusChanged> {
        self.poller.subscribe()
    }

    pub fn subscribe_toasts(&self) -> tokio::sync::broadcast::Receiver<Toast> {
        self.dispatcher.subscribe()
    }

    pub fn state(&self) -> TrackingState {
        self.poller.state()
    }

    pub fn view(&self) -> TrackingView {
        let state = self.poller.state();
        let ui = self.ui.read();
        let status = state.status();

        let estimated_times = match status {
            Some(status) => self.estimator.estimate(
                status,
                state.driver_location.as_ref(),
                ui.user_location.as_ref(),
                self.deps.clock.now(),
            ),
            None => EstimatedTimes::default(),
        };

        let driver_contact = state
            .snapshot
            .as_ref()
            .and_then(|snapshot| snapshot.driver.as_ref())
            .map(|driver| ContactTarget::phone(&driver.name, &driver.phone));
        let restaurant_contact = state
            .order
            .as_ref()
            .map(|order| ContactTarget::phone(&order.restaurant.name, &order.restaurant.phone));

        TrackingView {
            order_id: self.order_id,
            poller_state: state.poller,
            stages: classify(&STAGES, status.unwrap_or(OrderStatus::Unknown)),
            progress_percentage: status.map(progress_percentage).unwrap_or(0),
            ready_eta: format_eta(estimated_times.ready_at),
            delivery_eta: format_eta(estimated_times.delivery_at),
            estimated_times,
            quick_actions: quick_actions(status, driver_contact.is_some(), ui.rated),
            active_tab: ui.active_tab,
            auto_refresh: ui.auto_refresh,
            notifications_enabled: self.dispatcher.is_enabled(),
            restaurant_contact,
            driver_contact,
            rating_prompt_open: ui.rating_prompt_open,
            rated: ui.rated,
            events: ui.events.clone(),
            notices: self.dispatcher.recent_toasts(),
            user_location: ui.user_location.clone(),
            order: state.order,
            snapshot: state.snapshot,
            driver_location: state.driver_location,
            last_refreshed_at: state.last_refreshed_at,
            last_error: state.last_error,
        }
    }

    pub fn set_active_tab(&self, tab: Tab) {
        self.ui.write().active_tab = tab;
    }

    /// Turns background refresh on or off. A finished order stays finished:
    /// turning refresh back on after a terminal status changes nothing.
    pub fn set_auto_refresh(&self, enabled: bool) {
        if enabled && self.poller.state().poller == PollerState::Terminal {
            return;
        }
        {
            let mut ui = self.ui.write();
            if ui.auto_refresh == enabled {
                return;
            }
            ui.auto_refresh = enabled;
        }
        self.poller.set_auto_refresh(enabled);
        let message = if enabled {
            "Live updates resumed"
        } else {
            "Live updates paused"
        };
        self.dispatcher.toast(ToastLevel::Info, message);
        self.track("auto_refresh_toggled", json!({ "enabled": enabled }));
    }

    pub fn toggle_auto_refresh(&self) -> bool {
        let enabled = !self.ui.read().auto_refresh;
        self.set_auto_refresh(enabled);
        self.ui.read().auto_refresh
    }

    pub fn set_notifications(&self, enabled: bool) {
        if self.dispatcher.is_enabled() == enabled {
            return;
        }
        self.dispatcher.set_enabled(enabled);
        let message = if enabled {
            "Notifications turned on"
        } else {
            "Notifications turned off"
        };
        self.dispatcher.toast(ToastLevel::Info, message);
        self.track("notifications_toggled", json!({ "enabled": enabled }));
    }

    pub fn toggle_notifications(&self) -> bool {
        let enabled = !self.dispatcher.is_enabled();
        self.set_notifications(enabled);
        enabled
    }

    pub fn refresh_now(&self) {
        self.poller.refresh_now();
    }

    /// One-shot device location request. Failures are reported, never retried.
    pub async fn request_user_location(&self) -> Result<GeoPoint, AppError> {
        match self.deps.geolocation.current_position().await {
            Ok(location) => {
                self.ui.write().user_location = Some(location.clone());
                self.dispatcher
                    .toast(ToastLevel::Success, "Location updated for a better estimate");
                self.track("user_location_shared", json!({}));
                Ok(location)
            }
            Err(err) => {
                warn!(order_id = %self.order_id, error = %err, "geolocation request failed");
                self.dispatcher.report("Could not get your location", &err);
                Err(err)
            }
        }
    }

    pub async fn share(&self) -> Result<(), AppError> {
        let order_number = self.current_order()?.order_number;
        let url = format!(
            "{}/orders/{}/track",
            self.options.public_base_url.trim_end_matches('/'),
            self.order_id
        );
        let text = format!("Follow my order #{order_number}");

        match self.deps.share.share("Order tracking", &text, &url).await {
            Ok(()) => {
                self.dispatcher.toast(ToastLevel::Success, "Tracking link shared");
                self.track("tracking_shared", json!({}));
                Ok(())
            }
            Err(err) => {
                self.dispatcher.report("Could not share tracking link", &err);
                Err(err)
            }
        }
    }

    pub async fn rate(&self, rating: u8, review: &str) -> Result<(), AppError> {
        match self.deps.orders.rate_order(self.order_id, rating, review).await {
            Ok(()) => {
                {
                    let mut ui = self.ui.write();
                    ui.rated = true;
                    ui.rating_prompt_open = false;
                }
                self.dispatcher.toast(ToastLevel::Success, "Thanks for rating your order");
                self.track("order_rated", json!({ "rating": rating }));
                Ok(())
            }
            Err(err) => {
                self.dispatcher.report("Could not submit rating", &err);
                Err(err)
            }
        }
    }

    pub fn dismiss_rating_prompt(&self) {
        self.ui.write().rating_prompt_open = false;
    }

    pub async fn reorder(&self) -> Result<(), AppError> {
        let order = self.current_order()?;
        match self.deps.cart.add_items(&order.items).await {
            Ok(()) => {
                self.dispatcher.toast(
                    ToastLevel::Success,
                    format!("Added {} items from {} to your cart", order.items.len(), order.restaurant.name),
                );
                self.track("order_reordered", json!({ "items": order.items.len() }));
                Ok(())
            }
            Err(err) => {
                self.dispatcher.report("Could not reorder", &err);
                Err(err)
            }
        }
    }

    /// Order history, oldest first. Kept for the details tab.
    pub async fn load_events(&self) -> Result<Vec<OrderEvent>, AppError> {
        match self.deps.orders.get_order_events(self.order_id).await {
            Ok(events) => {
                self.ui.write().events = events.clone();
                Ok(events)
            }
            Err(err) => {
                warn!(order_id = %self.order_id, error = %err, "order events fetch failed");
                self.dispatcher.report("Could not load order history", &err);
                Err(err)
            }
        }
    }

    pub async fn perform(&self, action: QuickActionId) -> Result<ActionResult, AppError> {
        let view = self.view();
        let available = view
            .quick_actions
            .iter()
            .find(|candidate| candidate.id == action)
            .is_some_and(|candidate| !candidate.disabled);
        if !available {
            return Err(AppError::Conflict(format!(
                "{} is not available right now",
                action.as_str()
            )));
        }

        match action {
            QuickActionId::ContactRestaurant => {
                let contact = view
                    .restaurant_contact
                    .ok_or_else(|| AppError::NotFound("restaurant contact unavailable".to_string()))?;
                self.track("restaurant_contacted", json!({}));
                Ok(ActionResult::Contact(contact))
            }
            QuickActionId::ContactDriver => {
                let contact = view
                    .driver_contact
                    .ok_or_else(|| AppError::NotFound("no driver assigned yet".to_string()))?;
                self.track("driver_contacted", json!({}));
                Ok(ActionResult::Contact(contact))
            }
            QuickActionId::RequestLocation => {
                self.request_user_location().await.map(ActionResult::Location)
            }
            QuickActionId::Reorder => self.reorder().await.map(|()| ActionResult::Done),
            QuickActionId::Rate => {
                self.ui.write().rating_prompt_open = true;
                Ok(ActionResult::RatingPrompt)
            }
            QuickActionId::Share => self.share().await.map(|()| ActionResult::Done),
            QuickActionId::Support => {
                let order_number = view
                    .order
                    .map(|order| order.order_number)
                    .unwrap_or_default();
                self.track("support_opened", json!({}));
                Ok(ActionResult::OpenUrl {
                    url: format!(
                        "{}/support?order={order_number}",
                        self.options.public_base_url.trim_end_matches('/')
                    ),
                })
            }
        }
    }

    /// Stops polling and status reactions. Nothing is published afterwards.
    pub fn close(&self) {
        self.cancel.cancel();
        self.poller.stop();
        info!(order_id = %self.order_id, "tracking session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancelled once the session is closed.
    pub fn closed(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn current_order(&self) -> Result<Order, AppError> {
        self.poller
            .state()
            .order
            .ok_or_else(|| AppError::NotFound(format!("order {} not loaded", self.order_id)))
    }

    fn track(&self, name: &str, mut payload: serde_json::Value) {
        if let Some(fields) = payload.as_object_mut() {
            fields.insert("order_id".to_string(), json!(self.order_id));
        }
        self.deps.analytics.track_event(name, payload);
    }
}

impl Drop for TrackingViewModel {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.reactor.abort();
    }
}

async fn react_to_status_changes(
    mut events: tokio::sync::broadcast::Receiver<StatusChanged>,
    dispatcher: Arc<NotificationDispatcher>,
    analytics: Arc<dyn AnalyticsService>,
    ui: Arc<RwLock<UiState>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };

        match event {
            Ok(event) => {
                let dispatched = dispatcher.notify(&event);
                if dispatched.rating_prompt {
                    ui.write().rating_prompt_open = true;
                }
                analytics.track_event(
                    "order_status_changed",
                    json!({
                        "order_id": event.order_id,
                        "from": event.previous,
                        "to": event.next,
                    }),
                );
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "status change reactions lagged");
            }
            Err(RecvError::Closed) => return,
        }
    }
}
