use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::engine::poller::StatusChanged;
use crate::error::AppError;
use crate::models::order::OrderStatus;
use crate::observability::metrics::Metrics;
use crate::services::{Clock, NotificationProvider, Permission};

const RECENT_TOASTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToastLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// In-app message shown by the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Toast {
    pub level: ToastLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatched {
    pub toast: bool,
    pub platform: bool,
    pub rating_prompt: bool,
}

pub fn status_message(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Pending => "Your order has been placed",
        OrderStatus::Confirmed => "The restaurant confirmed your order",
        OrderStatus::Preparing => "Your order is being prepared",
        OrderStatus::Ready => "Your order is ready and waiting for a driver",
        OrderStatus::OutForDelivery => "Your order is out for delivery",
        OrderStatus::Delivered => "Your order has been delivered. Enjoy!",
        OrderStatus::Cancelled => "Your order was cancelled",
        OrderStatus::Unknown => "Your order status was updated",
    }
}

/// Turns status transitions into toasts and platform notifications for one
/// tracking session.
pub struct NotificationDispatcher {
    provider: Arc<dyn NotificationProvider>,
    clock: Arc<dyn Clock>,
    enabled: AtomicBool,
    permission: Mutex<Option<Permission>>,
    rating_requested: AtomicBool,
    toasts_tx: broadcast::Sender<Toast>,
    recent: Mutex<VecDeque<Toast>>,
    metrics: Metrics,
}

impl NotificationDispatcher {
    pub fn new(
        provider: Arc<dyn NotificationProvider>,
        clock: Arc<dyn Clock>,
        enabled: bool,
        buffer_size: usize,
        metrics: Metrics,
    ) -> Self {
        let (toasts_tx, _unused_rx) = broadcast::channel(buffer_size.max(1));
        Self {
            provider,
            clock,
            enabled: AtomicBool::new(enabled),
            permission: Mutex::new(None),
            rating_requested: AtomicBool::new(false),
            toasts_tx,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_TOASTS)),
            metrics,
        }
    }

    /// Resolves the platform permission once per session. An undecided
    /// permission is asked for here and never again.
    pub async fn init_permission(&self) -> Permission {
        let resolved = *self.permission.lock();
        if let Some(permission) = resolved {
            return permission;
        }

        let mut permission = self.provider.permission();
        if permission == Permission::Default {
            permission = self.provider.request_permission().await;
            info!(?permission, "notification permission requested");
        }

        *self.permission.lock() = Some(permission);
        permission
    }

    pub fn permission(&self) -> Option<Permission> {
        *self.permission.lock()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Toast> {
        self.toasts_tx.subscribe()
    }

    pub fn recent_toasts(&self) -> Vec<Toast> {
        self.recent.lock().iter().cloned().collect()
    }

    pub fn toast(&self, level: ToastLevel, message: impl Into<String>) {
        let toast = Toast {
            level,
            message: message.into(),
            at: self.clock.now(),
        };
        debug!(?level, message = %toast.message, "toast");

        {
            let mut recent = self.recent.lock();
            if recent.len() == RECENT_TOASTS {
                recent.pop_front();
            }
            recent.push_back(toast.clone());
        }
        self.metrics
            .notifications_total
            .with_label_values(&["toast"])
            .inc();
        let _ = self.toasts_tx.send(toast);
    }

    /// Surfaces an error from a user action. Never propagates.
    pub fn report(&self, context: &str, err: &AppError) {
        let level = if err.is_user_input() {
            ToastLevel::Warning
        } else {
            ToastLevel::Error
        };
        self.toast(level, format!("{context}: {err}"));
    }

    pub fn notify(&self, event: &StatusChanged) -> Dispatched {
        let mut dispatched = Dispatched::default();

        if event.next == OrderStatus::Delivered
            && !self.rating_requested.swap(true, Ordering::SeqCst)
        {
            dispatched.rating_prompt = true;
        }

        if !self.is_enabled() {
            return dispatched;
        }

        let message = status_message(event.next);
        self.toast(ToastLevel::Info, message);
        dispatched.toast = true;

        if self.permission() == Some(Permission::Granted) {
            match self.provider.show("Order update", message) {
                Ok(()) => {
                    self.metrics
                        .notifications_total
                        .with_label_values(&["platform"])
                        .inc();
                    dispatched.platform = true;
                }
                Err(err) => {
                    warn!(order_id = %event.order_id, error = %err, "platform notification failed");
                }
            }
        }

        dispatched
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::services::headless::HeadlessNotifier;
    use crate::services::{ManualClock, SystemClock};

    fn changed(previous: OrderStatus, next: OrderStatus) -> StatusChanged {
        StatusChanged {
            order_id: Uuid::nil(),
            previous,
            next,
            observed_at: Utc::now(),
        }
    }

    fn dispatcher(provider: Arc<HeadlessNotifier>, enabled: bool) -> NotificationDispatcher {
        NotificationDispatcher::new(provider, Arc::new(SystemClock), enabled, 16, Metrics::new())
    }

    #[tokio::test]
    async fn undecided_permission_is_requested_once() {
        let provider = Arc::new(HeadlessNotifier::new(Permission::Default, Permission::Granted));
        let dispatcher = dispatcher(provider.clone(), true);

        assert_eq!(dispatcher.init_permission().await, Permission::Granted);
        assert_eq!(dispatcher.init_permission().await, Permission::Granted);
        dispatcher.notify(&changed(OrderStatus::Preparing, OrderStatus::Ready));
        dispatcher.notify(&changed(OrderStatus::Ready, OrderStatus::OutForDelivery));

        assert_eq!(provider.prompts(), 1);
        assert_eq!(provider.shown().len(), 2);
    }

    #[tokio::test]
    async fn granted_permission_is_not_prompted() {
        let provider = Arc::new(HeadlessNotifier::granted());
        let dispatcher = dispatcher(provider.clone(), true);
        dispatcher.init_permission().await;
        assert_eq!(provider.prompts(), 0);
    }

    #[tokio::test]
    async fn denied_permission_still_gets_in_app_toast() {
        let provider = Arc::new(HeadlessNotifier::new(Permission::Denied, Permission::Denied));
        let dispatcher = dispatcher(provider.clone(), true);
        dispatcher.init_permission().await;

        let dispatched = dispatcher.notify(&changed(OrderStatus::Ready, OrderStatus::OutForDelivery));
        assert!(dispatched.toast);
        assert!(!dispatched.platform);
        assert!(provider.shown().is_empty());
        assert_eq!(
            dispatcher.recent_toasts()[0].message,
            "Your order is out for delivery"
        );
    }

    #[tokio::test]
    async fn disabled_preference_suppresses_everything_but_rating() {
        let provider = Arc::new(HeadlessNotifier::granted());
        let dispatcher = dispatcher(provider.clone(), false);
        dispatcher.init_permission().await;

        let dispatched =
            dispatcher.notify(&changed(OrderStatus::OutForDelivery, OrderStatus::Delivered));
        assert_eq!(
            dispatched,
            Dispatched {
                toast: false,
                platform: false,
                rating_prompt: true,
            }
        );
        assert!(provider.shown().is_empty());
        assert!(dispatcher.recent_toasts().is_empty());
    }

    #[tokio::test]
    async fn rating_prompt_fires_once_per_delivery() {
        let provider = Arc::new(HeadlessNotifier::granted());
        let dispatcher = dispatcher(provider, true);
        dispatcher.init_permission().await;

        let first = dispatcher.notify(&changed(OrderStatus::OutForDelivery, OrderStatus::Delivered));
        let second = dispatcher.notify(&changed(OrderStatus::Unknown, OrderStatus::Delivered));
        assert!(first.rating_prompt);
        assert!(!second.rating_prompt);
    }

    #[tokio::test]
    async fn revoked_permission_does_not_panic() {
        let provider = Arc::new(HeadlessNotifier::granted());
        let dispatcher = dispatcher(provider.clone(), true);
        dispatcher.init_permission().await;
        provider.revoke();

        let dispatched = dispatcher.notify(&changed(OrderStatus::Preparing, OrderStatus::Ready));
        assert!(dispatched.toast);
        assert!(!dispatched.platform);
    }

    #[test]
    fn unknown_status_gets_generic_message() {
        assert_eq!(
            status_message(OrderStatus::Unknown),
            "Your order status was updated"
        );
    }

    #[test]
    fn toasts_are_stamped_with_the_session_clock() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 18, 30, 0).unwrap();
        let dispatcher = NotificationDispatcher::new(
            Arc::new(HeadlessNotifier::granted()),
            Arc::new(ManualClock::new(at)),
            true,
            16,
            Metrics::new(),
        );
        dispatcher.toast(ToastLevel::Info, "hello");
        assert_eq!(dispatcher.recent_toasts()[0].at, at);
    }

    #[test]
    fn recent_toasts_are_bounded() {
        let dispatcher = dispatcher(Arc::new(HeadlessNotifier::granted()), true);
        for i in 0..15 {
            dispatcher.toast(ToastLevel::Info, format!("toast {i}"));
        }
        let recent = dispatcher.recent_toasts();
        assert_eq!(recent.len(), RECENT_TOASTS);
        assert_eq!(recent[0].message, "toast 5");
    }
}
