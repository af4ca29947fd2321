use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use order_tracker::engine::poller::PollerState;
use order_tracker::engine::view_model::{
    ActionResult, QuickActionId, SessionOptions, Tab, TrackingDeps, TrackingViewModel,
};
use order_tracker::models::order::OrderStatus;
use order_tracker::models::tracking::{GeoPoint, TrackingSnapshot};
use order_tracker::observability::metrics::Metrics;
use order_tracker::services::headless::{
    FixedGeolocation, HeadlessNotifier, LoggingAnalytics, LoggingShare,
};
use order_tracker::services::memory::{demo_order, Call, InMemoryBackend};
use order_tracker::services::{Clock, ManualClock, Permission};
use uuid::Uuid;

struct Session {
    vm: TrackingViewModel,
    backend: Arc<InMemoryBackend>,
    notifier: Arc<HeadlessNotifier>,
    share: Arc<LoggingShare>,
    clock: Arc<ManualClock>,
    order_id: Uuid,
}

async fn session(status: OrderStatus, notifier: HeadlessNotifier, user: GeoPoint) -> Session {
    let backend = Arc::new(InMemoryBackend::new());
    let mut order = demo_order();
    order.status = status;
    let order_id = order.id;
    backend.insert_order(order);
    backend.set_tracking(
        order_id,
        TrackingSnapshot {
            driver_id: Some("d-1".to_string()),
            ..TrackingSnapshot::default()
        },
    );
    backend.set_driver_location("d-1", GeoPoint::new(0.0, 0.0));

    let notifier = Arc::new(notifier);
    let share = Arc::new(LoggingShare::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 5, 1, 18, 0, 0).unwrap(),
    ));

    let deps = TrackingDeps {
        orders: backend.clone(),
        tracking: backend.clone(),
        analytics: Arc::new(LoggingAnalytics::new()),
        cart: backend.clone(),
        geolocation: Arc::new(FixedGeolocation::at(user)),
        notifier: notifier.clone(),
        share: share.clone(),
        clock: clock.clone(),
    };
    let options = SessionOptions {
        public_base_url: "https://eat.example/".to_string(),
        ..SessionOptions::default()
    };

    let vm = TrackingViewModel::open(order_id, deps, options, Metrics::new())
        .await
        .unwrap();
    Session {
        vm,
        backend,
        notifier,
        share,
        clock,
        order_id,
    }
}

#[tokio::test(start_paused = true)]
async fn eta_follows_driver_distance_once_user_location_is_known() {
    let s = session(
        OrderStatus::OutForDelivery,
        HeadlessNotifier::granted(),
        GeoPoint::new(0.0, 0.27),
    )
    .await;
    let now = s.clock.now();

    let before = s.vm.view();
    assert_eq!(
        before.estimated_times.delivery_at,
        Some(now + chrono::Duration::minutes(15))
    );

    s.vm.request_user_location().await.unwrap();
    let after = s.vm.view();
    let minutes = (after.estimated_times.delivery_at.unwrap() - now).num_seconds() as f64 / 60.0;
    assert!((minutes - 60.0).abs() < 0.5, "got {minutes} minutes");
    assert_eq!(after.delivery_eta, "19:00");
}

#[tokio::test(start_paused = true)]
async fn estimates_are_recomputed_from_the_clock() {
    let s = session(
        OrderStatus::Preparing,
        HeadlessNotifier::granted(),
        GeoPoint::new(0.0, 0.0),
    )
    .await;

    assert_eq!(s.vm.view().ready_eta, "18:15");
    s.clock.advance(chrono::Duration::minutes(5));
    assert_eq!(s.vm.view().ready_eta, "18:20");
    assert_eq!(s.vm.view().delivery_eta, "18:35");
}

#[tokio::test(start_paused = true)]
async fn permission_prompt_happens_once_per_session() {
    let s = session(
        OrderStatus::Confirmed,
        HeadlessNotifier::new(Permission::Default, Permission::Granted),
        GeoPoint::new(0.0, 0.0),
    )
    .await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    for status in [
        OrderStatus::Preparing,
        OrderStatus::Ready,
        OrderStatus::OutForDelivery,
    ] {
        s.backend.set_status(s.order_id, status).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
    }

    assert_eq!(s.notifier.prompts(), 1);
    assert_eq!(s.notifier.shown().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn notifications_toggle_silences_status_toasts() {
    let s = session(
        OrderStatus::Preparing,
        HeadlessNotifier::granted(),
        GeoPoint::new(0.0, 0.0),
    )
    .await;

    assert!(!s.vm.toggle_notifications());
    s.backend.set_status(s.order_id, OrderStatus::Ready).unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;

    let view = s.vm.view();
    assert_eq!(view.order.unwrap().status, OrderStatus::Ready);
    assert!(!view.notifications_enabled);
    assert!(s.notifier.shown().is_empty());
    assert_eq!(view.notices.len(), 1);
    assert_eq!(view.notices[0].message, "Notifications turned off");
}

#[tokio::test(start_paused = true)]
async fn toggling_auto_refresh_twice_resumes_single_loop() {
    let s = session(
        OrderStatus::Preparing,
        HeadlessNotifier::granted(),
        GeoPoint::new(0.0, 0.0),
    )
    .await;

    assert!(!s.vm.toggle_auto_refresh());
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(s.vm.view().poller_state, PollerState::Paused);
    assert_eq!(s.backend.calls(Call::GetOrder), 1);

    assert!(s.vm.toggle_auto_refresh());
    tokio::time::sleep(Duration::from_secs(21)).await;
    assert_eq!(s.backend.calls(Call::GetOrder), 3);
}

#[tokio::test(start_paused = true)]
async fn share_builds_tracking_link() {
    let s = session(
        OrderStatus::Preparing,
        HeadlessNotifier::granted(),
        GeoPoint::new(0.0, 0.0),
    )
    .await;

    let result = s.vm.perform(QuickActionId::Share).await.unwrap();
    assert_eq!(result, ActionResult::Done);
    let shared = s.share.shared();
    assert_eq!(shared.len(), 1);
    assert_eq!(
        shared[0],
        format!(
            "Follow my order #WG-1042 https://eat.example/orders/{}/track",
            s.order_id
        )
    );
}

#[tokio::test(start_paused = true)]
async fn active_tab_and_rating_prompt_are_view_state() {
    let s = session(
        OrderStatus::Delivered,
        HeadlessNotifier::granted(),
        GeoPoint::new(0.0, 0.0),
    )
    .await;

    s.vm.set_active_tab(Tab::Map);
    assert_eq!(s.vm.view().active_tab, Tab::Map);

    let result = s.vm.perform(QuickActionId::Rate).await.unwrap();
    assert_eq!(result, ActionResult::RatingPrompt);
    assert!(s.vm.view().rating_prompt_open);

    s.vm.dismiss_rating_prompt();
    assert!(!s.vm.view().rating_prompt_open);
}

#[tokio::test(start_paused = true)]
async fn closing_the_session_stops_polling() {
    let s = session(
        OrderStatus::Ready,
        HeadlessNotifier::granted(),
        GeoPoint::new(0.0, 0.0),
    )
    .await;

    s.vm.close();
    assert!(s.vm.is_closed());
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(s.backend.calls(Call::GetOrder), 1);
}
