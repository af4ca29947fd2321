use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::order::{Order, OrderStatus};
use crate::models::tracking::{GeoPoint, TrackingSnapshot};
use crate::observability::metrics::Metrics;
use crate::services::{Clock, OrderService, TrackingService};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    Idle,
    Loading,
    ActivePolling,
    Paused,
    Terminal,
    Error,
}

/// Committed view of one order. Only the poll loop writes it.
#[derive(Debug, Clone, Serialize)]
pub struct TrackingState {
    pub poller: PollerState,
    pub order: Option<Order>,
    pub snapshot: Option<TrackingSnapshot>,
    pub driver_location: Option<GeoPoint>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl TrackingState {
    fn idle() -> Self {
        Self {
            poller: PollerState::Idle,
            order: None,
            snapshot: None,
            driver_location: None,
            last_refreshed_at: None,
            last_error: None,
        }
    }

    pub fn status(&self) -> Option<OrderStatus> {
        self.order.as_ref().map(|order| order.status)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChanged {
    pub order_id: Uuid,
    pub previous: OrderStatus,
    pub next: OrderStatus,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Stopped,
    Terminal,
    AutoRefreshOff,
    Inactive,
}

#[derive(Debug)]
enum Command {
    SetAutoRefresh(bool),
    RefreshNow,
}

/// Results of one sequential fetch pass. Later fetches are skipped when the
/// identifiers they need are missing.
struct CycleOutcome {
    order: Result<Order, AppError>,
    snapshot: Option<Result<TrackingSnapshot, AppError>>,
    driver_location: Option<Result<GeoPoint, AppError>>,
}

impl CycleOutcome {
    fn label(&self) -> &'static str {
        let partial = matches!(self.snapshot, Some(Err(_)))
            || matches!(self.driver_location, Some(Err(_)));
        match (&self.order, partial) {
            (Err(_), _) => "failure",
            (Ok(_), true) => "partial",
            (Ok(_), false) => "success",
        }
    }
}

/// Refresh loop for a single order.
///
/// Polls order, tracking and driver location in sequence while the order is
/// active, waiting `interval` after each cycle settles before starting the next.
pub struct TrackingPoller {
    order_id: Uuid,
    orders: Arc<dyn OrderService>,
    tracking: Arc<dyn TrackingService>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    metrics: Metrics,
    events_tx: broadcast::Sender<StatusChanged>,
}

impl TrackingPoller {
    pub fn new(
        order_id: Uuid,
        orders: Arc<dyn OrderService>,
        tracking: Arc<dyn TrackingService>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        event_buffer_size: usize,
        metrics: Metrics,
    ) -> Self {
        let (events_tx, _unused_rx) = broadcast::channel(event_buffer_size.max(1));
        Self {
            order_id,
            orders,
            tracking,
            clock,
            interval,
            metrics,
            events_tx,
        }
    }

    /// Subscribe before `start` to be sure no transition is missed.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChanged> {
        self.events_tx.subscribe()
    }

    /// Performs the initial load and, when it succeeds, spawns the refresh loop.
    ///
    /// A failed initial load is fatal: no loop is spawned and the error is returned.
    pub async fn start(self, auto_refresh: bool) -> Result<PollerHandle, AppError> {
        let (state_tx, state_rx) = watch::channel(TrackingState::idle());
        state_tx.send_modify(|state| state.poller = PollerState::Loading);

        let outcome = self.fetch_cycle(None).await;
        if let Err(err) = &outcome.order {
            warn!(order_id = %self.order_id, error = %err, "initial order load failed");
            state_tx.send_modify(|state| {
                state.poller = PollerState::Error;
                state.last_error = Some(err.to_string());
            });
            return Err(err.clone());
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let order_id = self.order_id;
        let events_tx = self.events_tx.clone();

        let mut poll_loop = PollLoop {
            poller: self,
            auto_refresh,
            timer: PollTimer::default(),
            state_tx,
            commands: command_rx,
            cancel: cancel.clone(),
        };
        poll_loop.commit(outcome);
        let _ = poll_loop.schedule();

        info!(order_id = %order_id, auto_refresh, "order tracking started");
        let task = tokio::spawn(poll_loop.run());

        Ok(PollerHandle {
            order_id,
            commands: command_tx,
            cancel,
            state_rx,
            events_tx,
            task,
        })
    }

    async fn fetch_cycle(&self, previous: Option<OrderStatus>) -> CycleOutcome {
        let order = match self.orders.get_order_by_id(self.order_id).await {
            Ok(order) => order,
            Err(err) => {
                return CycleOutcome {
                    order: Err(err),
                    snapshot: None,
                    driver_location: None,
                };
            }
        };
        debug!(order_id = %self.order_id, status = %order.status, previous = ?previous, "order fetched");

        let snapshot = self.tracking.get_tracking_data(order.id).await;

        let driver_id = match &snapshot {
            Ok(snapshot) if order.status == OrderStatus::OutForDelivery => snapshot.driver_id.clone(),
            _ => None,
        };
        let driver_location = match driver_id {
            Some(driver_id) => Some(self.tracking.get_driver_location(&driver_id).await),
            None => None,
        };

        CycleOutcome {
            order: Ok(order),
            snapshot: Some(snapshot),
            driver_location,
        }
    }
}

#[derive(Debug, Default)]
struct PollTimer {
    deadline: Option<time::Instant>,
}

impl PollTimer {
    fn arm(&mut self, interval: Duration) {
        self.deadline = Some(time::Instant::now() + interval);
    }

    fn disarm(&mut self) {
        self.deadline = None;
    }

    fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    async fn fired(&self) {
        match self.deadline {
            Some(deadline) => time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

struct PollLoop {
    poller: TrackingPoller,
    auto_refresh: bool,
    timer: PollTimer,
    state_tx: watch::Sender<TrackingState>,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
}

impl PollLoop {
    async fn run(mut self) {
        if self.is_terminal() {
            return;
        }

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.cancel_timer(StopReason::Stopped);
                    return;
                }
                command = self.commands.recv() => match command {
                    Some(Command::SetAutoRefresh(enabled)) => self.set_auto_refresh(enabled),
                    Some(Command::RefreshNow) => {
                        self.timer.disarm();
                        if !self.poll_once().await {
                            return;
                        }
                    }
                    None => {
                        self.cancel_timer(StopReason::Stopped);
                        return;
                    }
                },
                _ = self.timer.fired() => {
                    self.timer.disarm();
                    if !self.poll_once().await {
                        return;
                    }
                }
            }
        }
    }

    /// Runs one cycle; returns false once the loop must end.
    async fn poll_once(&mut self) -> bool {
        let previous = self.state_tx.borrow().status();
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            outcome = self.poller.fetch_cycle(previous) => Some(outcome),
        };

        let Some(outcome) = outcome else {
            self.cancel_timer(StopReason::Stopped);
            return false;
        };
        // A stop that raced the last fetch wins; nothing more is published.
        if self.cancel.is_cancelled() {
            self.cancel_timer(StopReason::Stopped);
            return false;
        }

        let label = outcome.label();
        self.poller
            .metrics
            .poll_latency_seconds
            .with_label_values(&[label])
            .observe(started.elapsed().as_secs_f64());
        self.poller
            .metrics
            .poll_cycles_total
            .with_label_values(&[label])
            .inc();

        self.commit(outcome);
        self.schedule()
    }

    fn commit(&mut self, outcome: CycleOutcome) {
        let order_id = self.poller.order_id;
        let previous = self.state_tx.borrow().status();
        let mut errors = Vec::new();

        let order = match outcome.order {
            Ok(order) => Some(order),
            Err(err) => {
                warn!(order_id = %order_id, error = %err, "order refresh failed; keeping last known state");
                errors.push(err.to_string());
                None
            }
        };

        if let (Some(previous), Some(order)) = (previous, &order) {
            if previous != order.status {
                let event = StatusChanged {
                    order_id,
                    previous,
                    next: order.status,
                    observed_at: self.poller.clock.now(),
                };
                info!(order_id = %order_id, from = %previous, to = %order.status, "order status changed");
                self.poller.metrics.status_changes_total.inc();
                let _ = self.poller.events_tx.send(event);
            }
        }

        let snapshot = match outcome.snapshot {
            Some(Ok(snapshot)) => Some(snapshot),
            Some(Err(err)) => {
                warn!(order_id = %order_id, error = %err, "tracking refresh failed");
                errors.push(err.to_string());
                None
            }
            None => None,
        };

        let driver_location = match outcome.driver_location {
            Some(Ok(location)) => Some(location),
            Some(Err(err)) => {
                warn!(order_id = %order_id, error = %err, "driver location refresh failed");
                errors.push(err.to_string());
                None
            }
            None => None,
        };

        let now = self.poller.clock.now();
        self.state_tx.send_modify(|state| {
            if let Some(order) = order {
                state.order = Some(order);
                state.last_refreshed_at = Some(now);
            }
            if let Some(snapshot) = snapshot {
                state.snapshot = Some(snapshot);
            }
            if let Some(location) = driver_location {
                state.driver_location = Some(location);
            }
            state.last_error = if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            };
        });
    }

    fn is_terminal(&self) -> bool {
        self.state_tx
            .borrow()
            .status()
            .is_some_and(OrderStatus::is_terminal)
    }

    fn is_active(&self) -> bool {
        self.state_tx
            .borrow()
            .status()
            .is_some_and(OrderStatus::is_active)
    }

    /// Arms the timer for the next cycle or parks the loop. Returns false once
    /// the order is terminal and the loop has nothing left to do.
    fn schedule(&mut self) -> bool {
        if self.is_terminal() {
            self.cancel_timer(StopReason::Terminal);
            return false;
        }

        if !self.is_active() {
            self.cancel_timer(StopReason::Inactive);
        } else if !self.auto_refresh {
            self.cancel_timer(StopReason::AutoRefreshOff);
        } else {
            self.timer.arm(self.poller.interval);
            self.publish_state(PollerState::ActivePolling);
        }
        true
    }

    fn set_auto_refresh(&mut self, enabled: bool) {
        if self.auto_refresh == enabled {
            return;
        }
        self.auto_refresh = enabled;
        info!(order_id = %self.poller.order_id, enabled, "auto refresh toggled");

        if enabled {
            if !self.timer.is_armed() {
                let _ = self.schedule();
            }
        } else {
            self.cancel_timer(StopReason::AutoRefreshOff);
        }
    }

    /// Every way of stopping the timer goes through here.
    fn cancel_timer(&mut self, reason: StopReason) {
        let was_armed = self.timer.is_armed();
        self.timer.disarm();
        debug!(order_id = %self.poller.order_id, ?reason, was_armed, "poll timer cancelled");

        match reason {
            StopReason::Stopped => {
                info!(order_id = %self.poller.order_id, "order tracking stopped");
            }
            StopReason::Terminal => {
                info!(order_id = %self.poller.order_id, "order reached a terminal status; polling finished");
                self.publish_state(PollerState::Terminal);
            }
            StopReason::AutoRefreshOff | StopReason::Inactive => {
                self.publish_state(PollerState::Paused);
            }
        }
    }

    fn publish_state(&self, poller: PollerState) {
        self.state_tx.send_if_modified(|state| {
            if state.poller == poller {
                return false;
            }
            state.poller = poller;
            true
        });
    }
}

/// Owner-side handle of a running poll loop. Dropping it stops the loop.
pub struct PollerHandle {
    order_id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    state_rx: watch::Receiver<TrackingState>,
    events_tx: broadcast::Sender<StatusChanged>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn order_id(&self) -> Uuid {
        self.order_id
    }

    pub fn state(&self) -> TrackingState {
        self.state_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<TrackingState> {
        self.state_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChanged> {
        self.events_tx.subscribe()
    }

    pub fn set_auto_refresh(&self, enabled: bool) {
        let _ = self.commands.send(Command::SetAutoRefresh(enabled));
    }

    /// Queues an immediate cycle. It runs after any cycle already in flight.
    pub fn refresh_now(&self) {
        let _ = self.commands.send(Command::RefreshNow);
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
