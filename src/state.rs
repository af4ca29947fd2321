use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::engine::view_model::{SessionOptions, TrackingDeps, TrackingViewModel};
use crate::error::AppError;
use crate::observability::metrics::Metrics;

/// Slot for one order's session. Concurrent opens of the same order share the
/// slot, so only one of them runs `TrackingViewModel::open`.
type SessionSlot = Arc<OnceCell<Arc<TrackingViewModel>>>;

pub struct AppState {
    sessions: DashMap<Uuid, SessionSlot>,
    pub deps: TrackingDeps,
    pub options: SessionOptions,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(deps: TrackingDeps, options: SessionOptions) -> Self {
        Self {
            sessions: DashMap::new(),
            deps,
            options,
            metrics: Metrics::new(),
        }
    }

    /// Returns the open session for `order_id`, opening one if needed.
    pub async fn open_session(&self, order_id: Uuid) -> Result<Arc<TrackingViewModel>, AppError> {
        let slot = self
            .sessions
            .entry(order_id)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .value()
            .clone();

        let opened = slot
            .get_or_try_init(|| async {
                let session = TrackingViewModel::open(
                    order_id,
                    self.deps.clone(),
                    self.options.clone(),
                    self.metrics.clone(),
                )
                .await?;
                self.metrics.active_sessions.inc();
                Ok::<_, AppError>(Arc::new(session))
            })
            .await;

        match opened {
            Ok(session) => Ok(session.clone()),
            Err(err) => {
                self.sessions
                    .remove_if(&order_id, |_, current| {
                        Arc::ptr_eq(current, &slot) && !current.initialized()
                    });
                Err(err)
            }
        }
    }

    pub fn session(&self, order_id: Uuid) -> Option<Arc<TrackingViewModel>> {
        self.sessions
            .get(&order_id)
            .and_then(|entry| entry.value().get().cloned())
    }

    pub fn require_session(&self, order_id: Uuid) -> Result<Arc<TrackingViewModel>, AppError> {
        self.session(order_id)
            .ok_or_else(|| AppError::NotFound(format!("no tracking session for order {order_id}")))
    }

    /// Number of open sessions. Sessions still being opened are not counted.
    pub fn session_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    pub fn close_session(&self, order_id: Uuid) -> Result<(), AppError> {
        let (_, slot) = self
            .sessions
            .remove_if(&order_id, |_, slot| slot.initialized())
            .ok_or_else(|| AppError::NotFound(format!("no tracking session for order {order_id}")))?;
        if let Some(session) = slot.get() {
            session.close();
            self.metrics.active_sessions.dec();
        }
        Ok(())
    }

    pub fn close_all(&self) {
        for entry in self.sessions.iter() {
            if let Some(session) = entry.value().get() {
                session.close();
            }
        }
    }
}
