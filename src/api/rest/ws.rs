use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::stream::BoxStream;
use futures::SinkExt;
use futures::StreamExt;
use serde::Serialize;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::notifications::Toast;
use crate::engine::poller::StatusChanged;
use crate::engine::view_model::TrackingViewModel;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Push {
    StatusChanged(StatusChanged),
    Toast(Toast),
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let session = state.require_session(order_id)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, session)))
}

/// Status changes and toasts for one session. Ends when the session closes.
fn pushes(session: &TrackingViewModel) -> BoxStream<'static, Push> {
    let statuses = BroadcastStream::new(session.subscribe_status())
        .filter_map(|item| async move { item.ok().map(Push::StatusChanged) });
    let toasts = BroadcastStream::new(session.subscribe_toasts())
        .filter_map(|item| async move { item.ok().map(Push::Toast) });
    futures::stream::select(statuses, toasts)
        .take_until(session.closed().cancelled_owned())
        .boxed()
}

async fn handle_socket(socket: WebSocket, session: Arc<TrackingViewModel>) {
    let (mut sender, mut receiver) = socket.split();
    let order_id = session.order_id();

    let mut pushes = pushes(&session);
    drop(session);

    info!(order_id = %order_id, "websocket client connected");

    let send_task = tokio::spawn(async move {
        while let Some(push) = pushes.next().await {
            let json = match serde_json::to_string(&push) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize push for ws");
                    continue;
                }
            };

            if sender.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!(order_id = %order_id, "websocket client disconnected");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::view_model::{SessionOptions, TrackingDeps};
    use crate::models::tracking::GeoPoint;
    use crate::observability::metrics::Metrics;
    use crate::services::headless::{
        FixedGeolocation, HeadlessNotifier, LoggingAnalytics, LoggingShare,
    };
    use crate::services::memory::{demo_order, InMemoryBackend};
    use crate::services::SystemClock;

    async fn open_session() -> TrackingViewModel {
        let backend = Arc::new(InMemoryBackend::new());
        let order = demo_order();
        let order_id = order.id;
        backend.insert_order(order);
        let deps = TrackingDeps {
            orders: backend.clone(),
            tracking: backend.clone(),
            analytics: Arc::new(LoggingAnalytics::new()),
            cart: backend,
            geolocation: Arc::new(FixedGeolocation::at(GeoPoint::new(0.0, 0.0))),
            notifier: Arc::new(HeadlessNotifier::granted()),
            share: Arc::new(LoggingShare::new()),
            clock: Arc::new(SystemClock),
        };
        TrackingViewModel::open(order_id, deps, SessionOptions::default(), Metrics::new())
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn push_stream_carries_toasts() {
        let session = open_session().await;
        let mut stream = pushes(&session);

        session.set_notifications(false);
        let push = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(matches!(push, Some(Push::Toast(toast)) if toast.message == "Notifications turned off"));
    }

    #[tokio::test(start_paused = true)]
    async fn push_stream_ends_when_session_closes() {
        let session = Arc::new(open_session().await);
        let mut stream = pushes(&session);

        session.close();
        let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(next.is_none());
    }
}
