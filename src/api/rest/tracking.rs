use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::view_model::{ActionResult, QuickActionId, Tab, TrackingView};
use crate::error::AppError;
use crate::models::order::OrderEvent;
use crate::models::tracking::GeoPoint;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/tracking/:order_id",
            post(open_tracking).get(get_tracking).delete(close_tracking),
        )
        .route("/tracking/:order_id/refresh", post(refresh))
        .route("/tracking/:order_id/auto-refresh", put(set_auto_refresh))
        .route("/tracking/:order_id/notifications", put(set_notifications))
        .route("/tracking/:order_id/tab", put(set_tab))
        .route("/tracking/:order_id/location", post(request_location))
        .route("/tracking/:order_id/actions/:action", post(perform_action))
        .route("/tracking/:order_id/rating", post(rate_order))
        .route("/tracking/:order_id/rating/dismiss", post(dismiss_rating))
        .route("/tracking/:order_id/events", get(order_events))
}

#[derive(Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

#[derive(Deserialize)]
pub struct TabRequest {
    pub tab: Tab,
}

#[derive(Deserialize)]
pub struct RatingRequest {
    pub rating: u8,
    #[serde(default)]
    pub review: String,
}

#[derive(Serialize)]
pub struct Accepted {
    pub ok: bool,
}

async fn open_tracking(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<TrackingView>, AppError> {
    let session = state.open_session(order_id).await?;
    Ok(Json(session.view()))
}

async fn get_tracking(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<TrackingView>, AppError> {
    Ok(Json(state.require_session(order_id)?.view()))
}

async fn close_tracking(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.close_session(order_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn refresh(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Result<(StatusCode, Json<Accepted>), AppError> {
    state.require_session(order_id)?.refresh_now();
    Ok((StatusCode::ACCEPTED, Json(Accepted { ok: true })))
}

async fn set_auto_refresh(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<ToggleRequest>,
) -> Result<Json<TrackingView>, AppError> {
    let session = state.require_session(order_id)?;
    session.set_auto_refresh(payload.enabled);
    Ok(Json(session.view()))
}

async fn set_notifications(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<ToggleRequest>,
) -> Result<Json<TrackingView>, AppError> {
    let session = state.require_session(order_id)?;
    session.set_notifications(payload.enabled);
    Ok(Json(session.view()))
}

async fn set_tab(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<TabRequest>,
) -> Result<Json<TrackingView>, AppError> {
    let session = state.require_session(order_id)?;
    session.set_active_tab(payload.tab);
    Ok(Json(session.view()))
}

async fn request_location(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<GeoPoint>, AppError> {
    let session = state.require_session(order_id)?;
    Ok(Json(session.request_user_location().await?))
}

async fn perform_action(
    State(state): State<Arc<AppState>>,
    Path((order_id, action)): Path<(Uuid, String)>,
) -> Result<Json<ActionResult>, AppError> {
    let action: QuickActionId = action.parse()?;
    let session = state.require_session(order_id)?;
    Ok(Json(session.perform(action).await?))
}

async fn rate_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<RatingRequest>,
) -> Result<Json<Accepted>, AppError> {
    let session = state.require_session(order_id)?;
    session.rate(payload.rating, &payload.review).await?;
    Ok(Json(Accepted { ok: true }))
}

async fn dismiss_rating(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<TrackingView>, AppError> {
    let session = state.require_session(order_id)?;
    session.dismiss_rating_prompt();
    Ok(Json(session.view()))
}

async fn order_events(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Vec<OrderEvent>>, AppError> {
    let session = state.require_session(order_id)?;
    Ok(Json(session.load_events().await?))
}
