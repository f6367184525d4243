//! Calendar service routes

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult, CalendarError, LedgerError},
    models::{AvailabilityQuery, ConfirmBookingRequest, NewBooking},
    state::AppState,
};

pub const RESOURCE_ID_HEADER: &str = "x-goog-resource-id";
pub const RESOURCE_STATE_HEADER: &str = "x-goog-resource-state";

/// Create the router for the calendar service
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/integrations/google/webhook", post(google_webhook))
        .route("/api/integrations/google/:user_id/watch", post(start_watch))
        .route(
            "/api/integrations/google/:user_id",
            axum::routing::delete(disconnect_integration),
        )
        .route("/api/cron/renew-google-watches", post(renew_watches))
        .route("/api/bookings", post(create_booking))
        .route("/api/bookings/:id/confirm", post(confirm_booking))
        .route("/api/bookings/:id/cancel", post(cancel_booking))
        .route(
            "/api/bookings/payments/:reference/confirm",
            post(confirm_payment),
        )
        .route(
            "/api/rooms/:room_type_id/availability",
            get(check_availability),
        )
        .with_state(state)
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "calendar-service"
    }))
}

/// Keep calendar errors distinguishable from other internal failures
fn calendar_failure(error: anyhow::Error) -> ApiError {
    match error.downcast::<CalendarError>() {
        Ok(calendar) => ApiError::Calendar(calendar),
        Err(other) => ApiError::Internal(other),
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Google push notification
///
/// Always acknowledged once the resource id is known, so Google does not
/// retry deliveries that failed on our side.
pub async fn google_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    if header(&headers, RESOURCE_STATE_HEADER) == Some("sync") {
        info!("Calendar watch handshake received");
        return Ok(Json(json!({ "outcome": "sync" })));
    }

    let resource_id = header(&headers, RESOURCE_ID_HEADER)
        .ok_or_else(|| ApiError::BadRequest(format!("missing {RESOURCE_ID_HEADER} header")))?;

    match state.reconciler.handle_notification(resource_id).await {
        Ok(outcome) => Ok(Json(json!(outcome))),
        Err(e) => {
            error!(resource_id, "Calendar sync failed: {:#}", e);
            Ok(Json(json!({ "outcome": "failed" })))
        }
    }
}

/// Register a push channel for a freshly connected calendar
pub async fn start_watch(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let channel = state
        .watches
        .ensure_watch(user_id)
        .await
        .map_err(calendar_failure)?;
    Ok(Json(channel))
}

pub async fn disconnect_integration(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    if !state
        .watches
        .disconnect(user_id)
        .await
        .map_err(calendar_failure)?
    {
        return Err(CalendarError::NotIntegrated(user_id).into());
    }
    Ok(Json(json!({ "success": true })))
}

/// Renew expiring watch channels, protected by the cron bearer secret
pub async fn renew_watches(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> ApiResult<impl IntoResponse> {
    let authorized = match bearer {
        Some(TypedHeader(Authorization(token))) => {
            !state.cron_secret.is_empty() && token.token() == &*state.cron_secret
        }
        None => false,
    };
    if !authorized {
        return Err(ApiError::Unauthorized);
    }

    let summary = state.watches.renew_expiring().await?;
    Ok(Json(summary))
}

pub async fn create_booking(
    State(state): State<AppState>,
    Json(payload): Json<NewBooking>,
) -> ApiResult<impl IntoResponse> {
    let booking = state.bookings.create_pending(&payload).await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

pub async fn confirm_booking(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Option<Json<ConfirmBookingRequest>>,
) -> ApiResult<impl IntoResponse> {
    let request = payload.map(|Json(body)| body).unwrap_or_default();
    let booking = state
        .bookings
        .confirm(id, request.payment_reference.as_deref())
        .await?;
    Ok(Json(booking))
}

/// Confirm the pending booking a payment belongs to
pub async fn confirm_payment(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let booking = state
        .bookings
        .confirm_payment(&reference)
        .await?
        .ok_or_else(|| {
            ApiError::Ledger(LedgerError::Conflict(format!(
                "no pending booking for payment {reference}"
            )))
        })?;
    Ok(Json(booking))
}

pub async fn cancel_booking(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let booking = state.bookings.cancel(id).await?;
    Ok(Json(booking))
}

pub async fn check_availability(
    State(state): State<AppState>,
    Path(room_type_id): Path<Uuid>,
    Query(query): Query<AvailabilityQuery>,
) -> ApiResult<impl IntoResponse> {
    let available = state
        .ledger
        .check_availability(
            room_type_id,
            query.check_in,
            query.check_out,
            query.exclude_booking_id,
        )
        .await?;

    Ok(Json(json!({
        "roomTypeId": room_type_id,
        "checkIn": query.check_in,
        "checkOut": query.check_out,
        "available": available,
    })))
}
