//! Emergency management API endpoints.
//!
//! - `POST /` - Initiate an emergency broadcast
//! - `GET /{id}` - Current emergency context
//! - `GET /{id}/stats` - Delivery statistics
//! - `GET /{id}/deliveries` - Per-recipient delivery records
//! - `POST /{id}/acknowledgments` - Record a guardian acknowledgment
//! - `POST /{id}/resolve` - Resolve an emergency
//! - `POST /{id}/cancel` - Cancel an emergency

use crate::AppResources;
use crate::api::auth::{ApiError, GatewayIdentity};
use crate::emergency::state_machine::Transition;
use crate::emergency::tracker::DeliveryStats;
use crate::emergency::types::{EmergencyContext, EmergencyState, RecipientDelivery};
use crate::emergency::{AckOutcome, AcknowledgmentRequest, InitiateEmergency};
use crate::error::EmergencyError;
use axum::{Extension, Json, extract::Path, http::StatusCode};
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

/// Tag for OpenAPI documentation.
pub const EMERGENCIES_TAG: &str = "Emergencies API";

/// State change performed by resolve or cancel.
#[derive(Debug, Serialize, ToSchema)]
pub struct TransitionResponse {
    pub from: EmergencyState,
    pub to: EmergencyState,
}

pub fn router() -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(initiate_emergency))
        .routes(routes!(get_emergency))
        .routes(routes!(get_delivery_stats))
        .routes(routes!(get_deliveries))
        .routes(routes!(record_acknowledgment))
        .routes(routes!(resolve_emergency))
        .routes(routes!(cancel_emergency))
}

fn transition_response(id: &str, transition: Transition) -> Result<Json<TransitionResponse>, ApiError> {
    match transition {
        Transition::Applied { from, to, .. } => Ok(Json(TransitionResponse { from, to })),
        Transition::Rejected { state, .. } => Err(EmergencyError::Closed {
            id: id.to_string(),
            state,
        }
        .into()),
    }
}

#[tracing::instrument(skip(resources, payload), fields(user_id = %actor.user_id))]
#[utoipa::path(
    post,
    path = "/",
    operation_id = "Initiate Emergency",
    tag = EMERGENCIES_TAG,
    summary = "Declare an emergency and start broadcasting",
    description = "Creates an emergency, resolves its delivery configuration from the severity and \
                   queues the first message for every recipient on their preferred allowed channel.\n\n\
                   Requires the `super_admin` or `school_admin` role.",
    request_body(content = InitiateEmergency, description = "Emergency details and recipients"),
    responses(
        (status = 201, description = "Emergency created and broadcasting", body = EmergencyContext),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 401, description = "Missing identity headers", body = ApiError),
        (status = 403, description = "Role may not initiate emergencies", body = ApiError),
    )
)]
async fn initiate_emergency(
    Extension(resources): Extension<AppResources>,
    GatewayIdentity(actor): GatewayIdentity,
    Json(payload): Json<InitiateEmergency>,
) -> Result<(StatusCode, Json<EmergencyContext>), ApiError> {
    let ctx = resources
        .controller
        .initiate_emergency(&actor, payload)
        .await?;
    Ok((StatusCode::CREATED, Json(ctx)))
}

#[tracing::instrument(skip(resources, _identity))]
#[utoipa::path(
    get,
    path = "/{id}",
    operation_id = "Get Emergency",
    tag = EMERGENCIES_TAG,
    summary = "Current state of an emergency",
    params(("id" = String, Path, description = "Emergency id")),
    responses(
        (status = 200, description = "Emergency context", body = EmergencyContext),
        (status = 404, description = "Unknown emergency", body = ApiError),
    )
)]
async fn get_emergency(
    Extension(resources): Extension<AppResources>,
    _identity: GatewayIdentity,
    Path(id): Path<String>,
) -> Result<Json<EmergencyContext>, ApiError> {
    Ok(Json(resources.controller.get_emergency_state(&id).await?))
}

#[tracing::instrument(skip(resources, _identity))]
#[utoipa::path(
    get,
    path = "/{id}/stats",
    operation_id = "Get Delivery Stats",
    tag = EMERGENCIES_TAG,
    summary = "Delivery statistics of an emergency",
    description = "Counts deliveries per state. `ack_rate` is the rounded percentage of \
                   acknowledged deliveries.",
    params(("id" = String, Path, description = "Emergency id")),
    responses(
        (status = 200, description = "Delivery statistics", body = DeliveryStats),
        (status = 404, description = "Unknown emergency", body = ApiError),
    )
)]
async fn get_delivery_stats(
    Extension(resources): Extension<AppResources>,
    _identity: GatewayIdentity,
    Path(id): Path<String>,
) -> Result<Json<DeliveryStats>, ApiError> {
    Ok(Json(resources.controller.get_delivery_stats(&id).await?))
}

#[tracing::instrument(skip(resources, _identity))]
#[utoipa::path(
    get,
    path = "/{id}/deliveries",
    operation_id = "List Deliveries",
    tag = EMERGENCIES_TAG,
    summary = "Per-recipient delivery records",
    params(("id" = String, Path, description = "Emergency id")),
    responses(
        (status = 200, description = "Deliveries ordered by recipient and channel", body = [RecipientDelivery]),
        (status = 404, description = "Unknown emergency", body = ApiError),
    )
)]
async fn get_deliveries(
    Extension(resources): Extension<AppResources>,
    _identity: GatewayIdentity,
    Path(id): Path<String>,
) -> Result<Json<Vec<RecipientDelivery>>, ApiError> {
    resources.controller.get_emergency_state(&id).await?;
    Ok(Json(resources.controller.get_deliveries(&id).await?))
}

#[tracing::instrument(skip(resources, payload), fields(recipient_id = %payload.recipient_id))]
#[utoipa::path(
    post,
    path = "/{id}/acknowledgments",
    operation_id = "Record Acknowledgment",
    tag = EMERGENCIES_TAG,
    summary = "Record a guardian acknowledgment",
    description = "Called by the reply, button and link handlers of each channel. Acknowledging twice \
                   is not an error: the second call reports `duplicate` and changes nothing.",
    params(("id" = String, Path, description = "Emergency id")),
    request_body(content = AcknowledgmentRequest, description = "Who acknowledged and how"),
    responses(
        (status = 200, description = "Acknowledgment outcome", body = AckOutcome),
        (status = 404, description = "Unknown emergency", body = ApiError),
        (status = 422, description = "Recipient is not part of the emergency", body = ApiError),
    )
)]
async fn record_acknowledgment(
    Extension(resources): Extension<AppResources>,
    Path(id): Path<String>,
    Json(payload): Json<AcknowledgmentRequest>,
) -> Result<Json<AckOutcome>, ApiError> {
    Ok(Json(
        resources
            .controller
            .record_acknowledgment(&id, payload)
            .await?,
    ))
}

#[tracing::instrument(skip(resources), fields(user_id = %actor.user_id))]
#[utoipa::path(
    post,
    path = "/{id}/resolve",
    operation_id = "Resolve Emergency",
    tag = EMERGENCIES_TAG,
    summary = "Resolve an emergency",
    description = "Allowed for administrators and the user who initiated the emergency. Only an \
                   emergency awaiting acknowledgments or escalating can be resolved.",
    params(("id" = String, Path, description = "Emergency id")),
    responses(
        (status = 200, description = "Emergency resolved", body = TransitionResponse),
        (status = 403, description = "Not allowed to resolve", body = ApiError),
        (status = 404, description = "Unknown emergency", body = ApiError),
        (status = 409, description = "Emergency cannot be resolved in its current state", body = ApiError),
    )
)]
async fn resolve_emergency(
    Extension(resources): Extension<AppResources>,
    GatewayIdentity(actor): GatewayIdentity,
    Path(id): Path<String>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let transition = resources.controller.resolve_emergency(&actor, &id).await?;
    transition_response(&id, transition)
}

#[tracing::instrument(skip(resources), fields(user_id = %actor.user_id))]
#[utoipa::path(
    post,
    path = "/{id}/cancel",
    operation_id = "Cancel Emergency",
    tag = EMERGENCIES_TAG,
    summary = "Cancel an emergency",
    description = "Stops all queued sends, escalation and resends for the emergency.\n\n\
                   Requires the `super_admin` or `school_admin` role.",
    params(("id" = String, Path, description = "Emergency id")),
    responses(
        (status = 200, description = "Emergency cancelled", body = TransitionResponse),
        (status = 403, description = "Not allowed to cancel", body = ApiError),
        (status = 404, description = "Unknown emergency", body = ApiError),
        (status = 409, description = "Emergency already resolved or cancelled", body = ApiError),
    )
)]
async fn cancel_emergency(
    Extension(resources): Extension<AppResources>,
    GatewayIdentity(actor): GatewayIdentity,
    Path(id): Path<String>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let transition = resources.controller.cancel_emergency(&actor, &id).await?;
    transition_response(&id, transition)
}
