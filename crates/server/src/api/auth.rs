//! Caller identity and error responses for the emergency API.
//!
//! Authentication happens upstream; the gateway forwards the caller as
//! `X-User-Id` and `X-User-Role` headers.

use crate::auth::Role;
use crate::emergency::Actor;
use crate::error::{EmergencyError, PersistenceError};
use axum::{
    Json,
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Error body returned by every emergency endpoint.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// Error code (e.g., "not_found", "forbidden")
    pub error: String,
    /// Human-readable error description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl ApiError {
    fn new(error: &str, description: impl Into<String>) -> Self {
        Self {
            error: error.to_string(),
            error_description: Some(description.into()),
        }
    }

    pub fn unauthenticated(description: impl Into<String>) -> Self {
        Self::new("unauthenticated", description)
    }

    pub fn forbidden(description: impl Into<String>) -> Self {
        Self::new("forbidden", description)
    }

    pub fn not_found(description: impl Into<String>) -> Self {
        Self::new("not_found", description)
    }

    pub fn bad_request(description: impl Into<String>) -> Self {
        Self::new("bad_request", description)
    }

    pub fn conflict(description: impl Into<String>) -> Self {
        Self::new("conflict", description)
    }

    pub fn server_error() -> Self {
        Self {
            error: "server_error".to_string(),
            error_description: None,
        }
    }

    fn status(&self) -> StatusCode {
        match self.error.as_str() {
            "unauthenticated" => StatusCode::UNAUTHORIZED,
            "forbidden" => StatusCode::FORBIDDEN,
            "not_found" => StatusCode::NOT_FOUND,
            "bad_request" => StatusCode::BAD_REQUEST,
            "unknown_recipient" => StatusCode::UNPROCESSABLE_ENTITY,
            "conflict" => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl From<EmergencyError> for ApiError {
    fn from(e: EmergencyError) -> Self {
        match &e {
            EmergencyError::Validation(_) => Self::bad_request(e.to_string()),
            EmergencyError::Unauthorized(_) => Self::forbidden(e.to_string()),
            EmergencyError::NotFound(_) => Self::not_found(e.to_string()),
            EmergencyError::Closed { .. } => Self::conflict(e.to_string()),
            EmergencyError::UnknownRecipient { .. } => Self::new("unknown_recipient", e.to_string()),
            EmergencyError::Persistence(PersistenceError::Conflict { .. }) => {
                Self::conflict(e.to_string())
            }
            EmergencyError::Render(_) | EmergencyError::Persistence(_) => {
                tracing::error!(
                    name = "api.error.internal",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    message = "Request failed",
                    error = %e,
                );
                Self::server_error()
            }
        }
    }
}

/// Axum extractor for the caller forwarded by the auth gateway.
///
/// # Example
///
/// ```ignore
/// async fn handler(GatewayIdentity(actor): GatewayIdentity) -> impl IntoResponse {
///     format!("Hello, {}", actor.user_id)
/// }
/// ```
pub struct GatewayIdentity(pub Actor);

impl<S> FromRequestParts<S> for GatewayIdentity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let user_id = header(USER_ID_HEADER)
            .ok_or_else(|| ApiError::unauthenticated("Missing X-User-Id header"))?;
        let role = header(USER_ROLE_HEADER)
            .ok_or_else(|| ApiError::unauthenticated("Missing X-User-Role header"))?
            .parse::<Role>()
            .map_err(ApiError::unauthenticated)?;

        Ok(GatewayIdentity(Actor {
            user_id: user_id.to_string(),
            role,
        }))
    }
}
