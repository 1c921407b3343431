//! OpenAPI/Utoipa configuration.

use crate::api::{emergencies::EMERGENCIES_TAG, health::MISC_TAG};
use utoipa::{
    Modify, OpenApi,
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
};

/// Documents the identity headers forwarded by the auth gateway.
pub struct GatewayHeaders;

impl Modify for GatewayHeaders {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "UserId",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    "X-User-Id",
                    "Id of the authenticated user, set by the auth gateway.",
                ))),
            );
            components.add_security_scheme(
                "UserRole",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    "X-User-Role",
                    "One of super_admin, school_admin, staff or guardian.",
                ))),
            );
        }
    }
}

/// OpenAPI documentation configuration.
#[derive(OpenApi)]
#[openapi(
    modifiers(&GatewayHeaders),
    info(
        title = "Emergency Broadcast API",
        version = "1.0.0",
        description = "Declare emergencies, track guardian deliveries and acknowledgments, and follow escalation."
    ),
    tags(
        (name = MISC_TAG, description = "Miscellaneous endpoints"),
        (name = EMERGENCIES_TAG, description = "Emergency broadcast endpoints")
    )
)]
pub struct ApiDoc;
