//! HTTP API.
//!
//! - `emergencies` - Emergency endpoints (/api/emergencies/*)
//! - `health` - Health check endpoint (/healthz)
//! - `openapi` - OpenAPI/Utoipa configuration

pub mod auth;
pub mod emergencies;
pub mod health;
pub mod openapi;

pub use emergencies::EMERGENCIES_TAG;
pub use health::MISC_TAG;

use crate::AppResources;
use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_axum::{router::OpenApiRouter, routes};
use utoipa_redoc::{Redoc, Servable};

/// Build the application router with documentation and middleware.
pub fn build_router(app_resources: AppResources) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(openapi::ApiDoc::openapi())
        .nest("/api/emergencies", emergencies::router())
        .routes(routes!(health::health))
        .layer(axum::Extension(app_resources))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .split_for_parts();

    router.merge(Redoc::with_url("/api-docs", api))
}

/// Starts the web server with all configured routes.
#[tracing::instrument(skip(app_resources))]
pub async fn start_webserver(app_resources: AppResources) -> color_eyre::Result<()> {
    let addr = app_resources.config.listen_addr;
    let router = build_router(app_resources);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        name = "api.listening",
        target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
        message = "Server running",
        addr = %addr,
    );
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .map_err(|e| color_eyre::Report::msg(format!("Failed to start server: {e}")))?;

    Ok(())
}
