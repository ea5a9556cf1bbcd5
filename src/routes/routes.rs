//! Defines routes for deployment and release operations.
//!
//! ## Structure
//! - **Deployment endpoints**
//!   - `POST /deployments`: create deployment
//!   - `GET  /deployments/{deployment_id}/orphans`: packages left by failed pointer updates
//!
//! - **Release endpoints**
//!   - `POST /deployments/{deployment_id}/releases`: multipart upload + release
//!   - `GET  /deployments/{deployment_id}/versions/{app_version}/packages`: history
//!   - `GET  /deployments/{deployment_id}/packages/{label}`: one package by label

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        release_handlers::{
            create_deployment, get_package, list_orphans, list_packages, upload_release,
        },
    },
    services::release_service::ReleaseService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router. `max_upload_bytes` caps the release upload body.
pub fn routes(max_upload_bytes: usize) -> Router<ReleaseService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/deployments", post(create_deployment))
        .route(
            "/deployments/{deployment_id}/releases",
            post(upload_release).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route(
            "/deployments/{deployment_id}/versions/{app_version}/packages",
            get(list_packages),
        )
        .route(
            "/deployments/{deployment_id}/packages/{label}",
            get(get_package),
        )
        .route("/deployments/{deployment_id}/orphans", get(list_orphans))
}
