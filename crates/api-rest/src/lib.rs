//! # API REST
//!
//! HTTP ingress for the HL7 relay.
//!
//! Handles:
//! - HTTP endpoints with axum
//! - OpenAPI documentation
//! - REST-specific concerns (JSON serialization, CORS)
//!
//! Forwarding and the document pipeline are injected through [`AppState`], so the router can be
//! driven by real hops or by test doubles.

#![warn(rust_2018_idioms)]

mod handlers;

use axum::{
    routing::{get, post},
    Json, Router,
};
use relay_core::DocumentIntake;
use relay_files::ScratchStore;
use relay_transport::Forwarder;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;

pub use handlers::{DocumentRes, ErrorRes, HealthRes, HttpRelayRes, TcpRelayRes};

/// Application state for the REST API server.
///
/// Contains the hops, the document pipeline and the scratch store shared by all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Mutual-TLS TCP hop used by `POST /hl7/tcp`.
    pub tcp_hop: Arc<dyn Forwarder>,
    /// Third-party HTTP sink used by `POST /hl7/http`.
    pub http_sink: Arc<dyn Forwarder>,
    /// Document pipeline used by `POST /documents`.
    pub intake: Arc<dyn DocumentIntake>,
    /// Where every posted body is recorded before it is handled.
    pub scratch: ScratchStore,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::relay_tcp,
        handlers::relay_http,
        handlers::ingest_document,
    ),
    components(schemas(HealthRes, TcpRelayRes, HttpRelayRes, DocumentRes, ErrorRes))
)]
pub struct ApiDoc;

/// Builds the ingress router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/hl7/tcp", post(handlers::relay_tcp))
        .route("/hl7/http", post(handlers::relay_http))
        .route("/documents", post(handlers::ingest_document))
        .route(
            "/api-docs/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}
