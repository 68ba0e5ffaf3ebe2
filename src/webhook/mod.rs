//! Mutating admission webhook
//!
//! The API server posts an `AdmissionReview` for every pod CREATE, UPDATE and
//! DELETE. Create requests are run through the plugin registry; every response
//! allows the pod, with a JSON Patch attached when a plugin produced one.
//!
//! - [`pod`] - the admission handler
//! - [`registration`] - the MutatingWebhookConfiguration pointing at us

pub mod pod;
pub mod registration;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

use crate::pki::{PkiError, TlsMaterial};
use crate::plugin::PluginRegistry;
use crate::{Error, Result, MUTATE_PATH};

/// Liveness endpoint
pub const HEALTHZ_PATH: &str = "/healthz";

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    /// Plugins consulted for every admitted pod
    pub registry: PluginRegistry,
}

impl WebhookState {
    /// Create a new webhook state around a populated registry
    pub fn new(registry: PluginRegistry) -> Self {
        Self { registry }
    }
}

/// Create the webhook router
///
/// - POST /mutate - pod admission reviews
/// - GET /healthz - liveness
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(MUTATE_PATH, post(pod::mutate_handler))
        .route(HEALTHZ_PATH, get(|| async { "ok" }))
        .with_state(state)
}

/// Serve the router over HTTPS until the server fails
pub async fn serve(addr: SocketAddr, tls: &TlsMaterial, router: Router) -> Result<()> {
    let tls_config = RustlsConfig::from_pem(
        tls.cert_pem.clone().into_bytes(),
        tls.key_pem.clone().into_bytes(),
    )
    .await
    .map_err(|e| PkiError::ParseError(format!("unusable serving certificate: {}", e)))?;

    info!(addr = %addr, path = MUTATE_PATH, "Starting webhook server");

    axum_server::bind_rustls(addr, tls_config)
        .serve(router.into_make_service())
        .await
        .map_err(|e| Error::server(format!("webhook server error: {}", e)))
}
