//! faketime-injector - mutating admission webhook for fake pod clocks

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use faketime_injector::config::Options;
use faketime_injector::pki::TlsMaterial;
use faketime_injector::plugin::builtin_registry;
use faketime_injector::webhook::registration::ensure_webhook_configuration;
use faketime_injector::webhook::{self, webhook_router, WebhookState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The serving certificate and the kube client both need a process-wide
    // crypto provider; nothing works without one.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The webhook cannot serve TLS without it.",
            e
        );
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = Options::parse();
    run(options)
        .await
        .map_err(|e| anyhow::anyhow!("faketime-injector failed: {}", e))
}

async fn run(options: Options) -> faketime_injector::Result<()> {
    options.faketime.validate()?;

    tracing::info!(
        port = options.webhook.port,
        service = %options.webhook.service_dns_name(),
        cluster_mode = options.faketime.cluster_mode,
        namespace_delay_timeout_secs = options.faketime.namespace_delay_timeout_secs,
        "Starting faketime-injector"
    );

    // 1. Serving certificates
    let tls = TlsMaterial::ensure(
        &options.webhook.cert_dir,
        &options.webhook.service_dns_name(),
        &options.webhook.certificate_sans(),
    )?;

    // 2. Point the API server at us
    let client = Client::try_default().await?;
    ensure_webhook_configuration(&client, &options.webhook, &tls.ca_cert_pem).await?;

    // 3. Plugins
    let registry = builtin_registry(options.faketime.clone())?;
    tracing::info!(plugins = ?registry.names(), "Registered plugins");

    // 4. Serve until the listener fails
    let state = Arc::new(WebhookState::new(registry));
    let addr = SocketAddr::from(([0, 0, 0, 0], options.webhook.port));
    webhook::serve(addr, &tls, webhook_router(state)).await
}
