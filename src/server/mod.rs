pub mod api;
pub mod dtos;
pub mod error;
pub mod extractors;
pub mod services;
pub mod utils;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::AppConfig;
use api::{ProxyController, health_endpoint};
use services::ProxyServices;

static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

pub fn get_uptime_seconds() -> u64 {
    START_TIME.elapsed().as_secs()
}

pub fn get_app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub struct ProxyApplicationServer;

impl ProxyApplicationServer {
    pub async fn serve(config: Arc<AppConfig>) -> anyhow::Result<()> {
        Lazy::force(&START_TIME);

        let metrics = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install prometheus recorder")?;

        let services = ProxyServices::new(config.clone());
        let router = Self::router(services, Some(metrics));

        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener = TcpListener::bind(addr)
            .await
            .context("failed to bind listener")?;

        info!(
            "proxy listening on {} (mounted at {})",
            addr, config.proxy_path
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(Self::shutdown_signal())
            .await
            .context("server error")?;

        info!("server shut down");

        Ok(())
    }

    /// the full app without binding anything, `serve` uses it and so do the tests. the metrics
    /// route only exists when a recorder handle is passed in
    pub fn router(services: ProxyServices, metrics: Option<PrometheusHandle>) -> Router {
        let mut router = Router::new()
            .route("/health", get(health_endpoint))
            .merge(ProxyController::app(&services.config.proxy_path));

        if let Some(handle) = metrics {
            router = router.route(
                "/metrics",
                get(move || std::future::ready(handle.render())),
            );
        }

        router
            .layer(Extension(services))
            .layer(TraceLayer::new_for_http())
    }

    async fn shutdown_signal() {
        // if ctrl_c can't be installed there's nothing to wait on, just run until killed
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
    }
}
