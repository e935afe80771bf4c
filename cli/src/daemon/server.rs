// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! quotad HTTP server
//!
//! Wires the limit store, resolver, reservation engine and quota service
//! from configuration, starts the expiry sweeper and the event auditor,
//! and serves the `quota-sets` router until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use quotad_core::application::{
    EventAuditor, ExpirySweeper, HierarchyResolver, QuotaService, ReservationEngine, StandardQuotaService,
};
use quotad_core::domain::quota::ProjectId;
use quotad_core::domain::quota_config::QuotaConfigManifest;
use quotad_core::infrastructure::event_bus::EventBus;
use quotad_core::infrastructure::repositories::create_limit_store;
use quotad_core::presentation::app;

pub async fn start_server(
    config: QuotaConfigManifest,
    host_override: Option<String>,
    port_override: Option<u16>,
) -> Result<()> {
    config
        .validate()
        .context("Configuration validation failed")?;

    info!("Configuration loaded: node={}", config.metadata.name);
    let spec = &config.spec;

    if let Some(metrics) = spec.observability.as_ref().and_then(|o| o.metrics.as_ref()) {
        if metrics.enabled {
            init_metrics_exporter(SocketAddr::from(([0, 0, 0, 0], metrics.port)))?;
        }
    }

    // Initialize services
    let backend = spec.storage.to_backend()?;
    let store = create_limit_store(backend)
        .await
        .context("Failed to initialize limit store")?;
    let event_bus = Arc::new(EventBus::with_default_capacity());
    let auditor = Arc::new(EventAuditor::new(event_bus.clone()));
    let auditor_shutdown = auditor.shutdown_token();
    let auditor_handle = auditor.start();
    let resolver = Arc::new(HierarchyResolver::new(store.clone(), spec.defaults.clone()));
    let engine = Arc::new(ReservationEngine::new(
        store.clone(),
        resolver.clone(),
        event_bus.clone(),
        &spec.reservations,
    ));
    let service = Arc::new(StandardQuotaService::new(
        store,
        resolver,
        engine.clone(),
        event_bus,
    ));

    for project in &spec.projects {
        let project_id = ProjectId::new(project.as_str())
            .with_context(|| format!("Invalid project id '{}'", project))?;
        service
            .register_project(&project_id)
            .await
            .with_context(|| format!("Failed to register project {}", project_id))?;
    }
    info!("{} projects registered from configuration", spec.projects.len());

    let sweeper = Arc::new(ExpirySweeper::new(engine, &spec.reservations));
    let sweeper_shutdown = sweeper.shutdown_token();
    let sweeper_handle = sweeper.start();

    let router = app(service);

    // Start HTTP server
    let host = host_override.unwrap_or_else(|| spec.network.bind_address.clone());
    let port = port_override.unwrap_or(spec.network.port);
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("quotad listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("quotad shutting down");
    sweeper_shutdown.cancel();
    if let Err(e) = sweeper_handle.await {
        warn!("Expiry sweeper task ended abnormally: {}", e);
    }
    auditor_shutdown.cancel();
    if let Err(e) = auditor_handle.await {
        warn!("Event auditor task ended abnormally: {}", e);
    }

    Ok(())
}

fn init_metrics_exporter(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!("Prometheus metrics exporter listening on {}", addr);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
