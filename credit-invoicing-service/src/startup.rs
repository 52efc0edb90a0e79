//! Application startup and lifecycle management.

use crate::config::{InvoicingConfig, StoreBackend};
use crate::handlers::{
    create_run, get_run, health_check, list_invoices, metrics_handler, readiness_check,
};
use crate::services::{init_metrics, Database, DynStore, MemoryStore};
use crate::workers::InvoicingCoordinator;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub service_name: String,
    pub store: DynStore,
    pub coordinator: InvoicingCoordinator,
}

impl AppState {
    pub fn new(service_name: impl Into<String>, coordinator: InvoicingCoordinator) -> Self {
        Self {
            service_name: service_name.into(),
            store: coordinator.store().clone(),
            coordinator,
        }
    }
}

/// HTTP routes of the service.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .route("/v1/invoicing-runs", post(create_run))
        .route("/v1/invoicing-runs/:run_id", get(get_run))
        .route("/v1/customers/:customer_id/invoices", get(list_invoices))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: InvoicingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: InvoicingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: InvoicingConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let store: DynStore = match (config.store_backend, &config.database) {
            (StoreBackend::Postgres, Some(database)) => {
                let db = Database::new(
                    &database.url,
                    database.max_connections,
                    database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    e
                })?;

                if run_migrations {
                    db.run_migrations().await.map_err(|e| {
                        tracing::error!(error = %e, "Failed to run migrations");
                        e
                    })?;
                }

                Arc::new(db)
            }
            (StoreBackend::Postgres, None) => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "DATABASE_URL is required for the postgres store"
                )))
            }
            (StoreBackend::Memory, _) => {
                tracing::warn!("Using the in-memory store, data is lost on shutdown");
                Arc::new(MemoryStore::new())
            }
        };

        let coordinator = InvoicingCoordinator::new(store, config.invoicing.coordinator_settings());
        let state = AppState::new(config.service_name.clone(), coordinator);

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Credit invoicing service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn store(&self) -> &DynStore {
        &self.state.store
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let service_name = self.state.service_name.clone();
        let http_router = router(self.state);

        tracing::info!(
            service = %service_name,
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        axum::serve(self.http_listener, http_router)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "HTTP server error");
                std::io::Error::other(format!("HTTP server error: {}", e))
            })
    }
}
