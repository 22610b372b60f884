pub mod handlers;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::supervisor::Supervisor;
use handlers::{events, files, instance, server};

/// IPC Server State
#[derive(Clone)]
pub struct IPCServer {
    pub supervisor: Arc<Supervisor>,
    pub listen_addr: String,
}

impl IPCServer {
    pub fn new(supervisor: Arc<Supervisor>, listen_addr: &str) -> Self {
        Self {
            supervisor,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/health", get(server::health))
            .route(
                "/api/instances",
                get(instance::list_instances).post(instance::create_instance),
            )
            .route(
                "/api/instances/:id",
                get(instance::get_instance)
                    .put(instance::update_instance)
                    .delete(instance::delete_instance),
            )
            .route(
                "/api/instances/:id/install",
                post(server::install_instance).get(server::install_status),
            )
            .route("/api/instances/:id/start", post(server::start_instance))
            .route("/api/instances/:id/stop", post(server::stop_instance))
            .route("/api/instances/:id/stats", get(server::instance_stats))
            .route("/api/instances/:id/console", get(server::instance_console))
            .route(
                "/api/instances/:id/files",
                get(files::read_path)
                    .put(files::write_file)
                    .delete(files::delete_path),
            )
            .route("/api/instances/:id/events", get(events::instance_sse))
            .route("/api/events", get(events::events_ws))
            .route("/api/steamcmd", get(server::steamcmd_status))
            .route("/api/steamcmd/install", post(server::steamcmd_install))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Serve until `shutdown` resolves.
    pub async fn start<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}
