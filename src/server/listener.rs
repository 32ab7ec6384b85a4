//! Stream server
//!
//! Owns the registry and authorizer shared by every connection, hands out
//! per-connection handlers to the protocol adapter and runs the delivery
//! router. Stopping the server stops every session.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::auth::Authorizer;
use crate::delivery::{self, DeliveryState};
use crate::error::Result;
use crate::registry::SessionRegistry;
use crate::server::config::ServerConfig;
use crate::server::handler::PublishHandler;

/// Live ingest server
pub struct StreamServer {
    config: ServerConfig,
    authorizer: Arc<Authorizer>,
    registry: Arc<SessionRegistry>,
    next_connection_id: AtomicU64,
}

impl StreamServer {
    /// Create a new server with the configured patterns
    pub fn new(config: ServerConfig) -> Self {
        let authorizer = Authorizer::new(&config.authorized_patterns);
        Self::with_authorizer(config, authorizer)
    }

    /// Create a new server with a custom authorizer
    pub fn with_authorizer(config: ServerConfig, authorizer: Authorizer) -> Self {
        let registry = SessionRegistry::with_config(config.registry_config());

        Self {
            config,
            authorizer: Arc::new(authorizer),
            registry: Arc::new(registry),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Get the server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get a reference to the session registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Get a reference to the authorizer
    pub fn authorizer(&self) -> &Arc<Authorizer> {
        &self.authorizer
    }

    /// Address the protocol adapter should accept ingest connections on
    pub fn ingest_addr(&self) -> SocketAddr {
        self.config.ingest_addr
    }

    /// Address the delivery router binds to
    pub fn delivery_addr(&self) -> SocketAddr {
        self.config.delivery_addr
    }

    /// Handler for a newly accepted ingest connection
    pub fn handler(&self) -> PublishHandler {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connection_id = connection_id, "New connection");

        PublishHandler::new(
            connection_id,
            Arc::clone(&self.authorizer),
            Arc::clone(&self.registry),
            self.config.reconnect_grace,
        )
    }

    /// Delivery router over this server's registry
    pub fn router(&self) -> axum::Router {
        delivery::router(DeliveryState::from_config(
            Arc::clone(&self.registry),
            &self.config,
        ))
    }

    /// Serve delivery until `shutdown` resolves, then stop every session
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.delivery_addr).await?;
        self.serve_until(listener, shutdown).await
    }

    /// Like [`run_until`](Self::run_until) on an already bound listener
    pub async fn serve_until<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(
            addr = %addr,
            ingest = %self.config.ingest_addr,
            output_dir = %self.config.output_dir.display(),
            "Delivery server listening"
        );

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.await;
                tracing::info!("Shutdown signal received");
            })
            .await;

        self.shutdown().await;
        result.map_err(Into::into)
    }

    /// Stop accepting publishes and stop every session
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
        tracing::info!(
            sessions_created = self.registry.sessions_created(),
            "Server stopped"
        );
    }
}

impl std::fmt::Debug for StreamServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamServer")
            .field("ingest_addr", &self.config.ingest_addr)
            .field("delivery_addr", &self.config.delivery_addr)
            .field("authorizer", &self.authorizer)
            .finish()
    }
}
