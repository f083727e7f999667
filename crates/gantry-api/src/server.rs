//! API server

use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

/// Serves the control plane with graceful shutdown
pub struct ApiServer;

impl ApiServer {
    /// Run the router until the shutdown future completes
    pub async fn run(
        listen_address: &str,
        router: Router,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(listen_address).await?;
        let local_addr = listener.local_addr()?;
        info!(bind = %local_addr, "Starting control plane");

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        info!("Control plane shut down");
        Ok(())
    }
}
