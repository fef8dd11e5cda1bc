use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use precache_server::{ServerConfig, ServerState, server};
use std::error::Error;
use std::io;
use std::sync::Arc;
use tower::Service;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,precache_server=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;
    let bind_addr = config.bind_addr;
    info!("Origin: {}", config.origin);
    info!("Storage directory: {}", config.storage_dir.display());

    let state = Arc::new(ServerState::open(config)?);

    // Install the initial manifest. Without it every request goes to the network.
    match state.load_worker().await {
        Ok(worker) => {
            if let Err(e) = state.registry.register(worker).await {
                warn!("Initial install failed, serving from network: {}", e);
            }
        }
        Err(e) => warn!("No manifest loaded, serving from network: {}", e),
    }

    // Create and run the server
    let app = server::create_app(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("Precache server listening on http://{} (HTTP/1.1 + HTTP/2)", bind_addr);

    // Use hyper's auto-negotiating server to support both HTTP/1.1 and HTTP/2
    let conn_builder = ConnBuilder::new(hyper_util::rt::TokioExecutor::new());

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                continue;
            }
        };
        debug!("New connection from: {}", addr);
        let io = TokioIo::new(stream);
        let app_clone = app.clone();
        let conn_builder = conn_builder.clone();

        tokio::spawn(async move {
            if let Err(err) = conn_builder
                .serve_connection(
                    io,
                    hyper::service::service_fn(move |req| app_clone.clone().call(req)),
                )
                .await
            {
                // Check if the error is an io::Error indicating a normal close
                let is_normal_close = err
                    .source()
                    .and_then(|e| e.downcast_ref::<io::Error>())
                    .map(|io_err| {
                        matches!(
                            io_err.kind(),
                            io::ErrorKind::ConnectionReset
                                | io::ErrorKind::BrokenPipe
                                | io::ErrorKind::UnexpectedEof
                        )
                    })
                    .unwrap_or(false);

                if is_normal_close {
                    debug!("Connection from {} closed normally", addr);
                } else {
                    error!("Error serving connection from {}: {}", addr, err);
                }
            } else {
                debug!("Connection from {} completed successfully", addr);
            }
        });
    }
}
