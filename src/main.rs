use std::sync::Arc;

use charity_relay::api;
use charity_relay::config::Config;
use charity_relay::server::Server;
use charity_relay::store::MemoryStore;
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load();

    let store = match &config.data_file {
        Some(path) => match MemoryStore::open(path).await {
            Ok(store) => store,
            Err(e) => {
                error!("Failed to open store at {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => {
            info!("No data file configured, keeping state in memory only");
            MemoryStore::new()
        }
    };

    let server = Server::new(Arc::new(store));
    let routes = api::routes(server, &config.static_dir);
    let addr = config.socket_addr();

    match config.tls_paths() {
        Some((cert, key)) => {
            info!("Starting secure server (HTTPS/WSS) on {}...", addr);
            let (_, serving) = warp::serve(routes)
                .tls()
                .cert_path(cert)
                .key_path(key)
                .bind_with_graceful_shutdown(addr, shutdown_signal());
            serving.await;
        }
        None => {
            info!("Starting server (HTTP/WS) on {}...", addr);
            match warp::serve(routes).try_bind_with_graceful_shutdown(addr, shutdown_signal()) {
                Ok((_, serving)) => serving.await,
                Err(e) => {
                    error!("Failed to bind to {}: {}", addr, e);
                    std::process::exit(1);
                }
            }
        }
    }

    info!("Server shut down");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, shutting down");
}
