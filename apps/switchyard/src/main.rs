use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use switchyard_relay::ConnectionRegistry;
use tracing::{error, info, warn};

use switchyard::auth::StaticDirectory;
use switchyard::cli::Cli;
use switchyard::config::Config;
use switchyard::ws::SharedDirectory;
use switchyard::{build_router, metrics_handler};

#[tokio::main]
async fn main() {
    // Default to INFO level if RUST_LOG is not set.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env();
    let port = cli.port.unwrap_or(config.port);

    let directory: SharedDirectory = match config.accounts.as_deref() {
        Some(pairs) => match StaticDirectory::parse(pairs) {
            Ok(directory) => Arc::new(directory),
            Err(error) => {
                error!("invalid SWITCHYARD_ACCOUNTS: {error:#}");
                std::process::exit(1);
            }
        },
        None => {
            warn!("SWITCHYARD_ACCOUNTS is not set; every attachment will be rejected");
            Arc::new(StaticDirectory::default())
        }
    };

    let prometheus_handle = install_metrics_recorder();
    let registry = ConnectionRegistry::new();

    let app = build_router(registry, directory).merge(
        Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(prometheus_handle),
    );

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listen address");

    info!("switchyard listening on {}", addr);

    axum::serve(listener, app).await.expect("server exited");
}

fn install_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}
