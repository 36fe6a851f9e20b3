use clap::Parser;
use tracing::{error, info, warn};

use janus_fleet::cli::Cli;
use janus_fleet::config::Config;
use janus_fleet::gateway::Gateway;
use janus_fleet::websocket;

#[tokio::main]
async fn main() {
    // Default to INFO when RUST_LOG is not set.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        match Config::load(&cli.config) {
            Ok(config) => config,
            Err(err) => {
                error!("{err:#}");
                std::process::exit(1);
            }
        }
    } else {
        warn!(
            "config {} not found, falling back to defaults",
            cli.config.display()
        );
        let mut config = Config::default();
        config.apply_env();
        config
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if config.backends.is_empty() {
        warn!("no backends configured; allocation requests will fail");
    }

    info!("starting janus-fleet on port {}", config.port);
    info!("room state persisted to {}", config.state_path.display());

    let gateway = match Gateway::initialize(config.clone(), None).await {
        Ok(gateway) => gateway,
        Err(err) => {
            error!("failed to initialize gateway: {err:#}");
            std::process::exit(1);
        }
    };

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listen address");
    info!("janus-fleet listening on {addr}");
    let server = websocket::serve(gateway.clone(), listener);

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("signal handler failed: {err}");
    }
    info!("shutting down");
    gateway.terminate().await;
    server.abort();
}
