use clap::Parser;
use log::{error, info};
use mcast_relay::{Config, HttpServer};
use std::path::PathBuf;
use tokio::runtime::Runtime;
use tokio::sync::watch;

/// Relay multicast UDP/RTP streams to HTTP clients.
#[derive(Parser, Debug)]
#[command(name = "mcast-relay", version, about)]
struct Args {
    /// Multicast interface (name or IPv4 address)
    #[arg(short = 'm', long = "interface")]
    interface: Option<String>,

    /// HTTP listen address
    #[arg(short = 'a', long = "address")]
    address: Option<String>,

    /// HTTP listen port
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Optional TOML configuration file; flags override its values
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_from_file(path)?,
            None => Config::default(),
        };
        if let Some(interface) = self.interface {
            config.interface = interface;
        }
        if let Some(address) = self.address {
            config.listen_address = address;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Main entry point.
/// Loads the configuration and serves HTTP clients until interrupted.
fn main() {
    let config = match Args::parse().into_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            // Logging is not set up yet; the configured level is part of what failed.
            eprintln!("{:#}", e);
            std::process::exit(2);
        }
    };

    // RUST_LOG wins over the configured level, which defaults to "info".
    let level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    info!("Configuration loaded: {:?}", config);

    let rt = match Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create Tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    // The server handle and its shutdown signal live here, not in a global.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        info!("Ctrl+C signal received, initiating shutdown...");
        let _ = shutdown_tx.send(true);
    })
    .expect("Error setting Ctrl-C handler");

    let result = rt.block_on(async {
        let server = HttpServer::bind(&config.listen_addr(), &config.interface).await?;
        server.run(shutdown_rx).await
    });

    match result {
        Ok(()) => info!("Server has shut down gracefully."),
        Err(e) => {
            error!("Server closed with error: {:#}", e);
            std::process::exit(1);
        }
    }
}
