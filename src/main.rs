//! HTTP transport front-end.
//!
//! # Architecture Overview
//!
//! ```text
//!   client ──▶ listener ──▶ channel initializer ──▶ negotiation ──▶ pipeline ──▶ SourceHandler
//!              (net)        (server)                (TLS/ALPN,       (decoder,     (echo or
//!                                                    h2c upgrade)     aggregator,   forward)
//!                                                                     compressor,
//!                                                                     chunkWriter)
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use http_transport::config::load_config;
use http_transport::observability::{logging, metrics};
use http_transport::{HttpTransport, Shutdown};

#[derive(Parser, Debug)]
#[command(name = "http-transport", version, about = "HTTP/1.1 and HTTP/2 transport front-end")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "transport.toml")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            logging::init_logging("info");
            tracing::error!(path = %cli.config.display(), error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    logging::init_logging(&config.observability.log_level);

    if cli.check {
        tracing::info!(
            path = %cli.config.display(),
            listeners = config.listeners.len(),
            "Configuration is valid"
        );
        return ExitCode::SUCCESS;
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "http-transport starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let transport = match HttpTransport::new(config) {
        Ok(transport) => transport,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = Shutdown::new();
    tokio::spawn(shutdown.clone().trigger_on_ctrl_c());

    match transport.run(shutdown).await {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Transport failed");
            ExitCode::FAILURE
        }
    }
}
