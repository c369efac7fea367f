//! RelayDrop relay binary.
//!
//! # Usage
//!
//! ```bash
//! # Self-signed certificate (development)
//! relaydrop-server --bind 0.0.0.0:4433
//!
//! # TLS certificate (production)
//! relaydrop-server --bind 0.0.0.0:4433 --cert cert.pem --key key.pem
//! ```

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use relaydrop_server::{DriverConfig, Server, ServerRuntimeConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// RelayDrop relay
#[derive(Parser, Debug)]
#[command(name = "relaydrop-server")]
#[command(about = "Relay for room-based chunked file transfer")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:4433")]
    bind: String,

    /// Path to TLS certificate (PEM format)
    #[arg(short, long)]
    cert: Option<PathBuf>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Seconds a disconnected sender has to reattach before its room closes
    #[arg(long, default_value = "60")]
    sender_grace_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(bind = %args.bind, "RelayDrop relay starting");

    if args.cert.is_none() || args.key.is_none() {
        tracing::warn!("no TLS certificate provided, using self-signed certificate");
    }

    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        cert_path: args.cert,
        key_path: args.key,
        driver: DriverConfig {
            max_connections: args.max_connections,
            sender_grace: Duration::from_secs(args.sender_grace_secs),
            ..Default::default()
        },
    };

    let server = Server::bind(config)?;

    tracing::info!(addr = %server.local_addr()?, "relay listening");

    server.run().await?;

    Ok(())
}
