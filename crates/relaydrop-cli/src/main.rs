//! RelayDrop participant binary.
//!
//! # Usage
//!
//! ```bash
//! # Share two files, streaming as soon as the room exists
//! relaydrop send --start report.pdf photo.jpg
//!
//! # Receive them with the printed code
//! relaydrop receive k3x9qa --out ./incoming
//! ```

use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use relaydrop_cli::{ReceiveOptions, SendOptions, run_receive, run_send};
use relaydrop_client::{
    ClientConfig, DEFAULT_WINDOW_BYTES, RoomCode, SenderConfig,
    session::{ReconnectPolicy, SessionConfig},
};
use relaydrop_core::CHUNK_SIZE;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// RelayDrop participant
#[derive(Parser, Debug)]
#[command(name = "relaydrop")]
#[command(about = "Send and receive files through a RelayDrop relay")]
#[command(version)]
struct Args {
    /// Relay address
    #[arg(short, long, default_value = "127.0.0.1:4433", global = true)]
    server: String,

    /// Chunks in flight before the sender waits for the transport
    #[arg(long, default_value_t = DEFAULT_WINDOW_BYTES / CHUNK_SIZE, global = true)]
    window_chunks: u64,

    /// Failed connection attempts before giving up
    #[arg(long, default_value = "10", global = true)]
    reconnect_attempts: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Share files in a new room
    Send {
        /// Room code to request (generated when omitted)
        #[arg(short, long)]
        room: Option<String>,

        /// Stream every chunk immediately instead of on request
        #[arg(long)]
        start: bool,

        /// Receivers that must confirm every file before exiting
        #[arg(long, default_value = "1")]
        receivers: usize,

        /// Files to share
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Join a room and download its files
    Receive {
        /// Room code
        code: String,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        out: PathBuf,

        /// Chunk store path (kept after completion when given)
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = SessionConfig {
        reconnect: ReconnectPolicy {
            max_attempts: args.reconnect_attempts,
            backoff: Duration::from_secs(1),
        },
        client: ClientConfig {
            sender: SenderConfig { window_bytes: args.window_chunks.max(1) * CHUNK_SIZE },
            ..Default::default()
        },
        ..SessionConfig::new(args.server)
    };

    match args.command {
        Command::Send { room, start, receivers, files } => {
            let room = room.as_deref().map(RoomCode::parse).transpose()?;
            run_send(SendOptions { files, room, start, receivers }, config).await?;
        },
        Command::Receive { code, out, store } => {
            let room = RoomCode::parse(&code)?;
            run_receive(ReceiveOptions { room, out, store }, config).await?;
        },
    }

    Ok(())
}
