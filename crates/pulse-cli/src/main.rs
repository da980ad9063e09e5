//! # pulse-sub
//!
//! Join Pulse topics and print their events as JSON lines.
//!
//! ## Usage
//!
//! ```bash
//! # Join topics on the default endpoint
//! pulse-sub room:lobby room:ops
//!
//! # Run with a custom config
//! pulse-sub --config /path/to/pulse-sub.toml
//!
//! # Run with environment variables
//! PULSE_ENDPOINT=wss://chat.example.com/socket PULSE_TOPICS=room:lobby pulse-sub
//! ```

mod config;
mod metrics;
mod session;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, TransportKind};

#[derive(Parser, Debug)]
#[command(name = "pulse-sub", version, about = "Subscribe to Pulse topics")]
struct Args {
    /// Config file. Defaults to the first of ./pulse-sub.toml,
    /// /etc/pulse/pulse-sub.toml and ~/.config/pulse/pulse-sub.toml.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Socket endpoint, e.g. ws://localhost:4000/socket.
    #[arg(long, short)]
    endpoint: Option<String>,

    /// Use HTTP long-polling instead of WebSocket.
    #[arg(long)]
    longpoll: bool,

    /// Topics to join, replacing configured topics.
    topics: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulse=info,tenvis_pulse_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if args.longpoll {
        config.transport = TransportKind::Longpoll;
    }
    if !args.topics.is_empty() {
        config.topics = args.topics;
    }
    config.validate()?;

    metrics::init_metrics(&config.metrics)?;

    session::run(config).await
}
