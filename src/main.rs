//! RelayMQ broker binary
//!
//! Loads TOML configuration (optional), applies CLI overrides, installs
//! the tracing subscriber and runs the broker until ctrl-c.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relaymq::broker::Broker;
use relaymq::config::Config;
use relaymq::hooks::DefaultHooks;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// RelayMQ - MQTT 3.1.1 broker
#[derive(Parser, Debug)]
#[command(name = "relaymq", version, about)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// WebSocket bind address (enables MQTT over WebSocket)
    #[arg(long)]
    ws_bind: Option<SocketAddr>,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Maximum packet size in bytes
    #[arg(long)]
    max_packet_size: Option<usize>,

    /// Log level
    #[arg(short, long)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load config {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    let level = args
        .log_level
        .map(|l| l.as_str().to_string())
        .unwrap_or_else(|| config.log.level.clone());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("relaymq={}", level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut broker_config = config.broker_config();
    if let Some(bind) = args.bind {
        broker_config.bind_addr = bind;
    }
    if let Some(ws_bind) = args.ws_bind {
        broker_config.ws_bind_addr = Some(ws_bind);
    }
    if let Some(max_connections) = args.max_connections {
        broker_config.max_connections = max_connections;
    }
    if let Some(max_packet_size) = args.max_packet_size {
        broker_config.max_packet_size = max_packet_size;
    }

    let grace = broker_config.shutdown_grace;
    let broker = Arc::new(Broker::with_hooks(broker_config, Arc::new(DefaultHooks)));

    info!("starting relaymq {}", env!("CARGO_PKG_VERSION"));

    let runner = broker.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = runner.run().await {
            error!("broker exited with error: {}", e);
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!("failed to listen for shutdown signal: {}", e),
    }

    broker.stop(grace).await;
    let _ = server.await;
    info!("relaymq stopped");
}
