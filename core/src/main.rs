use clap::Parser;
use corvidmq::{BrokerConfig, BrokerServer, Result};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "corvidmq")]
#[command(about = "A message broker with durable queues, paging and XA transactions")]
struct Args {
    /// Configuration file (TOML, JSON or YAML); CORVID_* variables override it
    #[arg(short, long)]
    config: Option<String>,

    /// Bind address of the TCP acceptor
    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    data_dir: Option<String>,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&args.log_level))
        .init();

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path);
            BrokerConfig::from_file(path)?
        }
        None => BrokerConfig::from_env()?,
    };
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if args.host.is_some() || args.port.is_some() {
        let host = args.host.unwrap_or_else(|| "0.0.0.0".to_string());
        let port = args.port.unwrap_or(5445);
        config = config.with_tcp_acceptor(&host, port);
    }

    info!("Data directory: {}", config.data_dir);
    info!("Persistence enabled: {}", config.persistence_enabled);
    info!("Security enabled: {}", config.security.enabled);

    let server = BrokerServer::new(config)?;
    server.start().await?;

    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");
    server.stop();

    info!("CorvidMQ shut down successfully");
    Ok(())
}

fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            warn!("Invalid log level '{}', defaulting to 'info'", level);
            tracing::Level::INFO
        }
    }
}
