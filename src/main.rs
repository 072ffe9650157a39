use anyhow::Result;
use clap::Parser;
use throttle_guard::config::Config;
use throttle_guard::server::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "throttle-guard", version, about = "Per-identifier rate limiting guard")]
struct Args {
    /// JSON configuration file; THROTTLE_* environment variables are used when absent
    #[arg(short, long)]
    config: Option<String>,

    /// Override the bind address
    #[arg(short, long)]
    bind: Option<std::net::SocketAddr>,

    /// Override the default log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "throttle_guard={level},throttler={level},tower_http=debug",
                    level = config.log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting throttle guard");
    tracing::info!(
        "Configuration: bind_addr={}, points={}, duration={:?}, block_duration={:?}",
        config.bind_addr,
        config.quota.points,
        config.quota.duration,
        config.quota.block_duration
    );

    // Create and run the server
    let server = Server::new(&config)
        .map_err(|e| anyhow::anyhow!("Failed to create server: {}", e))?;

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
