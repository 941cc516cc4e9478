//! Log shipper binary: tails files and exports them over lumberjack

use clap::Parser;
use lumberjack_exporter::{Config, LogCollector, Result};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Tail log files and ship them to Logstash beats inputs
#[derive(Parser, Debug)]
#[command(name = "lumberjack-exporter")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Downstream hosts, comma separated (overrides LOGSTASH_HOSTS)
    #[arg(long, value_delimiter = ',')]
    host: Vec<String>,

    /// Log files to tail, comma separated (overrides LOG_PATHS)
    #[arg(long = "log-path", value_delimiter = ',')]
    log_path: Vec<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    initialize_tracing();

    info!("Starting lumberjack exporter v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::from_env();
    if !cli.host.is_empty() {
        config.hosts = cli.host;
    }
    if !cli.log_path.is_empty() {
        config.log_paths = cli.log_path;
    }

    if let Err(e) = config.validate_collector() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    info!(
        "Exporter configuration - Hosts: {:?}, Workers: {}, Load balance: {}, Slow start: {}, Files: {:?}",
        config.hosts, config.workers, config.load_balance, config.slow_start, config.log_paths
    );

    if cli.check_config {
        info!("Configuration is valid");
        return Ok(());
    }

    let collector = LogCollector::new(config)?;

    if let Err(e) = collector.start().await {
        error!("Collector failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Initialize structured logging. `LOG_FORMAT=pretty` switches from JSON to
/// human readable output.
fn initialize_tracing() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let pretty = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("pretty"));

    let registry = tracing_subscriber::registry().with(filter_layer);
    if pretty {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(false)
                    .with_line_number(false)
                    .json(),
            )
            .init();
    }
}
