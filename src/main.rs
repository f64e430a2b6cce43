use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use clap_derive::{Parser, Subcommand};
use latency_monitor::config::{parse_labels, Config, LogConfig, LogMode, MetricsConfig, TransponderConfig};
use latency_monitor::server::Server;
use tracing::{info, Level};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "latency-monitor", version, about = "Monitors latency between the nodes")]
struct Cli {
    /// logging level
    #[arg(long, global = true, env = "LATENCY_MONITOR_LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// logging mode
    #[arg(long, global = true, env = "LATENCY_MONITOR_LOG_MODE", value_enum, default_value = "prod")]
    log_mode: LogMode,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// run the monitor server (default)
    Serve(ServeArgs),
}

#[derive(Parser)]
struct ServeArgs {
    /// extra metrics labels in the format `label=value`
    #[arg(long = "metrics-label", env = "LATENCY_MONITOR_METRICS_LABELS", value_delimiter = ',')]
    metrics_labels: Vec<String>,

    /// count of latency histogram buckets
    #[arg(long, env = "LATENCY_MONITOR_METRICS_LATENCY_BUCKETS_COUNT", default_value_t = 33)]
    metrics_latency_buckets_count: usize,

    /// `host:port` for the metrics server to listen on; the host may be a name, or empty for all interfaces
    #[arg(long, env = "LATENCY_MONITOR_METRICS_LISTEN_ADDRESS", default_value = "0.0.0.0:8080")]
    metrics_listen_address: String,

    /// location to be reported as 'from' and 'to' labels (max 36 bytes) [default: random UUID]
    #[arg(long, env = "LATENCY_MONITOR_METRICS_LOCATION")]
    metrics_location: Option<String>,

    /// microseconds value for the largest histogram latency bucket
    #[arg(long, env = "LATENCY_MONITOR_METRICS_MAX_LATENCY", default_value_t = 1_000_000)]
    metrics_max_latency: u64,

    /// interval at which the transponder sends its probes
    #[arg(long, env = "LATENCY_MONITOR_TRANSPONDER_INTERVAL", default_value = "1m", value_parser = humantime::parse_duration)]
    transponder_interval: Duration,

    /// `host:port` for the transponder to listen on
    #[arg(long, env = "LATENCY_MONITOR_TRANSPONDER_LISTEN_ADDRESS", default_value = "0.0.0.0:32123")]
    transponder_listen_address: String,

    /// `name=host:port` of a peer to measure the latency against
    #[arg(long = "transponder-peer", env = "LATENCY_MONITOR_TRANSPONDER_PEERS", value_delimiter = ',')]
    transponder_peers: Vec<String>,

    /// upper bound for each step of the shutdown
    #[arg(long, env = "LATENCY_MONITOR_SHUTDOWN_GRACE_PERIOD", default_value = "30s", value_parser = humantime::parse_duration)]
    shutdown_grace_period: Duration,
}

impl ServeArgs {
    fn into_config(self, log: LogConfig) -> anyhow::Result<Config> {
        Ok(Config {
            log,
            metrics: MetricsConfig {
                listen_address: self.metrics_listen_address,
                labels: parse_labels(&self.metrics_labels)?,
                location: self.metrics_location.unwrap_or_else(|| Uuid::new_v4().to_string()),
                latency_buckets_count: self.metrics_latency_buckets_count,
                max_latency_us: self.metrics_max_latency,
            },
            transponder: TransponderConfig {
                interval: self.transponder_interval,
                listen_address: self.transponder_listen_address,
                peers: self.transponder_peers,
            },
            shutdown_grace_period: self.shutdown_grace_period,
        })
    }
}

fn init_logging(log: &LogConfig) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_max_level(log.level);
    let result = match log.mode {
        LogMode::Prod => builder.json().try_init(),
        LogMode::Dev => builder.try_init(),
    };
    result.map_err(|e| anyhow!("failed to initialize logging: {}", e))
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log = LogConfig {
        level: cli.log_level,
        mode: cli.log_mode,
    };
    init_logging(&log)?;

    let serve_args = match cli.command {
        Some(Command::Serve(args)) => args,
        // flags of the default command can only be passed through the environment
        None => ServeArgs::parse_from(["latency-monitor"]),
    };
    let config = serve_args.into_config(log)?;
    info!(?config, "starting latency monitor");

    let server = Server::new(config)?;
    server.run().await
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("\nFailed with error:\n\n{:#}\n", e);
        std::process::exit(1);
    }
}
