use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use captcha_dispatch::config::{DispatchConfig, RetryPolicy, UpstreamConfig};
use captcha_dispatch::scheduler::DispatchStats;
use captcha_dispatch::server::DispatchServer;
use captcha_dispatch::shutdown::install_shutdown_handler;
use captcha_dispatch::upstream::HttpUpstream;

#[derive(Parser, Debug)]
#[command(name = "captcha-dispatch")]
#[command(version)]
#[command(about = "Hands out captchas to anonymous clients, one at a time, with a fair wait queue")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the dispatcher
    Server(ServerArgs),

    /// Show pool, assignment and queue counts of a running dispatcher
    Status(StatusArgs),
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "3000")]
    port: u16,

    /// Upstream endpoint serving the items, answers and verify channels
    #[arg(long, env = "UPSTREAM_URL", default_value = "http://127.0.0.1:8080/api")]
    upstream_url: String,

    /// Timeout for every upstream request, in seconds
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value = "15")]
    upstream_timeout_secs: u64,

    /// Seconds between pool refreshes
    #[arg(long, env = "REFRESH_INTERVAL_SECS", default_value = "30")]
    refresh_interval_secs: u64,

    /// Seconds between queue eviction sweeps
    #[arg(long, env = "EVICTION_INTERVAL_SECS", default_value = "10")]
    eviction_interval_secs: u64,

    /// Seconds a queued client may go without polling
    #[arg(long, env = "QUEUE_TIMEOUT_SECS", default_value = "60")]
    queue_timeout_secs: u64,

    /// Seconds an assigned client may stay silent before its captcha is reclaimed
    #[arg(long, env = "ASSIGNMENT_TIMEOUT_SECS", default_value = "600")]
    assignment_timeout_secs: u64,

    /// Answer steps per captcha when the item does not declare any
    #[arg(long, env = "DEFAULT_STEPS", default_value = "1")]
    default_steps: u32,

    /// Verification attempts after the final answer
    #[arg(long, env = "VERIFY_ATTEMPTS", default_value = "5")]
    verify_attempts: u32,

    /// Delay between verification attempts, in milliseconds
    #[arg(long, env = "VERIFY_INTERVAL_MS", default_value = "2000")]
    verify_interval_ms: u64,

    /// Skip the verification poll entirely
    #[arg(long, env = "NO_VERIFY")]
    no_verify: bool,
}

// =============================================================================
// Status Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct StatusArgs {
    /// Dispatcher base URL
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:3000")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;

    let config = DispatchConfig {
        listen_addr,
        upstream: UpstreamConfig {
            url: args.upstream_url,
            timeout: Duration::from_secs(args.upstream_timeout_secs),
            verify: !args.no_verify,
        },
        refresh_interval: Duration::from_secs(args.refresh_interval_secs),
        eviction_interval: Duration::from_secs(args.eviction_interval_secs),
        queue_timeout: Duration::from_secs(args.queue_timeout_secs),
        assignment_timeout: Duration::from_secs(args.assignment_timeout_secs),
        default_steps: args.default_steps,
        verify_policy: RetryPolicy {
            max_attempts: args.verify_attempts.max(1),
            interval: Duration::from_millis(args.verify_interval_ms),
        },
        ..DispatchConfig::default()
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        upstream = %config.upstream.url,
        refresh_interval = ?config.refresh_interval,
        queue_timeout = ?config.queue_timeout,
        verify = config.upstream.verify,
        "Starting captcha dispatcher"
    );

    let upstream = HttpUpstream::new(&config.upstream)?;
    let shutdown = install_shutdown_handler()?;
    DispatchServer::new(config, Arc::new(upstream))
        .run(shutdown)
        .await?;

    Ok(())
}

// =============================================================================
// Status Command
// =============================================================================

async fn handle_status(args: StatusArgs) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/api/status", args.addr.trim_end_matches('/'));
    let stats: DispatchStats = reqwest::get(&url).await?.error_for_status()?.json().await?;

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        OutputFormat::Table => {
            println!("Dispatcher Status");
            println!("{}", "=".repeat(30));
            println!("{:<12} {}", "Pooled:", stats.pooled);
            println!("{:<12} {}", "Assigned:", stats.assigned);
            println!("{:<12} {}", "Queued:", stats.queued);
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Status(status_args) => {
            handle_status(status_args).await?;
        }
    }

    Ok(())
}
