mod config;
mod error;
mod handlers;
mod ratelimit;
mod state;
mod storage;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::state::AppState;
use crate::storage::object_store::S3Store;
use crate::storage::Storage;

/// How often the retention loop runs. It also runs once at startup.
const PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const RATE_LIMIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "skiff-server", version, about = "skiff backup server")]
struct Cli {
    /// Log output format: "json" or "pretty"
    #[arg(long, default_value = "pretty", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve {
        /// Override the configured listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Create the server configuration and generate an auth token
    Init,

    /// Token management
    Token {
        #[command(subcommand)]
        command: TokenCommand,
    },
}

#[derive(Subcommand)]
enum TokenCommand {
    /// Print the configured auth token
    Show,
}

fn main() {
    let cli = Cli::parse();

    match cli.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt().json().init();
        }
        _ => {
            tracing_subscriber::fmt().init();
        }
    }

    let result = match cli.command {
        Commands::Serve { listen } => run_serve(listen),
        Commands::Init => run_init(),
        Commands::Token {
            command: TokenCommand::Show,
        } => run_token_show(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run_serve(listen_override: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let mut cfg = config::load()?;
    if let Some(listen) = listen_override {
        cfg.listen_addr = listen;
    }
    cfg.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(cfg))
}

async fn serve(cfg: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = std::path::Path::new(&cfg.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let store = Arc::new(S3Store::from_config(&cfg)?);
    let storage = Arc::new(Storage::open(&cfg.db_path, store)?);
    info!(db = %cfg.db_path, bucket = %cfg.s3_bucket, "storage ready");

    if cfg.metrics_port > 0 {
        warn!(
            port = cfg.metrics_port,
            "metrics_port is configured but no exporter is linked in this build"
        );
    }

    let state = AppState::new(cfg.clone(), storage.clone());

    // Retention loop: prune at startup, then daily. Errors are logged and
    // the loop continues.
    let retention_days = cfg.retention_days;
    let prune_storage = storage.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            interval.tick().await;
            let storage = prune_storage.clone();
            let cutoff = Utc::now() - chrono::Duration::days(retention_days);
            let result =
                tokio::task::spawn_blocking(move || storage.prune(cutoff)).await;
            match result {
                Ok(Ok(stats)) if stats.manifests_removed > 0 => {
                    info!(manifests = stats.manifests_removed, "retention prune complete");
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(error = %e, "retention prune failed"),
                Err(e) => error!(error = %e, "retention prune task panicked"),
            }
        }
    });

    // Expired rate-limit entries are evicted periodically.
    let cleanup_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RATE_LIMIT_CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            cleanup_state.inner.rate_limiter.cleanup();
        }
    });

    let app = handlers::router(state);
    let listen_addr = normalize_listen_addr(&cfg.listen_addr);
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("skiff-server listening on {listen_addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// A bare ":8080" binds all interfaces.
fn normalize_listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn run_init() -> Result<(), Box<dyn std::error::Error>> {
    let mut cfg = config::load()?;
    if cfg.token.is_empty() {
        cfg.token = generate_token();
    }
    config::save(&cfg)?;

    println!("Configuration written to {}", config::config_dir()?.display());
    println!("Auth token: {}", cfg.token);
    println!();
    println!("Set s3_endpoint, s3_bucket, and credentials before starting the server,");
    println!("or export SKIFF_S3_ENDPOINT / SKIFF_S3_BUCKET / SKIFF_S3_ACCESS_KEY / SKIFF_S3_SECRET_KEY.");
    Ok(())
}

fn run_token_show() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config::load()?;
    if cfg.token.is_empty() {
        return Err("no token configured; run `skiff-server init` first".into());
    }
    println!("{}", cfg.token);
    Ok(())
}

fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}
