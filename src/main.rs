use clap::Parser;
use rustbalance::config::Config;
use rustbalance::pacemaker::Pacemaker;
use rustbalance::server::Server;
use rustbalance::upstream::Upstream;
use rustbalance::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "RustBalance")]
#[command(about = "High-performance connection-aware UDP load balancer in Rust", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", default_value = "config.yml")]
    config: PathBuf,

    /// Generate example configuration file
    #[arg(long, value_name = "FILE")]
    generate_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle config generation
    if let Some(config_path) = args.generate_config {
        println!("Generating example configuration file: {:?}", config_path);
        Config::create_example(&config_path)?;
        println!(
            "Edit the file and run: rustbalance --config {:?}",
            config_path
        );
        return Ok(());
    }

    init_logging(&args.log_level)?;

    info!("RustBalance v{} starting", env!("CARGO_PKG_VERSION"));

    info!("Loading configuration from {:?}", args.config);
    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Can't read configuration file: {e}");
            return Err(e);
        }
    };

    let (shutdown_tx, _) = broadcast::channel(1);

    // Upstream pools first; dynamic ones start polling right away.
    let mut upstreams = Vec::with_capacity(config.upstreams.len());
    for upstream_cfg in &config.upstreams {
        let upstream = Arc::new(Upstream::from_config(upstream_cfg)?);
        upstream.clone().spawn_tasks(&shutdown_tx);
        upstreams.push(upstream);
    }

    // Then listeners; any bind or pass-resolution failure is fatal.
    let mut servers = Vec::with_capacity(config.servers.len());
    for server_cfg in &config.servers {
        info!(
            bind = %server_cfg.address,
            port = server_cfg.port,
            pass = %server_cfg.pass,
            "starting server"
        );

        let server = Arc::new(match Server::bind(server_cfg, &upstreams).await {
            Ok(server) => server,
            Err(e) => {
                error!("Can't start server on port {}: {e}", server_cfg.port);
                return Err(e);
            }
        });
        server.clone().start();
        servers.push(server);
    }

    if let Some(pacemaker_cfg) = &config.pacemaker {
        match Pacemaker::from_config(pacemaker_cfg).await {
            Ok(pacemaker) => {
                tokio::spawn(pacemaker.run(shutdown_tx.subscribe()));
            }
            Err(e) => {
                warn!("{e}");
                warn!("Pacemaker error. Heartbeats disabled");
            }
        }
    }

    wait_for_signal().await;

    info!("Shutting down gracefully...");
    let _ = shutdown_tx.send(());
    for server in &servers {
        server.shutdown().await;
    }
    info!("Shutdown complete");

    Ok(())
}

async fn wait_for_signal() {
    let mut sigterm =
        signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(level)
        .map_err(|e| rustbalance::RustBalanceError::Config(format!("Invalid log level: {}", e)))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    Ok(())
}
