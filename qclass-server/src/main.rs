use clap::Parser;
use qclass_core::QclassConfig;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use qclass_server::http::{start_http_server, HttpState};
use qclass_server::services::{build_services, build_store};
use qclass_server::{server, subsystems};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "qclass.toml")]
    config: String,

    /// Check the record store and exit
    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match QclassConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over service.log_level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    if args.health {
        let store = match build_store(&config.database).await {
            Ok(s) => s,
            Err(e) => {
                println!("❌ Record store unavailable: {:#}", e);
                std::process::exit(1);
            }
        };
        match store.health().await {
            Ok(v) => println!("✅ {} store: {}", store.name(), v),
            Err(e) => {
                println!("❌ {} store health check failed: {}", store.name(), e);
                std::process::exit(1);
            }
        }
        println!("✅ Qclass health check passed");
        return Ok(());
    }

    let services = match build_services(config).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to start services: {:#}", e);
            std::process::exit(1);
        }
    };

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    tokio::spawn(subsystems::sweeper::run_cache_sweeper(
        services.cache.clone(),
        std::time::Duration::from_secs(services.config.cache.purge_interval_seconds.max(1)),
        tx.subscribe(),
    ));

    if services.config.http.enabled {
        let http_state = HttpState::from(&services);
        let http_shutdown = tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = start_http_server(http_state, http_shutdown).await {
                tracing::error!("HTTP server error: {}", e);
            }
        });
    }

    let socket_path = services.config.service.socket_path.clone();
    server::run_unix_server(&socket_path, services.coordinator.clone(), tx.subscribe()).await?;

    Ok(())
}
