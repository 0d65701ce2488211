use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use inspector_core::{InspectorConfig, IronicClient, RetryPolicy, SessionStore};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use inspector_server::subsystems::firewall::{DisabledFirewall, Firewall, IptablesFirewall};
use inspector_server::subsystems::introspect::Introspector;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "inspector.toml")]
    config: String,

    /// Check the database and exit
    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience, production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match InspectorConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    let pool = match inspector_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match inspector_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ SQLite ready: {} ({})", v, config.database.path),
            Err(e) => {
                println!("❌ SQLite check failed: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let store = SessionStore::new(pool, config.introspection.clone());

    let client = match IronicClient::new(&config.ironic) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("Failed to create Ironic client: {}", e);
            std::process::exit(1);
        }
    };

    let firewall: Arc<dyn Firewall> = if config.firewall.manage_firewall {
        Arc::new(IptablesFirewall::new(store.clone(), config.firewall.clone()))
    } else {
        Arc::new(DisabledFirewall)
    };
    firewall.init().await?;
    firewall.update_filters().await?;

    let introspector = Introspector::new(
        store.clone(),
        client,
        firewall.clone(),
        RetryPolicy::from_config(&config.ironic),
    );

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let sweep_task = tokio::spawn(inspector_server::subsystems::sweep::run_sweep_loop(
        store,
        firewall.clone(),
        Duration::from_secs(config.introspection.clean_up_period_secs),
        tx.subscribe(),
    ));

    if config.http.enabled {
        inspector_server::http::start_http_server(introspector, config.http.clone(), tx.subscribe())
            .await?;
    } else {
        tracing::info!("HTTP API disabled, running background tasks only");
        let _ = tx.subscribe().recv().await;
    }

    let _ = sweep_task.await;

    if let Err(e) = firewall.clean_up().await {
        tracing::warn!("Firewall clean up failed: {}", e);
    }

    Ok(())
}
