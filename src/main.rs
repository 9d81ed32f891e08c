use clap::{Parser, Subcommand};
use lnbarter::adapters::{LndRestClient, PostgresStore, PriceFeed, TradeStore};
use lnbarter::config::AppConfig;
use lnbarter::coordination::{OrderEventBus, OrderLocks};
use lnbarter::error::Result;
use lnbarter::services::{EscrowOrchestrator, OrderEngine, PaymentRetryEngine, Scheduler};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lnbarter")]
#[command(author, version, about = "P2P Lightning escrow trade engine")]
struct Cli {
    /// Configuration directory
    #[arg(short, long, default_value = "config")]
    config_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the trade engine
    Run,
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config_dir)?;
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("configuration error: {error}");
        }
        return Err(lnbarter::error::EngineError::Internal(
            "invalid configuration".to_string(),
        ));
    }
    init_logging(&config);

    match cli.command {
        Commands::Migrate => {
            let store = PostgresStore::new(
                &config.database.url,
                config.database.max_connections,
            )
            .await?;
            store.migrate().await?;
        }
        Commands::Run => run(config).await?,
    }
    Ok(())
}

async fn run(config: AppConfig) -> Result<()> {
    info!("starting lnbarter");

    let postgres =
        PostgresStore::new(&config.database.url, config.database.max_connections).await?;
    postgres.migrate().await?;
    let store: Arc<dyn TradeStore> = Arc::new(postgres);

    let node = Arc::new(LndRestClient::new(
        &config.lnd.rest_url,
        &config.lnd.macaroon_hex,
    )?);
    let escrow = EscrowOrchestrator::new(node, &config.lnd, &config.trade);
    let price = PriceFeed::new(
        &config.price.api_url,
        Duration::from_secs(config.price.request_timeout_secs),
    )?;

    let locks = OrderLocks::new();
    let events = OrderEventBus::default();

    let payouts = PaymentRetryEngine::new(
        Arc::clone(&store),
        escrow.clone(),
        events.clone(),
        locks.clone(),
        config.trade.max_payment_attempts,
    );
    let engine = OrderEngine::new(
        store,
        escrow.clone(),
        Arc::clone(&payouts),
        price,
        locks,
        events,
        config.trade.clone(),
    );
    let scheduler = Scheduler::new(
        engine,
        payouts,
        escrow,
        config.trade.clone(),
        config.scheduler.clone(),
    );
    scheduler.start().await;

    info!("engine running; press Ctrl+C to stop");
    match signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => warn!("failed to listen for shutdown signal: {e}"),
    }

    scheduler.stop();
    info!("lnbarter stopped");
    Ok(())
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn", config.logging.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
