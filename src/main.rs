use buydip::api::{CoincheckClient, Credentials, FearGreedClient, MarketData};
use buydip::config::AppConfig;
use buydip::execution::{Ledger, LotState, Orchestrator};
use buydip::strategy::BuyTheDipStrategy;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "buydip=info";
const ERROR_LOG_FILE: &str = "error.log";

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(
    name = "buydip",
    version,
    about = "Buys BTC/JPY on extreme fear and takes profit per lot"
)]
struct Cli {
    /// Config file (defaults to ./buydip.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Ledger CSV, overriding the configured path
    #[arg(short, long, global = true)]
    ledger: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run one evaluation cycle (default)
    Run,
    /// Show the current price and Fear & Greed reading
    Status,
    /// Show non-zero account balances
    Balance,
    /// List recorded lots with their current ratio
    Positions,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(ledger) = cli.ledger {
        config.ledger_path = ledger;
    }

    let _guard = setup_logging(&config);

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&config).await,
        Command::Status => status(&config).await,
        Command::Balance => balance(&config).await,
        Command::Positions => positions(&config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

// ============================================================================
// Initialization Functions
// ============================================================================

/// Stdout filtered by `RUST_LOG` plus warnings and errors into `error.log`
fn setup_logging(config: &AppConfig) -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let stdout_layer = fmt::layer().with_filter(env_filter);

    let file_layer = match std::fs::create_dir_all(&config.log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::never(&config.log_dir, ERROR_LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(LevelFilter::WARN);
            Some((layer, guard))
        }
        Err(e) => {
            eprintln!(
                "⚠️  Cannot create log directory {}: {}",
                config.log_dir.display(),
                e
            );
            None
        }
    };

    let (file_layer, guard) = match file_layer {
        Some((layer, guard)) => (Some(layer), Some(guard)),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .init();

    guard
}

fn create_exchange_client(config: &AppConfig) -> anyhow::Result<CoincheckClient> {
    let client = CoincheckClient::new(
        &config.exchange.base_url,
        Duration::from_secs(config.exchange.timeout_secs),
        Credentials::from_env(),
    )?;

    if !client.has_credentials() {
        tracing::warn!("COINCHECK_API_KEY / COINCHECK_API_SECRET not set, private calls will fail");
    }

    Ok(client)
}

fn create_sentiment_client(config: &AppConfig) -> anyhow::Result<FearGreedClient> {
    FearGreedClient::new(
        &config.sentiment.base_url,
        Duration::from_secs(config.sentiment.timeout_secs),
    )
}

// ============================================================================
// Commands
// ============================================================================

async fn run(config: &AppConfig) -> anyhow::Result<()> {
    tracing::info!("🚀 buydip starting");
    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Pair: {}", config.exchange.pair);
    tracing::info!("  Fear threshold: {}", config.strategy.fear_threshold);
    tracing::info!(
        "  Budget: ¥{} in {} divisions (x{} per fear day)",
        config.strategy.initial_cash,
        config.strategy.buy_divisions,
        config.strategy.fear_multiplier
    );
    tracing::info!(
        "  Targets: half at {}x, full at {}x",
        config.strategy.sell_half_target,
        config.strategy.sell_full_target
    );
    tracing::info!("  Ledger: {}", config.ledger_path.display());

    let mut ledger = Ledger::load(&config.ledger_path)?;
    tracing::info!(
        "📒 Loaded {} lot(s), {} open",
        ledger.len(),
        ledger.open_lots().count()
    );

    let exchange = create_exchange_client(config)?;
    let market = MarketData::new(exchange.clone(), create_sentiment_client(config)?);
    let strategy = BuyTheDipStrategy::new(config.strategy.clone());
    let orchestrator = Orchestrator::new(&market, &exchange, strategy, config.exchange.pair.clone());

    let report = orchestrator.run_cycle(&mut ledger).await?;

    println!("{}", report);
    tracing::info!("👋 buydip finished");
    Ok(())
}

async fn status(config: &AppConfig) -> anyhow::Result<()> {
    let exchange = create_exchange_client(config)?;
    let sentiment = create_sentiment_client(config)?;

    let price = exchange.last_price(&config.exchange.pair).await?;
    println!("{}: ¥{}", config.exchange.pair, price);

    match sentiment.latest().await {
        Ok(reading) => println!(
            "Fear & Greed: {} ({}) at {}",
            reading.value,
            reading.classification,
            reading.timestamp.format("%Y-%m-%d %H:%M UTC")
        ),
        Err(e) => println!("Fear & Greed: unavailable ({:#})", e),
    }

    Ok(())
}

async fn balance(config: &AppConfig) -> anyhow::Result<()> {
    let exchange = create_exchange_client(config)?;
    let balances = exchange.get_all_balances().await?;

    let mut printed = 0;
    for (currency, amount) in balances.iter().filter(|(_, a)| !a.is_zero()) {
        println!("{:<20} {}", currency, amount);
        printed += 1;
    }
    if printed == 0 {
        println!("All balances are zero");
    }

    Ok(())
}

async fn positions(config: &AppConfig) -> anyhow::Result<()> {
    let ledger = Ledger::load(&config.ledger_path)?;
    if ledger.is_empty() {
        println!("No lots recorded in {}", config.ledger_path.display());
        return Ok(());
    }

    let exchange = create_exchange_client(config)?;
    let price = match exchange.last_price(&config.exchange.pair).await {
        Ok(price) => Some(price),
        Err(e) => {
            tracing::warn!("Price unavailable, ratios omitted: {:#}", e);
            None
        }
    };

    println!(
        "{:>4}  {:<19}  {:>14}  {:>12}  {:>12}  {:<9}  {:>7}",
        "id", "bought", "price", "amount", "remaining", "state", "ratio"
    );
    for lot in ledger.lots() {
        let state = match lot.state() {
            LotState::Open => "open",
            LotState::HalfSold => "half-sold",
            LotState::Closed => "closed",
        };
        let ratio = match price {
            Some(p) if lot.is_open() => format!("{:.3}x", lot.ratio(p)),
            _ => "-".to_string(),
        };
        println!(
            "{:>4}  {:<19}  {:>14}  {:>12}  {:>12}  {:<9}  {:>7}",
            lot.id,
            lot.buy_timestamp.format("%Y-%m-%d %H:%M:%S"),
            lot.buy_price,
            lot.amount,
            lot.remaining_amount,
            state,
            ratio
        );
    }

    let held: Decimal = ledger.open_lots().map(|lot| lot.remaining_amount).sum();
    println!("Open lots hold {} BTC", held);

    Ok(())
}
