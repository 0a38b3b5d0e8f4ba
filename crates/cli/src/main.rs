use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};

use algotrade_brokers_common::{SimulatedBroker, SimulatedBrokerConfig};
use algotrade_brokers_metatrader::{MetaTraderBroker, MetaTraderConfig};
use algotrade_core::{EventBus, Side, Signal, SymbolInfo};
use algotrade_engine::{EngineConfig, SessionEnricher, TradingEngine};
use algotrade_risk::RiskLimits;

/// Topics the CLI mirrors into the log stream.
const TOPICS: &[&str] = &[
    "order.placed",
    "order.rejected",
    "order.failed",
    "position.opened",
    "position.closed",
    "system.engine_started",
    "system.engine_stopped",
];

#[derive(Parser)]
#[command(name = "algotrade")]
#[command(about = "Event-driven trading core: run against MetaTrader or on paper")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine live against a MetaTrader bridge
    Run {
        /// Path to the TOML configuration file
        #[arg(short, long, default_value = "algotrade.toml")]
        config: PathBuf,
    },

    /// Run the engine against the simulated broker and push a few signals
    Paper {
        /// Symbol to trade
        #[arg(short, long, default_value = "EURUSD")]
        symbol: String,

        /// Volume per signal, in lots
        #[arg(short, long, default_value = "0.1")]
        volume: f64,

        /// Number of signals to submit
        #[arg(short = 'n', long, default_value = "4")]
        signals: usize,
    },

    /// Write a default configuration file
    InitConfig {
        /// Output path
        #[arg(short, long, default_value = "algotrade.toml")]
        out: PathBuf,
    },
}

/// Full application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    engine: EngineConfig,
    risk: RiskLimits,
    metatrader: MetaTraderConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    fmt().with_env_filter(filter).with_target(false).init();

    match cli.command {
        Commands::Run { config } => run_live(config).await,
        Commands::Paper {
            symbol,
            volume,
            signals,
        } => run_paper(symbol, volume, signals).await,
        Commands::InitConfig { out } => init_config(out),
    }
}

async fn run_live(config_path: PathBuf) -> Result<()> {
    let raw = std::fs::read_to_string(&config_path)
        .with_context(|| format!("reading {}", config_path.display()))?;
    let config: AppConfig =
        toml::from_str(&raw).with_context(|| format!("parsing {}", config_path.display()))?;

    let broker = Arc::new(MetaTraderBroker::new(config.metatrader.clone()));
    let engine = TradingEngine::new(broker, config.risk.clone(), config.engine.clone())
        .with_enricher(Arc::new(SessionEnricher));
    mirror_events(&engine.bus());

    engine.start().await?;
    tracing::info!("engine running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;

    engine.stop().await;
    print_summary(&engine);
    Ok(())
}

async fn run_paper(symbol: String, volume: f64, signals: usize) -> Result<()> {
    let volume = Decimal::try_from(volume).unwrap_or(Decimal::new(1, 1));

    let broker = Arc::new(SimulatedBroker::new(SimulatedBrokerConfig::default()));
    broker.add_symbol(SymbolInfo {
        name: symbol.clone(),
        min_lot: Decimal::new(1, 2),
        max_lot: Decimal::from(100),
        lot_step: Decimal::new(1, 2),
        contract_size: Decimal::from(100_000),
        digits: 5,
    });
    broker.set_tick(&symbol, Decimal::new(11000, 4), Decimal::new(11002, 4));

    let engine = TradingEngine::new(
        broker,
        RiskLimits::default(),
        EngineConfig {
            close_positions_on_stop: true,
            ..EngineConfig::default()
        },
    )
    .with_enricher(Arc::new(SessionEnricher));
    mirror_events(&engine.bus());

    engine.start().await?;
    for i in 0..signals {
        let side = if i % 2 == 0 { Side::Buy } else { Side::Sell };
        let mut signal = Signal::new(&symbol, side, "paper");
        signal.volume = Some(volume);
        match engine.submit_signal(signal).await {
            Ok(order) => tracing::info!(
                ticket = order.ticket.unwrap_or_default(),
                side = ?order.side,
                "paper order executed"
            ),
            Err(err) => tracing::warn!(%err, "paper signal did not execute"),
        }
    }
    engine.positions().sync_positions().await?;
    engine.risk().update_risk_metrics().await;

    engine.stop().await;
    print_summary(&engine);
    Ok(())
}

fn init_config(out: PathBuf) -> Result<()> {
    let rendered =
        toml::to_string_pretty(&AppConfig::default()).context("serializing default config")?;
    std::fs::write(&out, rendered).with_context(|| format!("writing {}", out.display()))?;
    println!("Wrote default configuration to {}", out.display());
    Ok(())
}

/// Mirror every core event into the log stream, the way an API layer would
/// consume them.
fn mirror_events(bus: &Arc<EventBus>) {
    for topic in TOPICS {
        bus.subscribe(topic, |event| {
            Box::pin(async move {
                let payload = serde_json::to_string(&event.payload).unwrap_or_default();
                tracing::info!(
                    topic = event.topic(),
                    source = %event.source,
                    %payload,
                    "event"
                );
                Ok(())
            })
        });
    }
}

fn print_summary(engine: &TradingEngine) {
    let orders = engine.orders().orders();
    let executed = orders
        .iter()
        .filter(|o| o.status == algotrade_core::OrderStatus::Executed)
        .count();
    let risk = engine.risk().snapshot();

    let sep = "=".repeat(52);
    println!("\n{sep}");
    println!("  SESSION SUMMARY");
    println!("{sep}");
    println!("  Orders:          {} ({} executed)", orders.len(), executed);
    println!("  Open positions:  {}", engine.positions().open_count());
    println!(
        "  Closed records:  {}",
        engine.positions().closed_positions().len()
    );
    println!("  Daily loss:      {}", risk.daily_loss);
    println!("  Exposure:        {}", risk.exposure);
    println!("{sep}\n");
}
