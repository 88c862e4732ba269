// src/main.rs
use clap::Parser;
use dotenvy::dotenv;
use std::sync::Arc;
use the_carry::config::AppConfig;
use the_carry::connectors::hyperliquid::HyperliquidClient;
use the_carry::connectors::paper::{MidSource, PaperBroker};
use the_carry::core::engine::CarryEngine;
use the_carry::core::hedge::{ForceClose, HedgeExecutor};
use the_carry::strategies::funding_premium::FundingPremiumStrategy;
use the_carry::utils::logging;
use tracing::error;

/// Delta-neutral funding carry bot.
#[derive(Parser, Debug)]
#[command(name = "the_carry")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Send a reduce-only close for an open perp and exit (spot is left to the operator)
    #[arg(long)]
    force_close: bool,

    /// Coin for --force-close; defaults to the first open perp
    #[arg(long, requires = "force_close")]
    coin: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    // 1. Load Configuration
    let config = AppConfig::new()?;
    config.validate()?;

    let _log_guard = logging::init(&config.logging)?;

    println!("========================================");
    println!("       THE CARRY BOT - v{}", env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!("Coins:    {}", config.coins.join(", "));
    println!("Notional: ${}", config.execution.notional_usd);
    println!(
        "Mode:     {}",
        if cli.force_close {
            "🧯 FORCE CLOSE (perp only)"
        } else if config.execution.live {
            "🚨 LIVE EXECUTION (paper venue)"
        } else {
            "📝 DRY RUN (plan only)"
        }
    );
    println!("========================================");

    // 2. Initialize Components
    let client = Arc::new(HyperliquidClient::new(&config.network)?);
    let broker = Arc::new(PaperBroker::new(
        &config.paper,
        &config.execution.spot_quote,
        MidSource::Live(client.clone()),
    ));

    if cli.force_close {
        let exec = &config.execution;
        let executor = HedgeExecutor::new(
            broker,
            exec.notional_usd,
            &exec.spot_quote,
            exec.verify_tolerance,
            exec.dedup_bucket_ms,
            exec.live,
        );
        match executor.force_close(cli.coin.as_deref()).await? {
            ForceClose::NoPositions => println!("No open positions."),
            ForceClose::NotFound(coin) => anyhow::bail!("no open position for {}", coin),
            ForceClose::Sent {
                coin,
                size,
                verified,
                reason,
                remaining,
                ..
            } => {
                println!(
                    "{} reduce-only close sz={} verified={} ({}) remaining={:?}",
                    coin,
                    size,
                    verified,
                    reason,
                    remaining.map(|p| p.signed_size)
                );
                if !verified {
                    anyhow::bail!("force close on {} not verified: {}", coin, reason);
                }
            }
        }
        return Ok(());
    }

    let strategy = FundingPremiumStrategy::new(&config.strategy);

    // 3. Run Engine
    let mut engine = CarryEngine::new(config, client, broker, strategy);
    if let Err(e) = engine.run().await {
        error!("Fatal Engine Error: {}", e);
        eprintln!("Fatal Engine Error: {}", e);
    }

    Ok(())
}
