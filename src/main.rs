//! `trade-engine`: wires the real collaborators (SQLite `Store`, an
//! `ExchangeClient`, a `SignalSource`) and runs the `Scheduler` until
//! SIGINT/SIGTERM, per spec.md §5 ("single long-running binary").

use anyhow::{Context, Result};
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trade_engine_core::config::Config;
use trade_engine_core::core::{Clock, SystemClock};
use trade_engine_core::exchange::clob::ClobExchangeClient;
use trade_engine_core::exchange::paper::PaperExchangeClient;
use trade_engine_core::exchange::ExchangeClient;
use trade_engine_core::reconciler::Reconciler;
use trade_engine_core::scheduler::{DeterministicMarketResolver, Scheduler};
use trade_engine_core::signal::price_feed::BinancePriceFeed;
use trade_engine_core::signal::updown15m::{UpDown15mParams, UpDown15mSignalSource};
use trade_engine_core::signal::SignalSource;
use trade_engine_core::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::from_env().context("loading configuration")?);
    info!(symbols = ?config.symbols, min_edge = config.min_edge, "starting trade-engine");

    let store = Store::open(&config.database_path).context("opening trade store")?;
    store.migrate().await.context("running store migrations")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let exchange = build_exchange(&config, clock.clone()).await?;
    let signal_source = build_signal_source(&config).await?;
    let market_resolver = Arc::new(DeterministicMarketResolver::default());

    let reconciler = Reconciler::new(store.clone(), exchange.clone());
    let report = reconciler.reconcile().await.context("startup reconciliation")?;
    info!(
        resumable = report.resumable.len(),
        canceled_unfilled = report.canceled_unfilled,
        discrepancies = report.balance_discrepancies.len(),
        "startup reconciliation complete"
    );
    for msg in &report.balance_discrepancies {
        warn!("{msg}");
    }

    let scheduler = Arc::new(Scheduler::new(
        config,
        exchange,
        store,
        clock,
        signal_source,
        market_resolver,
        report.resumable,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let scheduler_handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run_until(shutdown_rx).await })
    };

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown signal received, draining scheduler");
    let _ = shutdown_tx.send(());
    let _ = scheduler_handle.await;

    Ok(())
}

/// Builds the live CLOB client when `POLY_*` credentials are present in the
/// environment, falling back to the deterministic paper exchange otherwise
/// (grounded in the teacher's `PaperExecutionAdapter` default-to-dry-run
/// behavior when no wallet is configured).
async fn build_exchange(config: &Config, clock: Arc<dyn Clock>) -> Result<Arc<dyn ExchangeClient>> {
    if let Some(client) = ClobExchangeClient::from_env(clock) {
        info!("POLY_* credentials found, trading against the live CLOB");
        return Ok(Arc::new(client));
    }
    warn!("no POLY_* credentials configured, falling back to the paper exchange");
    let starting_balance = config.max_size * dec!(100);
    Ok(Arc::new(PaperExchangeClient::new(starting_balance)))
}

/// Builds the bundled `UpDown15mSignalSource` over a live Binance feed, or a
/// disabled feed (always `Signal::neutral()`) when `ENABLE_PRICE_FEED` is
/// unset, so the binary can still run end-to-end without market data.
async fn build_signal_source(config: &Config) -> Result<Arc<dyn SignalSource>> {
    let enabled = std::env::var("ENABLE_PRICE_FEED")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let feed = if enabled {
        let symbols: Vec<&str> = config.symbols.iter().map(String::as_str).collect();
        BinancePriceFeed::spawn(&symbols)
            .await
            .context("starting Binance price feed")?
    } else {
        info!("ENABLE_PRICE_FEED not set, signal source will emit neutral signals");
        BinancePriceFeed::disabled()
    };

    Ok(Arc::new(UpDown15mSignalSource::new(
        feed,
        UpDown15mParams::default(),
    )))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trade_engine_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
