use clap::Parser;
use fundwatch::cli::{Cli, Commands};
use fundwatch::config::AppConfig;
use fundwatch::domain::Cadence;
use fundwatch::error::{FundwatchError, Result};
use fundwatch::services::{HealthServer, HealthState, HistorySyncService};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple, Runtime};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("config: {}", e);
        }
        return Err(FundwatchError::InvalidState(format!(
            "{} invalid configuration value(s)",
            errors.len()
        )));
    }

    match cli.command.unwrap_or(Commands::Run { symbols: Vec::new() }) {
        Commands::Run { symbols } => {
            init_logging(&config.logging);
            run(config, &symbols).await?;
        }
        Commands::Classify { symbols, refresh } => {
            init_logging_simple();
            let rt = Runtime::build(config).await?;
            let symbols = rt.resolve_symbols(&symbols).await;
            let classified = if refresh {
                rt.classifier.refresh(&symbols).await
            } else {
                rt.classifier.classify(&symbols).await
            };
            for (symbol, cadence) in &classified {
                println!("{:<16} {}", symbol, cadence);
            }
            let stats = rt.classifier.stats().await;
            for (cadence, count) in &stats.per_cadence {
                println!("{}: {}", cadence, count);
            }
        }
        Commands::Backfill { symbol } => {
            init_logging_simple();
            let rt = Runtime::build(config).await?;
            let written = rt.updater.backfill(&symbol.to_uppercase()).await?;
            println!("{}: {} records", symbol.to_uppercase(), written);
        }
        Commands::Verify { cadence, symbols } => {
            init_logging_simple();
            let rt = Runtime::build(config).await?;
            let symbols = rt.resolve_symbols(&symbols).await;
            verify(&rt, cadence, &symbols).await?;
        }
        Commands::Symbols { limit } => {
            init_logging_simple();
            let rt = Runtime::build(config).await?;
            let limit = limit.unwrap_or(rt.config.market.top_symbols_count);
            for (i, symbol) in rt.fetcher.top_symbols(limit).await?.iter().enumerate() {
                println!("{:>3}. {}", i + 1, symbol);
            }
        }
    }

    Ok(())
}

async fn run(config: AppConfig, symbols: &[String]) -> Result<()> {
    let rt = Runtime::build(config).await?;
    let symbols = rt.resolve_symbols(symbols).await;
    info!("Tracking {} instruments", symbols.len());

    let scheduler = rt.scheduler();
    scheduler.start(&symbols).await;

    let history = HistorySyncService::new(
        rt.updater.clone(),
        rt.config.history.clone(),
        Duration::from_secs(rt.config.scheduler.join_timeout_secs),
    );
    history.start(symbols.clone()).await;

    let health_task = rt.config.health_port.map(|port| {
        let fetcher = rt.fetcher.clone();
        let state = HealthState::new(scheduler.clone(), rt.classifier.clone())
            .with_history(history.clone())
            .with_blacklist(move || fetcher.blacklisted());
        let server = HealthServer::new(Arc::new(state), port);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Health server failed: {}", e);
            }
        })
    });

    shutdown_signal().await;
    info!("Shutdown signal received");

    scheduler.stop().await;
    history.stop().await;
    if let Some(task) = health_task {
        task.abort();
    }
    rt.alerts
        .info("scheduler", "Funding scheduler stopped", "Shutdown complete")
        .await;
    Ok(())
}

async fn verify(rt: &Runtime, cadence: Cadence, symbols: &[String]) -> Result<()> {
    let result = rt.verifier.verify_cadence(symbols, cadence).await?;
    println!(
        "{} freshness: {}/{} verified ({:.1}%)",
        cadence,
        result.verified_count(),
        result.total,
        result.success_rate * 100.0
    );
    for symbol in &result.stale {
        println!("  stale   {}", symbol);
    }
    for symbol in &result.missing {
        println!("  missing {}", symbol);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
