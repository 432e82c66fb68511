use std::sync::Arc;

use anyhow::{Context, Result};
use broker_trait::{OrderSink, PaperBroker};
use signal_loop::{LoopContext, PipelineConfig, StaticRunSource, TradingLoopService};
use signal_store::SqliteStore;

fn flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    // 2. Configuration
    let config = PipelineConfig::from_env()?;
    let account_id = std::env::var("ACCOUNT_ID").unwrap_or_else(|_| "paper".to_string());
    let execute_trades = flag("EXECUTE_TRADES", false);
    let optimize = flag("OPTIMIZE", true);
    tracing::info!("Configuration loaded and validated");
    tracing::info!("  Account: {}", account_id);
    tracing::info!("  Execution mode: {}", config.executor.mode);
    tracing::info!("  Strategies: {:?}", config.strategy_ids);
    tracing::info!(
        "  Min strength {:.0} | min confidence {:.0}% | max risk {:.0}",
        config.initial_parameters.thresholds.min_strength,
        config.initial_parameters.thresholds.min_confidence * 100.0,
        config.initial_parameters.risk.max_risk_score
    );

    // 3. Collaborators
    let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
    tracing::info!("Signal store ready ({})", config.database_url);

    let runs_path =
        std::env::var("STRATEGY_RUNS_PATH").unwrap_or_else(|_| "strategy_runs.json".to_string());
    let runs = StaticRunSource::from_json_file(&runs_path)
        .await
        .context("STRATEGY_RUNS_PATH must point to a JSON array of strategy runs")?;

    let equity: f64 = std::env::var("PAPER_EQUITY")
        .unwrap_or_else(|_| "100000".to_string())
        .parse()
        .context("invalid PAPER_EQUITY")?;
    let broker = Arc::new(PaperBroker::new(equity));
    tracing::info!(
        "Broker: {} (paper: {}), equity ${:.2}",
        broker.broker_name(),
        broker.is_paper(),
        equity
    );

    let ctx = LoopContext {
        signals: store.clone(),
        outcomes: store,
        positions: broker.clone(),
        broker,
        runs: Arc::new(runs),
    };
    let service = TradingLoopService::new(ctx, config);

    // 4. One cycle
    let result = service
        .run_cycle(&account_id, execute_trades, optimize)
        .await?;
    if result.is_degraded() {
        tracing::warn!("Cycle {} finished degraded", result.cycle_id);
    }
    service.status(&account_id).await.metrics.log_metrics();

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
