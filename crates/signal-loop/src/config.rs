use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use signal_core::{ActiveParameters, SignalError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// Simulated fill at the suggested price, no broker contact
    DryRun,
    Live,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DryRun => f.write_str("DRY_RUN"),
            Self::Live => f.write_str("LIVE"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "DRY_RUN" | "DRYRUN" | "PAPER" => Ok(Self::DryRun),
            "LIVE" => Ok(Self::Live),
            other => Err(SignalError::InvalidInput(format!(
                "unknown execution mode '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub signal_ttl_minutes: i64,
    pub default_stop_loss_pct: f64,   // 5%
    pub default_take_profit_pct: f64, // 10%
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            signal_ttl_minutes: 240,
            default_stop_loss_pct: 0.05,
            default_take_profit_pct: 0.10,
        }
    }
}

impl EngineConfig {
    pub fn signal_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.signal_ttl_minutes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub mode: ExecutionMode,
    pub max_orders_per_batch: usize,
    pub broker_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::DryRun,
            max_orders_per_batch: 10,
            broker_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    pub window_days: i64,
    /// Confidence at or above which a loss counts as overconfident
    pub overconfidence_threshold: f64,
    /// Risk score above which a loss counts as a high-risk failure
    pub high_risk_threshold: f64,
    /// Slippage above which an execution counts as an execution issue
    pub slippage_threshold: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            window_days: 30,
            overconfidence_threshold: 0.75,
            high_risk_threshold: 70.0,
            slippage_threshold: 0.005,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Fewer evaluated signals than this and no sub-proposal acts
    pub min_sample: usize,
    pub target_win_rate: f64,
    pub win_rate_tolerance: f64,
    /// Below this many signals generated in the window, volume counts as low
    pub low_volume_threshold: usize,
    pub strength_step: f64,
    pub confidence_step: f64,

    pub min_strategy_sample: usize,
    pub weight_step: f64,
    pub min_weight: f64,
    pub max_weight: f64,

    pub drawdown_threshold: f64,
    pub clean_streak_threshold: usize,
    pub risk_score_step: f64,
    pub min_risk_score: f64,
    pub max_risk_score: f64,
    pub tighten_factor: f64,
    pub loosen_factor: f64,

    pub max_fraction_per_symbol: f64,
    pub kelly_multiplier: f64,
    pub min_fraction: f64,

    pub auto_apply: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            min_sample: 10,
            target_win_rate: 0.55,
            win_rate_tolerance: 0.05,
            low_volume_threshold: 20,
            strength_step: 5.0,
            confidence_step: 0.05,
            min_strategy_sample: 5,
            weight_step: 0.1,
            min_weight: 0.5,
            max_weight: 2.0,
            drawdown_threshold: 0.10,
            clean_streak_threshold: 10,
            risk_score_step: 5.0,
            min_risk_score: 30.0,
            max_risk_score: 90.0,
            tighten_factor: 0.8,
            loosen_factor: 1.1,
            max_fraction_per_symbol: 0.10,
            kelly_multiplier: 0.5,
            min_fraction: 0.005,
            auto_apply: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub engine: EngineConfig,
    pub executor: ExecutorConfig,
    pub analyzer: AnalyzerConfig,
    pub optimizer: OptimizerConfig,

    /// Parameters used until the optimizer has persisted some for an account
    pub initial_parameters: ActiveParameters,

    /// Strategies whose latest run feeds each cycle
    pub strategy_ids: Vec<String>,

    pub metrics_log_interval_cycles: u64,

    pub database_url: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            executor: ExecutorConfig::default(),
            analyzer: AnalyzerConfig::default(),
            optimizer: OptimizerConfig::default(),
            initial_parameters: ActiveParameters::default(),
            strategy_ids: Vec::new(),
            metrics_log_interval_cycles: 10,
            database_url: "sqlite:signals.db".to_string(),
        }
    }
}

fn var<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .with_context(|| format!("invalid value for {key}"))
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = ActiveParameters::default();
        let mut initial_parameters = defaults.clone();
        initial_parameters.risk.max_risk_score =
            var("MAX_RISK_SCORE", &defaults.risk.max_risk_score.to_string())?;
        initial_parameters.thresholds.min_confidence =
            var("MIN_CONFIDENCE", &defaults.thresholds.min_confidence.to_string())?;
        initial_parameters.thresholds.min_strength =
            var("MIN_STRENGTH", &defaults.thresholds.min_strength.to_string())?;
        initial_parameters.position_fraction =
            var("POSITION_FRACTION", &defaults.position_fraction.to_string())?;
        initial_parameters.risk.max_position_fraction = var(
            "MAX_POSITION_FRACTION",
            &defaults.risk.max_position_fraction.to_string(),
        )?;

        let config = Self {
            engine: EngineConfig {
                signal_ttl_minutes: var("SIGNAL_TTL_MINUTES", "240")?,
                default_stop_loss_pct: var("DEFAULT_STOP_LOSS_PCT", "0.05")?,
                default_take_profit_pct: var("DEFAULT_TAKE_PROFIT_PCT", "0.10")?,
            },
            executor: ExecutorConfig {
                mode: var("EXECUTION_MODE", "DRY_RUN")?,
                max_orders_per_batch: var("MAX_ORDERS_PER_BATCH", "10")?,
                broker_timeout: Duration::from_secs(var("BROKER_TIMEOUT_SECS", "30")?),
            },
            analyzer: AnalyzerConfig {
                window_days: var("EVALUATION_WINDOW_DAYS", "30")?,
                overconfidence_threshold: var("OVERCONFIDENCE_THRESHOLD", "0.75")?,
                high_risk_threshold: var("HIGH_RISK_THRESHOLD", "70")?,
                slippage_threshold: var("SLIPPAGE_THRESHOLD", "0.005")?,
            },
            optimizer: OptimizerConfig {
                min_sample: var("OPTIMIZER_MIN_SAMPLE", "10")?,
                target_win_rate: var("OPTIMIZER_TARGET_WIN_RATE", "0.55")?,
                max_fraction_per_symbol: var("MAX_FRACTION_PER_SYMBOL", "0.10")?,
                kelly_multiplier: var("KELLY_MULTIPLIER", "0.5")?,
                auto_apply: var("OPTIMIZER_AUTO_APPLY", "false")?,
                ..OptimizerConfig::default()
            },
            initial_parameters,
            strategy_ids: env::var("STRATEGY_IDS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            metrics_log_interval_cycles: var("METRICS_LOG_INTERVAL_CYCLES", "10")?,
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:signals.db".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would break invariants downstream.
    pub fn validate(&self) -> Result<()> {
        if self.engine.signal_ttl_minutes <= 0 {
            bail!("SIGNAL_TTL_MINUTES must be positive");
        }
        if !(0.0..1.0).contains(&self.engine.default_stop_loss_pct) {
            bail!("DEFAULT_STOP_LOSS_PCT must be in [0, 1)");
        }
        if self.engine.default_take_profit_pct < 0.0 {
            bail!("DEFAULT_TAKE_PROFIT_PCT must not be negative");
        }
        if self.executor.max_orders_per_batch == 0 {
            bail!("MAX_ORDERS_PER_BATCH must be at least 1");
        }
        if self.executor.broker_timeout.is_zero() {
            bail!("BROKER_TIMEOUT_SECS must be positive");
        }
        if self.analyzer.window_days <= 0 {
            bail!("EVALUATION_WINDOW_DAYS must be positive");
        }

        let opt = &self.optimizer;
        if opt.min_sample == 0 {
            bail!("OPTIMIZER_MIN_SAMPLE must be at least 1");
        }
        if !(0.0..=1.0).contains(&opt.target_win_rate) {
            bail!("OPTIMIZER_TARGET_WIN_RATE must be in [0, 1]");
        }
        if opt.max_fraction_per_symbol <= 0.0 || opt.max_fraction_per_symbol > 1.0 {
            bail!("MAX_FRACTION_PER_SYMBOL must be in (0, 1]");
        }
        if opt.kelly_multiplier <= 0.0 || opt.kelly_multiplier > 1.0 {
            bail!("KELLY_MULTIPLIER must be in (0, 1]");
        }
        if opt.min_fraction < 0.0 || opt.min_fraction > opt.max_fraction_per_symbol {
            bail!("min fraction must not exceed MAX_FRACTION_PER_SYMBOL");
        }
        if opt.min_weight <= 0.0 || opt.min_weight > opt.max_weight {
            bail!("strategy weight bounds are inconsistent");
        }
        if opt.min_risk_score > opt.max_risk_score {
            bail!("risk score bounds are inconsistent");
        }

        let params = &self.initial_parameters;
        if !(0.0..=100.0).contains(&params.risk.max_risk_score) {
            bail!("MAX_RISK_SCORE must be in [0, 100]");
        }
        if !(0.0..=1.0).contains(&params.thresholds.min_confidence) {
            bail!("MIN_CONFIDENCE must be in [0, 1]");
        }
        if !(0.0..=100.0).contains(&params.thresholds.min_strength) {
            bail!("MIN_STRENGTH must be in [0, 100]");
        }
        if params.position_fraction <= 0.0 || params.position_fraction > 1.0 {
            bail!("POSITION_FRACTION must be in (0, 1]");
        }
        if params.risk.max_position_fraction > opt.max_fraction_per_symbol {
            bail!("MAX_POSITION_FRACTION must not exceed MAX_FRACTION_PER_SYMBOL");
        }
        Ok(())
    }
}
