use std::sync::Arc;
use std::time::Instant;

use broker_trait::{OrderSink, PositionSource};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use signal_core::{
    ActiveParameters, OptimizationProposal, OutcomeStore, SignalError, SignalStatus, SignalStore,
    StrategyRunSource, TradingSignal,
};
use tokio::sync::Mutex;

use crate::adaptive_optimizer::AdaptiveOptimizer;
use crate::config::PipelineConfig;
use crate::metrics::LoopMetrics;
use crate::order_executor::{ExecutionResult, ExecutionStatus, OrderExecutor};
use crate::performance_analyzer::{PerformanceAnalyzer, PerformanceReport};
use crate::position_filter::{FilterStats, PositionFilter, PositionSnapshot};
use crate::signal_engine::{GenerationCounts, SignalEngine};

/// Collaborators a cycle runs against, injected once at construction.
#[derive(Clone)]
pub struct LoopContext {
    pub signals: Arc<dyn SignalStore>,
    pub outcomes: Arc<dyn OutcomeStore>,
    pub positions: Arc<dyn PositionSource>,
    pub broker: Arc<dyn OrderSink>,
    pub runs: Arc<dyn StrategyRunSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Completed,
    /// Ran on partial data; see warnings
    Degraded,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport<T> {
    pub status: PhaseStatus,
    pub counts: T,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl<T: Default> PhaseReport<T> {
    fn completed(counts: T) -> Self {
        Self {
            status: PhaseStatus::Completed,
            counts,
            warnings: Vec::new(),
            error: None,
            duration_ms: 0,
        }
    }

    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: PhaseStatus::Skipped,
            warnings: vec![reason.into()],
            ..Self::completed(T::default())
        }
    }

    fn degraded(warning: impl Into<String>) -> Self {
        Self {
            status: PhaseStatus::Degraded,
            warnings: vec![warning.into()],
            ..Self::completed(T::default())
        }
    }

    fn failed(error: impl ToString) -> Self {
        Self {
            status: PhaseStatus::Failed,
            error: Some(error.to_string()),
            ..Self::completed(T::default())
        }
    }

    /// Completed, Degraded when anything was reported, Failed when nothing succeeded.
    fn settle(counts: T, warnings: Vec<String>, errors: Vec<String>, any_ok: bool) -> Self {
        let status = if !errors.is_empty() && !any_ok {
            PhaseStatus::Failed
        } else if !errors.is_empty() || !warnings.is_empty() {
            PhaseStatus::Degraded
        } else {
            PhaseStatus::Completed
        };
        Self {
            status,
            counts,
            warnings,
            error: (!errors.is_empty()).then(|| errors.join("; ")),
            duration_ms: 0,
        }
    }

    fn timed(mut self, start: Instant) -> Self {
        self.duration_ms = LoopMetrics::elapsed_ms(start);
        self
    }

    pub fn is_clean(&self) -> bool {
        matches!(self.status, PhaseStatus::Completed | PhaseStatus::Skipped)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepCounts {
    pub expired: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionCounts {
    pub executed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub deferred: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EvaluationCounts {
    pub evaluated: usize,
    pub winners: usize,
    pub win_rate: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OptimizationCounts {
    pub adjustments: usize,
    pub declined: usize,
    pub applied: bool,
}

/// Phase-by-phase record of one cycle. Later phase failures never discard earlier results.
#[derive(Debug, Clone, Serialize)]
pub struct CycleResult {
    pub cycle_id: String,
    pub account_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub execute_trades: bool,
    pub optimize: bool,
    pub sweep: PhaseReport<SweepCounts>,
    pub generation: PhaseReport<GenerationCounts>,
    pub filter: PhaseReport<FilterStats>,
    pub execution: PhaseReport<ExecutionCounts>,
    pub evaluation: PhaseReport<EvaluationCounts>,
    pub optimization: PhaseReport<OptimizationCounts>,
    pub new_signal_ids: Vec<String>,
    pub executions: Vec<ExecutionResult>,
    pub report: Option<PerformanceReport>,
    pub proposal: Option<OptimizationProposal>,
}

impl CycleResult {
    pub fn is_degraded(&self) -> bool {
        !(self.sweep.is_clean()
            && self.generation.is_clean()
            && self.filter.is_clean()
            && self.execution.is_clean()
            && self.evaluation.is_clean()
            && self.optimization.is_clean())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub account_id: String,
    pub cycle_running: bool,
    pub running_since: Option<DateTime<Utc>>,
    pub last_cycle: Option<CycleResult>,
    pub metrics: LoopMetrics,
}

/// Held for the duration of a cycle; releases the account on drop.
pub struct CycleGuard {
    running: Arc<DashMap<String, DateTime<Utc>>>,
    account_id: String,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.running.remove(&self.account_id);
    }
}

/// Sequences generate -> filter -> execute -> evaluate -> optimize for one account.
pub struct LoopCoordinator {
    ctx: LoopContext,
    config: PipelineConfig,
    engine: SignalEngine,
    filter: PositionFilter,
    executor: OrderExecutor,
    analyzer: PerformanceAnalyzer,
    optimizer: AdaptiveOptimizer,
    running: Arc<DashMap<String, DateTime<Utc>>>,
    last_cycles: DashMap<String, CycleResult>,
    metrics: Mutex<LoopMetrics>,
}

impl LoopCoordinator {
    pub fn new(ctx: LoopContext, config: PipelineConfig) -> Self {
        let engine = SignalEngine::new(ctx.signals.clone(), config.engine.clone());
        let filter = PositionFilter::new(ctx.signals.clone());
        let executor = OrderExecutor::new(
            ctx.signals.clone(),
            ctx.positions.clone(),
            ctx.broker.clone(),
            config.executor.clone(),
        );
        let analyzer = PerformanceAnalyzer::new(
            ctx.signals.clone(),
            ctx.outcomes.clone(),
            config.analyzer.clone(),
        );
        let optimizer = AdaptiveOptimizer::new(config.optimizer.clone());
        let metrics = Mutex::new(LoopMetrics::new(config.metrics_log_interval_cycles));

        Self {
            ctx,
            config,
            engine,
            filter,
            executor,
            analyzer,
            optimizer,
            running: Arc::new(DashMap::new()),
            last_cycles: DashMap::new(),
            metrics,
        }
    }

    pub fn context(&self) -> &LoopContext {
        &self.ctx
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn engine(&self) -> &SignalEngine {
        &self.engine
    }

    pub fn filter(&self) -> &PositionFilter {
        &self.filter
    }

    pub fn executor(&self) -> &OrderExecutor {
        &self.executor
    }

    pub fn analyzer(&self) -> &PerformanceAnalyzer {
        &self.analyzer
    }

    pub fn optimizer(&self) -> &AdaptiveOptimizer {
        &self.optimizer
    }

    /// Reject, rather than queue, a second cycle for the same account.
    pub fn lock_account(&self, account_id: &str) -> Result<CycleGuard, SignalError> {
        match self.running.entry(account_id.to_string()) {
            Entry::Occupied(_) => Err(SignalError::CycleInProgress(account_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                Ok(CycleGuard {
                    running: self.running.clone(),
                    account_id: account_id.to_string(),
                })
            }
        }
    }

    /// Stored parameters for the account, or the configured starting set.
    pub async fn active_parameters(&self, account_id: &str) -> Result<ActiveParameters, SignalError> {
        Ok(self
            .ctx
            .outcomes
            .load_parameters(account_id)
            .await
            .map_err(SignalError::storage)?
            .unwrap_or_else(|| self.config.initial_parameters.clone()))
    }

    /// Apply an advisory proposal to the account's current parameters and persist both.
    pub async fn apply_proposal(
        &self,
        proposal: &mut OptimizationProposal,
    ) -> Result<ActiveParameters, SignalError> {
        if proposal.applied {
            return Err(SignalError::InvalidInput(format!(
                "proposal {} was already applied",
                proposal.id
            )));
        }
        let current = self.active_parameters(&proposal.account_id).await?;
        let now = Utc::now();
        let updated = self.optimizer.apply(proposal, &current, now)?;

        self.ctx
            .outcomes
            .save_parameters(&proposal.account_id, &updated)
            .await
            .map_err(SignalError::storage)?;
        proposal.applied = true;
        proposal.applied_at = Some(now);
        self.ctx
            .outcomes
            .save_proposal(proposal)
            .await
            .map_err(SignalError::storage)?;

        tracing::info!(
            account_id = %proposal.account_id,
            proposal_id = %proposal.id,
            adjustments = proposal.adjustments.len(),
            "Optimization proposal applied"
        );
        Ok(updated)
    }

    /// Eager expiry across all accounts. Returns the expired ids.
    pub async fn sweep_expired(&self) -> Result<Vec<String>, SignalError> {
        let expired = self
            .ctx
            .signals
            .expire_due(Utc::now())
            .await
            .map_err(SignalError::storage)?;
        if !expired.is_empty() {
            tracing::info!("Expired {} stale signals", expired.len());
        }
        Ok(expired)
    }

    /// One full cycle. Errors only for a missing account id or a cycle already running;
    /// everything else is recorded on the phase it happened in.
    pub async fn run_cycle(
        &self,
        account_id: &str,
        execute_trades: bool,
        optimize: bool,
    ) -> Result<CycleResult, SignalError> {
        let account_id = account_id.trim();
        if account_id.is_empty() {
            return Err(SignalError::InvalidInput("account id is required".to_string()));
        }
        let _guard = self.lock_account(account_id)?;

        let cycle_start = LoopMetrics::start_timer();
        let started_at = Utc::now();
        let cycle_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(account_id, %cycle_id, execute_trades, optimize, "Starting loop cycle");

        let sweep = self.sweep_phase().await;

        let mut param_warnings = Vec::new();
        let params = match self.active_parameters(account_id).await {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!("Active parameters unavailable for {}: {}", account_id, e);
                param_warnings.push(format!("parameters unavailable, using defaults: {e}"));
                self.config.initial_parameters.clone()
            }
        };

        let snapshot = match self.ctx.positions.get_positions(account_id).await {
            Ok(positions) => Ok(PositionSnapshot::new(positions)),
            Err(e) => {
                tracing::warn!("Position snapshot unavailable for {}: {}", account_id, e);
                Err(e.to_string())
            }
        };

        let (mut generation, new_signal_ids) =
            self.generation_phase(account_id, &snapshot, &params).await;
        if !param_warnings.is_empty() {
            generation.warnings.extend(param_warnings);
            if generation.status == PhaseStatus::Completed {
                generation.status = PhaseStatus::Degraded;
            }
        }

        let (filter, passed) = self.filter_phase(account_id, &snapshot).await;
        let (execution, executions) = self.execution_phase(execute_trades, passed).await;
        let (evaluation, report) = self.evaluation_phase(account_id).await;
        let (optimization, proposal) = self
            .optimization_phase(optimize, report.as_ref(), &params)
            .await;

        let result = CycleResult {
            cycle_id,
            account_id: account_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            execute_trades,
            optimize,
            sweep,
            generation,
            filter,
            execution,
            evaluation,
            optimization,
            new_signal_ids,
            executions,
            report,
            proposal,
        };

        {
            let mut metrics = self.metrics.lock().await;
            metrics.record_expired(result.sweep.counts.expired);
            metrics.record_generation(
                result.generation.counts.generated,
                result.generation.counts.rejected,
                result.generation.duration_ms,
            );
            metrics.record_filter(
                result.filter.counts.filtered_out,
                result.filter.counts.adjusted,
                result.filter.duration_ms,
            );
            metrics.record_execution(
                result.execution.counts.executed,
                result.execution.counts.failed,
                result.execution.duration_ms,
            );
            metrics.record_evaluation(
                result.evaluation.counts.win_rate,
                result.evaluation.counts.evaluated,
                result.evaluation.duration_ms,
            );
            if result.proposal.is_some() {
                metrics.record_proposal();
            }
            metrics.finish_cycle(cycle_start, result.is_degraded());
        }

        tracing::info!(
            account_id,
            cycle_id = %result.cycle_id,
            generated = result.generation.counts.generated,
            passed = result.filter.counts.passed,
            executed = result.execution.counts.executed,
            failed = result.execution.counts.failed,
            evaluated = result.evaluation.counts.evaluated,
            degraded = result.is_degraded(),
            "Loop cycle complete"
        );

        self.last_cycles
            .insert(account_id.to_string(), result.clone());
        Ok(result)
    }

    async fn sweep_phase(&self) -> PhaseReport<SweepCounts> {
        let start = Instant::now();
        let report = match self.sweep_expired().await {
            Ok(expired) => PhaseReport::completed(SweepCounts {
                expired: expired.len(),
            }),
            Err(e) => PhaseReport::failed(e),
        };
        report.timed(start)
    }

    async fn generation_phase(
        &self,
        account_id: &str,
        snapshot: &Result<PositionSnapshot, String>,
        params: &ActiveParameters,
    ) -> (PhaseReport<GenerationCounts>, Vec<String>) {
        let start = Instant::now();
        if self.config.strategy_ids.is_empty() {
            return (
                PhaseReport::skipped("no strategies configured").timed(start),
                Vec::new(),
            );
        }
        // Type inference needs holdings; without them EXIT would be misread as ENTRY.
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let warning = format!("position snapshot unavailable: {e}");
                return (PhaseReport::degraded(warning).timed(start), Vec::new());
            }
        };

        let mut warnings = Vec::new();
        let equity = match self.ctx.positions.account_equity(account_id).await {
            Ok(equity) => equity,
            Err(e) => {
                warnings.push(format!("account equity unavailable, using minimum size: {e}"));
                0.0
            }
        };

        let mut counts = GenerationCounts::default();
        let mut errors = Vec::new();
        let mut ids = Vec::new();
        let mut any_ok = false;

        for strategy_id in &self.config.strategy_ids {
            let run = match self.ctx.runs.get_latest_run(strategy_id).await {
                Ok(Some(run)) => run,
                Ok(None) => {
                    warnings.push(format!("no completed run for strategy {strategy_id}"));
                    continue;
                }
                Err(e) => {
                    warnings.push(format!("run for strategy {strategy_id} unavailable: {e}"));
                    continue;
                }
            };
            match self
                .engine
                .generate(account_id, &run, snapshot, equity, params)
                .await
            {
                Ok(outcome) => {
                    any_ok = true;
                    counts.merge(&outcome.counts);
                    ids.extend(outcome.signals.iter().map(|s| s.id.clone()));
                }
                Err(e) => {
                    tracing::error!("Signal generation failed for {}: {}", strategy_id, e);
                    errors.push(format!("{strategy_id}: {e}"));
                }
            }
        }

        (
            PhaseReport::settle(counts, warnings, errors, any_ok).timed(start),
            ids,
        )
    }

    async fn filter_phase(
        &self,
        account_id: &str,
        snapshot: &Result<PositionSnapshot, String>,
    ) -> (PhaseReport<FilterStats>, Vec<TradingSignal>) {
        let start = Instant::now();
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let warning = format!("position snapshot unavailable: {e}");
                return (PhaseReport::degraded(warning).timed(start), Vec::new());
            }
        };

        let pending = match self
            .ctx
            .signals
            .list_signals(account_id, &SignalStatus::PENDING)
            .await
        {
            Ok(pending) => pending,
            Err(e) => return (PhaseReport::failed(e).timed(start), Vec::new()),
        };

        match self.filter.filter(pending, snapshot).await {
            Ok(outcome) => (
                PhaseReport::completed(outcome.stats).timed(start),
                outcome.passed,
            ),
            Err(e) => (PhaseReport::failed(e).timed(start), Vec::new()),
        }
    }

    async fn execution_phase(
        &self,
        execute_trades: bool,
        passed: Vec<TradingSignal>,
    ) -> (PhaseReport<ExecutionCounts>, Vec<ExecutionResult>) {
        let start = Instant::now();
        if !execute_trades {
            return (
                PhaseReport::skipped("signal-only mode").timed(start),
                Vec::new(),
            );
        }

        let batch = self
            .executor
            .execute_batch(
                passed,
                self.config.executor.mode,
                self.config.executor.max_orders_per_batch,
            )
            .await;

        let counts = ExecutionCounts {
            executed: batch.executed_count,
            failed: batch.failed_count,
            skipped: batch.skipped_count,
            deferred: batch.deferred_count,
        };
        let warnings = batch
            .results
            .iter()
            .filter(|r| r.status == ExecutionStatus::Failed)
            .map(|r| {
                format!(
                    "{} ({}): {}",
                    r.symbol,
                    r.signal_id,
                    r.error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect();

        (
            PhaseReport::settle(counts, warnings, Vec::new(), true).timed(start),
            batch.results,
        )
    }

    async fn evaluation_phase(
        &self,
        account_id: &str,
    ) -> (PhaseReport<EvaluationCounts>, Option<PerformanceReport>) {
        let start = Instant::now();
        match self
            .analyzer
            .evaluate_window(account_id, self.config.analyzer.window_days)
            .await
        {
            Ok(report) => {
                let counts = EvaluationCounts {
                    evaluated: report.total_evaluated,
                    winners: report.winners,
                    win_rate: report.win_rate,
                };
                (PhaseReport::completed(counts).timed(start), Some(report))
            }
            Err(e) => {
                tracing::error!("Performance evaluation failed for {}: {}", account_id, e);
                (PhaseReport::failed(e).timed(start), None)
            }
        }
    }

    async fn optimization_phase(
        &self,
        optimize: bool,
        report: Option<&PerformanceReport>,
        params: &ActiveParameters,
    ) -> (PhaseReport<OptimizationCounts>, Option<OptimizationProposal>) {
        let start = Instant::now();
        if !optimize {
            return (
                PhaseReport::skipped("optimization not requested").timed(start),
                None,
            );
        }
        let Some(report) = report else {
            return (
                PhaseReport::skipped("no performance report this cycle").timed(start),
                None,
            );
        };

        let mut proposal = self.optimizer.propose(report, params, Utc::now());
        let mut counts = OptimizationCounts {
            adjustments: proposal.adjustments.len(),
            declined: proposal.declined.len(),
            applied: false,
        };
        let mut errors = Vec::new();

        if self.config.optimizer.auto_apply && proposal.has_changes() {
            match self.apply_proposal(&mut proposal).await {
                Ok(_) => counts.applied = true,
                Err(e) => errors.push(format!("auto-apply failed: {e}")),
            }
        }
        if !counts.applied {
            if let Err(e) = self.ctx.outcomes.save_proposal(&proposal).await {
                errors.push(format!("saving proposal failed: {e}"));
            }
        }

        (
            PhaseReport::settle(counts, Vec::new(), errors, true).timed(start),
            Some(proposal),
        )
    }

    pub async fn status(&self, account_id: &str) -> LoopStatus {
        LoopStatus {
            account_id: account_id.to_string(),
            cycle_running: self.running.contains_key(account_id),
            running_since: self.running.get(account_id).map(|since| *since),
            last_cycle: self.last_cycles.get(account_id).map(|r| r.clone()),
            metrics: self.metrics.lock().await.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionMode, OptimizerConfig};
    use crate::performance_analyzer::tests::twelve_with_seven_winners;
    use crate::run_source::StaticRunSource;
    use broker_trait::PaperBroker;
    use signal_core::{Candidate, StrategyRun, MIN_STRENGTH};
    use signal_store::MemoryStore;
    use std::time::Duration;

    struct Harness {
        store: Arc<MemoryStore>,
        broker: Arc<PaperBroker>,
        coordinator: LoopCoordinator,
    }

    fn momentum_run() -> StrategyRun {
        StrategyRun {
            run_id: "run-1".to_string(),
            strategy_id: "momentum".to_string(),
            finished_at: Utc::now(),
            candidates: vec![Candidate::new("XYZ", "long", 80.0, 0.7).with_price(100.0)],
        }
    }

    fn config(strategy_ids: &[&str]) -> PipelineConfig {
        PipelineConfig {
            strategy_ids: strategy_ids.iter().map(|s| s.to_string()).collect(),
            metrics_log_interval_cycles: 0,
            ..PipelineConfig::default()
        }
    }

    fn harness(broker: PaperBroker, config: PipelineConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(broker);
        let ctx = LoopContext {
            signals: store.clone(),
            outcomes: store.clone(),
            positions: broker.clone(),
            broker: broker.clone(),
            runs: Arc::new(StaticRunSource::new(vec![momentum_run()])),
        };
        Harness {
            store,
            broker,
            coordinator: LoopCoordinator::new(ctx, config),
        }
    }

    #[tokio::test]
    async fn test_full_cycle_dry_run() {
        let h = harness(PaperBroker::new(100_000.0), config(&["momentum"]));
        let result = h.coordinator.run_cycle("acct-1", true, true).await.unwrap();

        assert_eq!(result.generation.counts.generated, 1);
        assert_eq!(result.filter.counts.passed, 1);
        assert_eq!(result.execution.counts.executed, 1);
        assert_eq!(result.executions[0].slippage, Some(0.0));
        assert_eq!(result.evaluation.status, PhaseStatus::Completed);
        assert!(!result.is_degraded());

        // Nothing evaluated yet: the optimizer declines every area
        let proposal = result.proposal.unwrap();
        assert!(!proposal.has_changes());
        assert_eq!(proposal.declined.len(), 4);
        let stored = h.store.latest_proposal("acct-1").await.unwrap().unwrap();
        assert_eq!(stored.id, proposal.id);

        let executed = h
            .store
            .list_signals("acct-1", &[SignalStatus::Executed])
            .await
            .unwrap();
        assert_eq!(executed.len(), 1);
        // DRY_RUN never reaches the broker
        assert!(h.broker.fills().await.is_empty());
    }

    #[tokio::test]
    async fn test_signal_only_mode_carries_signals_over() {
        let h = harness(PaperBroker::new(100_000.0), config(&["momentum"]));
        let first = h.coordinator.run_cycle("acct-1", false, false).await.unwrap();
        assert_eq!(first.execution.status, PhaseStatus::Skipped);
        assert_eq!(first.optimization.status, PhaseStatus::Skipped);
        assert!(first.proposal.is_none());

        let second = h.coordinator.run_cycle("acct-1", false, false).await.unwrap();
        assert_eq!(second.generation.counts.generated, 0);
        assert_eq!(second.generation.counts.duplicates, 1);
        // The first cycle's VALIDATED signal is filtered again
        assert_eq!(second.filter.counts.total, 1);
        assert_eq!(second.filter.counts.passed, 1);

        let pending = h
            .store
            .list_signals("acct-1", &[SignalStatus::Validated])
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_positions_degrade_without_aborting() {
        let h = harness(
            PaperBroker::new(100_000.0).with_positions_unavailable(),
            config(&["momentum"]),
        );
        let result = h.coordinator.run_cycle("acct-1", true, true).await.unwrap();

        assert_eq!(result.generation.status, PhaseStatus::Degraded);
        assert_eq!(result.filter.status, PhaseStatus::Degraded);
        assert!(result.filter.warnings[0].contains("position snapshot unavailable"));
        assert_eq!(result.execution.counts.executed, 0);
        assert_eq!(result.evaluation.status, PhaseStatus::Completed);
        assert!(result.is_degraded());
    }

    #[tokio::test]
    async fn test_missing_run_is_a_warning() {
        let h = harness(PaperBroker::new(100_000.0), config(&["momentum", "ghost"]));
        let result = h.coordinator.run_cycle("acct-1", false, false).await.unwrap();

        assert_eq!(result.generation.status, PhaseStatus::Degraded);
        assert_eq!(result.generation.counts.generated, 1);
        assert!(result.generation.warnings.iter().any(|w| w.contains("ghost")));
        assert!(result.generation.error.is_none());
    }

    #[tokio::test]
    async fn test_rejects_empty_account_and_concurrent_cycle() {
        let h = harness(PaperBroker::new(100_000.0), config(&["momentum"]));
        assert!(matches!(
            h.coordinator.run_cycle("  ", true, true).await,
            Err(SignalError::InvalidInput(_))
        ));

        let held = h.coordinator.lock_account("acct-1").unwrap();
        assert!(matches!(
            h.coordinator.run_cycle("acct-1", false, false).await,
            Err(SignalError::CycleInProgress(_))
        ));
        assert!(h.coordinator.status("acct-1").await.cycle_running);
        // Other accounts are unaffected
        assert!(h.coordinator.run_cycle("acct-2", false, false).await.is_ok());

        drop(held);
        assert!(h.coordinator.run_cycle("acct-1", false, false).await.is_ok());
    }

    #[tokio::test]
    async fn test_overlapping_cycles_one_rejected() {
        let mut cfg = config(&["momentum"]);
        cfg.executor.mode = ExecutionMode::Live;
        let h = harness(
            PaperBroker::new(100_000.0).with_latency(Duration::from_millis(50)),
            cfg,
        );

        let (a, b) = tokio::join!(
            h.coordinator.run_cycle("acct-1", true, false),
            h.coordinator.run_cycle("acct-1", true, false)
        );
        let rejected = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(SignalError::CycleInProgress(_))))
            .count();
        assert_eq!(rejected, 1);
        assert_eq!(h.broker.fills().await.len(), 1);
    }

    #[tokio::test]
    async fn test_proposal_stays_advisory_without_auto_apply() {
        let mut cfg = config(&[]);
        cfg.optimizer = OptimizerConfig {
            target_win_rate: 0.70,
            ..OptimizerConfig::default()
        };
        let h = harness(PaperBroker::new(100_000.0), cfg);
        for s in twelve_with_seven_winners() {
            h.store.insert_signal(&s).await.unwrap();
        }

        let result = h.coordinator.run_cycle("acct-1", false, true).await.unwrap();
        assert_eq!(result.generation.status, PhaseStatus::Skipped);
        assert_eq!(result.evaluation.counts.evaluated, 12);
        assert!(!result.optimization.counts.applied);
        let proposal = result.proposal.unwrap();
        assert!(proposal.adjustments.contains_key(MIN_STRENGTH));
        assert!(!proposal.applied);
        assert!(h.store.load_parameters("acct-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_auto_apply_persists_parameters() {
        let mut cfg = config(&[]);
        cfg.optimizer = OptimizerConfig {
            target_win_rate: 0.70,
            auto_apply: true,
            ..OptimizerConfig::default()
        };
        let h = harness(PaperBroker::new(100_000.0), cfg);
        for s in twelve_with_seven_winners() {
            h.store.insert_signal(&s).await.unwrap();
        }

        let result = h.coordinator.run_cycle("acct-1", false, true).await.unwrap();
        assert!(result.optimization.counts.applied);

        let params = h.store.load_parameters("acct-1").await.unwrap().unwrap();
        assert!(params.thresholds.min_strength > 40.0);
        let stored = h.store.latest_proposal("acct-1").await.unwrap().unwrap();
        assert!(stored.applied);
        assert!(stored.applied_at.is_some());

        let mut again = stored.clone();
        assert!(h.coordinator.apply_proposal(&mut again).await.is_err());
    }

    #[tokio::test]
    async fn test_status_reports_last_cycle() {
        let h = harness(PaperBroker::new(100_000.0), config(&["momentum"]));
        assert!(h.coordinator.status("acct-1").await.last_cycle.is_none());

        let result = h.coordinator.run_cycle("acct-1", false, false).await.unwrap();
        let status = h.coordinator.status("acct-1").await;
        assert!(!status.cycle_running);
        assert_eq!(status.last_cycle.unwrap().cycle_id, result.cycle_id);
        assert_eq!(status.metrics.cycles_run, 1);
        assert_eq!(status.metrics.signals_generated, 1);
    }
}
