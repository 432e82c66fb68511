use chrono::{DateTime, Utc};
use serde::Serialize;
use signal_core::{
    ActiveParameters, OptimizationProposal, SignalError, SignalStatus, TradingSignal,
};

use crate::closing;
use crate::config::{ExecutionMode, PipelineConfig};
use crate::loop_coordinator::{CycleResult, LoopContext, LoopCoordinator, LoopStatus};
use crate::order_executor::{BatchExecutionResult, ExecutionResult, ExecutionStatus};
use crate::performance_analyzer::PerformanceReport;
use crate::position_filter::{FilterStats, PositionSnapshot};

#[derive(Debug, Clone, Serialize)]
pub struct PendingSignals {
    pub signals: Vec<TradingSignal>,
    /// Present when the position filter ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_stats: Option<FilterStats>,
}

/// Entry points for the API layer. Everything routes through one coordinator so the
/// per-account cycle lock and the persisted parameters are shared.
pub struct TradingLoopService {
    coordinator: LoopCoordinator,
}

impl TradingLoopService {
    pub fn new(ctx: LoopContext, config: PipelineConfig) -> Self {
        Self {
            coordinator: LoopCoordinator::new(ctx, config),
        }
    }

    pub fn coordinator(&self) -> &LoopCoordinator {
        &self.coordinator
    }

    pub async fn run_cycle(
        &self,
        account_id: &str,
        execute_trades: bool,
        optimize: bool,
    ) -> Result<CycleResult, SignalError> {
        self.coordinator
            .run_cycle(account_id, execute_trades, optimize)
            .await
    }

    /// GENERATED/VALIDATED signals, oldest first. With `filter_by_position` the position
    /// filter runs first and its verdicts are persisted.
    pub async fn get_pending_signals(
        &self,
        account_id: &str,
        limit: usize,
        filter_by_position: bool,
    ) -> Result<PendingSignals, SignalError> {
        let ctx = self.coordinator.context();
        let pending = ctx
            .signals
            .list_signals(account_id, &SignalStatus::PENDING)
            .await
            .map_err(SignalError::storage)?;

        let (mut signals, filter_stats) = if filter_by_position {
            let positions = ctx.positions.get_positions(account_id).await.map_err(|e| {
                SignalError::DataUnavailable(format!("positions for {account_id}: {e}"))
            })?;
            let outcome = self
                .coordinator
                .filter()
                .filter(pending, &PositionSnapshot::new(positions))
                .await?;
            (outcome.passed, Some(outcome.stats))
        } else {
            (pending, None)
        };

        signals.truncate(limit);
        Ok(PendingSignals {
            signals,
            filter_stats,
        })
    }

    /// Execute specific signals. Live orders need both `dry_run = false` and a
    /// live-configured executor; otherwise the batch runs as DRY_RUN.
    pub async fn execute_signals(
        &self,
        signal_ids: &[String],
        dry_run: bool,
    ) -> Result<BatchExecutionResult, SignalError> {
        let config = &self.coordinator.config().executor;
        let mode = if dry_run {
            ExecutionMode::DryRun
        } else if config.mode == ExecutionMode::Live {
            ExecutionMode::Live
        } else {
            tracing::warn!("Live execution requested but executor is configured for DRY_RUN");
            ExecutionMode::DryRun
        };

        let store = &self.coordinator.context().signals;
        let mut signals = Vec::with_capacity(signal_ids.len());
        let mut missing = Vec::new();
        for id in signal_ids {
            match store.get_signal(id).await.map_err(SignalError::storage)? {
                Some(signal) => signals.push(signal),
                None => missing.push(id.clone()),
            }
        }

        let mut batch = self
            .coordinator
            .executor()
            .execute_batch(signals, mode, config.max_orders_per_batch)
            .await;
        for id in missing {
            batch.skipped_count += 1;
            batch.results.push(ExecutionResult {
                signal_id: id,
                symbol: String::new(),
                status: ExecutionStatus::Skipped,
                executed_price: None,
                executed_quantity: None,
                slippage: None,
                order_reference: None,
                error: Some("signal not found".to_string()),
                dry_run: mode == ExecutionMode::DryRun,
            });
        }
        Ok(batch)
    }

    pub async fn get_performance_report(
        &self,
        account_id: &str,
        window_days: Option<i64>,
    ) -> Result<PerformanceReport, SignalError> {
        let window = window_days.unwrap_or(self.coordinator.config().analyzer.window_days);
        self.coordinator
            .analyzer()
            .evaluate_window(account_id, window)
            .await
    }

    /// Fresh advisory proposal from the configured window, persisted unapplied.
    pub async fn get_optimization_proposal(
        &self,
        account_id: &str,
    ) -> Result<OptimizationProposal, SignalError> {
        let report = self.get_performance_report(account_id, None).await?;
        let params = self.coordinator.active_parameters(account_id).await?;
        let proposal = self
            .coordinator
            .optimizer()
            .propose(&report, &params, Utc::now());
        self.coordinator
            .context()
            .outcomes
            .save_proposal(&proposal)
            .await
            .map_err(SignalError::storage)?;
        Ok(proposal)
    }

    /// Manual confirmation of a stored proposal.
    pub async fn apply_proposal(&self, proposal_id: &str) -> Result<ActiveParameters, SignalError> {
        let mut proposal = self
            .coordinator
            .context()
            .outcomes
            .get_proposal(proposal_id)
            .await
            .map_err(SignalError::storage)?
            .ok_or_else(|| SignalError::NotFound(format!("proposal {proposal_id}")))?;
        self.coordinator.apply_proposal(&mut proposal).await
    }

    pub async fn close_signal(
        &self,
        signal_id: &str,
        exit_price: f64,
        closed_at: Option<DateTime<Utc>>,
    ) -> Result<TradingSignal, SignalError> {
        closing::close_signal(
            self.coordinator.context().signals.as_ref(),
            signal_id,
            exit_price,
            closed_at.unwrap_or_else(Utc::now),
        )
        .await
    }

    pub async fn cancel_signal(&self, signal_id: &str) -> Result<TradingSignal, SignalError> {
        self.coordinator.executor().cancel(signal_id).await
    }

    pub async fn sweep_expired(&self) -> Result<Vec<String>, SignalError> {
        self.coordinator.sweep_expired().await
    }

    pub async fn active_parameters(&self, account_id: &str) -> Result<ActiveParameters, SignalError> {
        self.coordinator.active_parameters(account_id).await
    }

    pub async fn status(&self, account_id: &str) -> LoopStatus {
        self.coordinator.status(account_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position_filter::REASON_AT_TARGET;
    use crate::run_source::StaticRunSource;
    use broker_trait::{PaperBroker, Position};
    use chrono::Duration;
    use signal_core::{Direction, SignalStore, SignalType};
    use signal_store::MemoryStore;
    use std::sync::Arc;

    fn service(broker: PaperBroker) -> (TradingLoopService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(broker);
        let ctx = LoopContext {
            signals: store.clone(),
            outcomes: store.clone(),
            positions: broker.clone(),
            broker,
            runs: Arc::new(StaticRunSource::default()),
        };
        (TradingLoopService::new(ctx, PipelineConfig::default()), store)
    }

    async fn validated(store: &MemoryStore, symbol: &str, minutes_ago: i64) -> TradingSignal {
        let mut s = TradingSignal::new(
            "acct-1",
            symbol,
            SignalType::Entry,
            Direction::Long,
            "momentum",
            "run-1",
            Utc::now() - Duration::minutes(minutes_ago),
            Duration::hours(4),
        );
        s.status = SignalStatus::Validated;
        s.strength = 80.0;
        s.confidence = 0.7;
        s.suggested_price = 100.0;
        s.suggested_quantity = 10.0;
        store.insert_signal(&s).await.unwrap();
        s
    }

    #[tokio::test]
    async fn test_pending_signals_with_and_without_filter() {
        let (svc, store) = service(
            PaperBroker::new(100_000.0).with_position("acct-1", Position::new("XYZ", 20.0, 95.0)),
        );
        validated(&store, "XYZ", 10).await;
        validated(&store, "ABC", 5).await;

        let raw = svc.get_pending_signals("acct-1", 10, false).await.unwrap();
        assert_eq!(raw.signals.len(), 2);
        assert!(raw.filter_stats.is_none());

        let filtered = svc.get_pending_signals("acct-1", 10, true).await.unwrap();
        assert_eq!(filtered.signals.len(), 1);
        assert_eq!(filtered.signals[0].symbol, "ABC");
        let stats = filtered.filter_stats.unwrap();
        assert_eq!(stats.filtered_out, 1);
        assert_eq!(stats.reasons[REASON_AT_TARGET], 1);

        let limited = svc.get_pending_signals("acct-1", 0, false).await.unwrap();
        assert!(limited.signals.is_empty());
    }

    #[tokio::test]
    async fn test_pending_signals_without_positions_is_data_unavailable() {
        let (svc, store) = service(PaperBroker::new(100_000.0).with_positions_unavailable());
        validated(&store, "XYZ", 10).await;
        assert!(matches!(
            svc.get_pending_signals("acct-1", 10, true).await,
            Err(SignalError::DataUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_performance_report_rejects_unbounded_window() {
        let (svc, _) = service(PaperBroker::new(100_000.0));
        assert!(matches!(
            svc.get_performance_report("acct-1", Some(i64::MAX)).await,
            Err(SignalError::InvalidInput(_))
        ));
        assert!(svc.get_performance_report("acct-1", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_execute_close_and_report() {
        let (svc, store) = service(PaperBroker::new(100_000.0));
        let s = validated(&store, "XYZ", 10).await;

        let batch = svc
            .execute_signals(&[s.id.clone(), "missing".to_string()], true)
            .await
            .unwrap();
        assert_eq!(batch.executed_count, 1);
        assert_eq!(batch.skipped_count, 1);

        let closed = svc.close_signal(&s.id, 110.0, None).await.unwrap();
        assert!(closed.evaluation.is_some());

        let report = svc.get_performance_report("acct-1", None).await.unwrap();
        assert_eq!(report.total_evaluated, 1);
        assert_eq!(report.winners, 1);

        // One closed signal is far below the minimum sample
        let proposal = svc.get_optimization_proposal("acct-1").await.unwrap();
        assert!(!proposal.has_changes());
        assert!(!proposal.applied);
    }

    #[tokio::test]
    async fn test_live_request_downgrades_when_executor_is_dry_run() {
        let (svc, store) = service(PaperBroker::new(100_000.0));
        let s = validated(&store, "XYZ", 10).await;

        let batch = svc.execute_signals(&[s.id], false).await.unwrap();
        assert_eq!(batch.executed_count, 1);
        assert!(batch.results[0].dry_run);
    }

    #[tokio::test]
    async fn test_apply_unknown_proposal() {
        let (svc, _) = service(PaperBroker::new(100_000.0));
        assert!(matches!(
            svc.apply_proposal("nope").await,
            Err(SignalError::NotFound(_))
        ));
        assert_eq!(
            svc.active_parameters("acct-1").await.unwrap(),
            ActiveParameters::default()
        );
    }

    #[tokio::test]
    async fn test_sweep_expires_stale_signals() {
        let (svc, store) = service(PaperBroker::new(100_000.0));
        let stale = validated(&store, "XYZ", 60 * 5).await;
        validated(&store, "ABC", 5).await;

        let expired = svc.sweep_expired().await.unwrap();
        assert_eq!(expired, vec![stale.id.clone()]);
        let stored = store.get_signal(&stale.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SignalStatus::Expired);
    }
}
