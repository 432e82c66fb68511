use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use signal_core::scoring::{mean, sharpe_like};
use signal_core::{
    OutcomeStore, SignalError, SignalPerformance, SignalStatus, SignalStore, TradingSignal,
};

use crate::config::AnalyzerConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakdownStats {
    pub total: usize,
    pub winners: usize,
    pub win_rate: f64,
    pub avg_return: f64,
    pub total_pnl: f64,
    pub sharpe_like: f64,
}

impl BreakdownStats {
    fn from_rows(rows: &[&SignalPerformance]) -> Self {
        let returns: Vec<f64> = rows.iter().map(|r| r.pnl_pct).collect();
        let winners = rows.iter().filter(|r| r.is_winner).count();
        Self {
            total: rows.len(),
            winners,
            win_rate: ratio(winners, rows.len()),
            avg_return: mean(&returns),
            total_pnl: rows.iter().map(|r| r.pnl).sum(),
            sharpe_like: sharpe_like(&returns),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// High confidence, lost money
    Overconfident,
    /// Risk score above threshold, lost money
    HighRiskFailure,
    /// Slippage above threshold, whatever the outcome
    ExecutionIssue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePattern {
    pub kind: FailureKind,
    pub count: usize,
    pub signal_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRef {
    pub signal_id: String,
    pub symbol: String,
    pub strategy_id: String,
    pub pnl_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub account_id: String,
    pub window_days: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,

    pub total_evaluated: usize,
    pub winners: usize,
    pub losers: usize,
    pub win_rate: f64,
    pub avg_return: f64,
    pub avg_holding_hours: f64,
    pub total_pnl: f64,
    pub avg_win_pct: f64,
    /// Mean loss as a positive fraction
    pub avg_loss_pct: f64,
    pub max_drawdown: f64,
    pub clean_execution_streak: usize,

    /// Signals generated inside the window, any status
    pub signals_generated: usize,
    pub failed_executions: usize,

    pub by_strategy: BTreeMap<String, BreakdownStats>,
    pub by_source: BTreeMap<String, BreakdownStats>,
    pub best: Option<SignalRef>,
    pub worst: Option<SignalRef>,
    pub failure_patterns: Vec<FailurePattern>,
}

fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// Peak-to-trough decline of cumulative returns, in return units.
fn max_drawdown(returns: &[f64]) -> f64 {
    let mut cumulative = 0.0;
    let mut peak = 0.0_f64;
    let mut worst = 0.0_f64;
    for r in returns {
        cumulative += r;
        peak = peak.max(cumulative);
        worst = worst.max(peak - cumulative);
    }
    worst
}

/// Read-only aggregation over closed signals. The only writes are SignalPerformance rows.
pub struct PerformanceAnalyzer {
    signals: Arc<dyn SignalStore>,
    outcomes: Arc<dyn OutcomeStore>,
    config: AnalyzerConfig,
}

impl PerformanceAnalyzer {
    pub fn new(
        signals: Arc<dyn SignalStore>,
        outcomes: Arc<dyn OutcomeStore>,
        config: AnalyzerConfig,
    ) -> Self {
        Self {
            signals,
            outcomes,
            config,
        }
    }

    pub async fn evaluate_window(
        &self,
        account_id: &str,
        window_days: i64,
    ) -> Result<PerformanceReport, SignalError> {
        let now = Utc::now();
        window_bounds(window_days, now)?;

        // The store lazily expires stale pending rows as it reads them. Executed and
        // closed signals are terminal, so nothing the report is built from changes.
        let signals = self
            .signals
            .list_signals(account_id, &[])
            .await
            .map_err(SignalError::storage)?;

        let (report, rows) =
            Self::build_report(account_id, window_days, now, &signals, &self.config)?;

        for row in &rows {
            self.outcomes
                .upsert_performance(row)
                .await
                .map_err(SignalError::storage)?;
        }

        tracing::info!(
            account_id,
            window_days,
            evaluated = report.total_evaluated,
            win_rate = format!("{:.1}%", report.win_rate * 100.0),
            total_pnl = format!("{:.2}", report.total_pnl),
            max_drawdown = format!("{:.4}", report.max_drawdown),
            "Performance window evaluated"
        );

        Ok(report)
    }

    /// Pure report computation; also returns the performance rows to persist.
    pub fn build_report(
        account_id: &str,
        window_days: i64,
        now: DateTime<Utc>,
        signals: &[TradingSignal],
        config: &AnalyzerConfig,
    ) -> Result<(PerformanceReport, Vec<SignalPerformance>), SignalError> {
        let window_start = window_bounds(window_days, now)?;
        let in_window = |t: DateTime<Utc>| t >= window_start && t <= now;

        let mut closed: Vec<&TradingSignal> = signals
            .iter()
            .filter(|s| s.account_id == account_id && s.status == SignalStatus::Executed)
            .filter(|s| s.evaluation.as_ref().is_some_and(|e| in_window(e.closed_at)))
            .collect();
        closed.sort_by(|a, b| {
            close_time(a)
                .cmp(&close_time(b))
                .then_with(|| a.id.cmp(&b.id))
        });

        let rows: Vec<SignalPerformance> = closed.iter().filter_map(|s| performance_row(s)).collect();

        let returns: Vec<f64> = rows.iter().map(|r| r.pnl_pct).collect();
        let wins: Vec<f64> = rows.iter().filter(|r| r.is_winner).map(|r| r.pnl_pct).collect();
        let losses: Vec<f64> = rows
            .iter()
            .filter(|r| !r.is_winner)
            .map(|r| r.pnl_pct.abs())
            .collect();
        let winners = wins.len();

        let mut by_strategy: BTreeMap<String, Vec<&SignalPerformance>> = BTreeMap::new();
        let mut by_source: BTreeMap<String, Vec<&SignalPerformance>> = BTreeMap::new();
        for row in &rows {
            by_strategy.entry(row.strategy_id.clone()).or_default().push(row);
            by_source.entry(row.source.to_string()).or_default().push(row);
        }

        let to_ref = |row: &SignalPerformance| SignalRef {
            signal_id: row.signal_id.clone(),
            symbol: row.symbol.clone(),
            strategy_id: row.strategy_id.clone(),
            pnl_pct: row.pnl_pct,
        };
        // First occurrence wins ties
        let best = rows
            .iter()
            .fold(None::<&SignalPerformance>, |acc, r| match acc {
                Some(b) if b.pnl_pct >= r.pnl_pct => Some(b),
                _ => Some(r),
            })
            .map(to_ref);
        let worst = rows
            .iter()
            .fold(None::<&SignalPerformance>, |acc, r| match acc {
                Some(w) if w.pnl_pct <= r.pnl_pct => Some(w),
                _ => Some(r),
            })
            .map(to_ref);

        let has_execution_issue =
            |s: &TradingSignal| s.slippage().unwrap_or(0.0) > config.slippage_threshold;
        let clean_execution_streak = closed
            .iter()
            .rev()
            .take_while(|s| !has_execution_issue(s))
            .count();

        let mut patterns: BTreeMap<FailureKind, Vec<String>> = BTreeMap::new();
        for (signal, row) in closed.iter().zip(&rows) {
            let lost = !row.is_winner;
            if lost && signal.confidence >= config.overconfidence_threshold {
                patterns
                    .entry(FailureKind::Overconfident)
                    .or_default()
                    .push(signal.id.clone());
            }
            if lost && signal.risk_score > config.high_risk_threshold {
                patterns
                    .entry(FailureKind::HighRiskFailure)
                    .or_default()
                    .push(signal.id.clone());
            }
            if has_execution_issue(signal) {
                patterns
                    .entry(FailureKind::ExecutionIssue)
                    .or_default()
                    .push(signal.id.clone());
            }
        }

        let generated_in_window = signals
            .iter()
            .filter(|s| s.account_id == account_id && in_window(s.generated_at));
        let signals_generated = generated_in_window.clone().count();
        let failed_executions = generated_in_window
            .filter(|s| s.status == SignalStatus::Failed)
            .count();

        let report = PerformanceReport {
            account_id: account_id.to_string(),
            window_days,
            window_start,
            window_end: now,
            total_evaluated: rows.len(),
            winners,
            losers: rows.len() - winners,
            win_rate: ratio(winners, rows.len()),
            avg_return: mean(&returns),
            avg_holding_hours: mean(
                &rows.iter().map(|r| r.holding_period_hours).collect::<Vec<_>>(),
            ),
            total_pnl: rows.iter().map(|r| r.pnl).sum(),
            avg_win_pct: mean(&wins),
            avg_loss_pct: mean(&losses),
            max_drawdown: max_drawdown(&returns),
            clean_execution_streak,
            signals_generated,
            failed_executions,
            by_strategy: by_strategy
                .iter()
                .map(|(k, v)| (k.clone(), BreakdownStats::from_rows(v)))
                .collect(),
            by_source: by_source
                .iter()
                .map(|(k, v)| (k.clone(), BreakdownStats::from_rows(v)))
                .collect(),
            best,
            worst,
            failure_patterns: patterns
                .into_iter()
                .map(|(kind, signal_ids)| FailurePattern {
                    kind,
                    count: signal_ids.len(),
                    signal_ids,
                })
                .collect(),
        };

        Ok((report, rows))
    }
}

/// Start of a `window_days` window ending at `now`.
fn window_bounds(window_days: i64, now: DateTime<Utc>) -> Result<DateTime<Utc>, SignalError> {
    if window_days <= 0 {
        return Err(SignalError::InvalidInput(format!(
            "window_days must be positive, got {window_days}"
        )));
    }
    Duration::try_days(window_days)
        .and_then(|span| now.checked_sub_signed(span))
        .ok_or_else(|| {
            SignalError::InvalidInput(format!("window_days {window_days} is out of range"))
        })
}

fn close_time(signal: &TradingSignal) -> Option<DateTime<Utc>> {
    signal.evaluation.as_ref().map(|e| e.closed_at)
}

/// Built from signal fields only, so re-running over the same signals yields equal rows.
fn performance_row(signal: &TradingSignal) -> Option<SignalPerformance> {
    let eval = signal.evaluation.as_ref()?;
    let opened_at = signal.executed_at.unwrap_or(signal.generated_at);
    let holding = (eval.closed_at - opened_at).num_seconds().max(0) as f64 / 3600.0;
    Some(SignalPerformance {
        signal_id: signal.id.clone(),
        account_id: signal.account_id.clone(),
        strategy_id: signal.strategy_id.clone(),
        source: signal.source,
        symbol: signal.symbol.clone(),
        pnl: eval.realized_pnl,
        pnl_pct: eval.actual_return,
        holding_period_hours: holding,
        is_winner: eval.realized_pnl > 0.0,
        closed_at: eval.closed_at,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use signal_core::{
        Direction, EvaluationDetails, ExecutionDetails, SignalSource, SignalType,
    };
    use signal_store::MemoryStore;

    /// An executed and closed signal with the given return, closed `hours_ago`.
    pub(crate) fn closed_signal(
        id: &str,
        strategy_id: &str,
        actual_return: f64,
        hours_ago: i64,
    ) -> TradingSignal {
        let closed_at = Utc::now() - Duration::hours(hours_ago);
        let mut s = TradingSignal::new(
            "acct-1",
            format!("SYM{id}"),
            SignalType::Entry,
            Direction::Long,
            strategy_id,
            "run-1",
            closed_at - Duration::hours(26),
            Duration::hours(4),
        );
        s.id = id.to_string();
        s.status = SignalStatus::Executed;
        s.confidence = 0.6;
        s.risk_score = 40.0;
        s.source = SignalSource::Technical;
        s.executed_at = Some(closed_at - Duration::hours(24));
        s.execution = Some(ExecutionDetails {
            executed_price: Some(100.0),
            executed_quantity: Some(10.0),
            slippage: Some(0.0),
            order_reference: Some(format!("ref-{id}")),
            error: None,
            dry_run: true,
        });
        s.evaluation = Some(EvaluationDetails {
            exit_price: 100.0 * (1.0 + actual_return),
            closed_at,
            actual_return,
            realized_pnl: actual_return * 1000.0,
            evaluation_score: 50.0,
        });
        s
    }

    /// Twelve closed signals, seven winners.
    pub(crate) fn twelve_with_seven_winners() -> Vec<TradingSignal> {
        let returns = [
            0.04, -0.02, 0.03, 0.05, -0.01, 0.02, -0.03, 0.06, -0.02, 0.01, -0.04, 0.02,
        ];
        returns
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let strategy = if i % 2 == 0 { "momentum" } else { "reversion" };
                closed_signal(&format!("{i:02}"), strategy, *r, 24 * (12 - i as i64))
            })
            .collect()
    }

    #[test]
    fn test_win_rate_seven_of_twelve() {
        let signals = twelve_with_seven_winners();
        let (report, rows) = PerformanceAnalyzer::build_report(
            "acct-1",
            30,
            Utc::now(),
            &signals,
            &AnalyzerConfig::default(),
        )
        .unwrap();
        assert_eq!(report.total_evaluated, 12);
        assert_eq!(report.winners, 7);
        assert_relative_eq!(report.win_rate, 7.0 / 12.0, epsilon = 1e-9);
        assert_eq!(rows.len(), 12);
        assert_relative_eq!(report.avg_holding_hours, 24.0, epsilon = 1e-9);
        assert_eq!(report.best.as_ref().unwrap().pnl_pct, 0.06);
        assert_eq!(report.worst.as_ref().unwrap().pnl_pct, -0.04);
        assert_eq!(report.by_strategy.len(), 2);
        assert_eq!(report.by_source["TECHNICAL"].total, 12);
    }

    #[test]
    fn test_window_excludes_old_and_unclosed() {
        let mut signals = vec![
            closed_signal("new", "momentum", 0.02, 1),
            closed_signal("old", "momentum", 0.02, 24 * 40),
        ];
        let mut open = closed_signal("open", "momentum", 0.02, 1);
        open.evaluation = None;
        signals.push(open);
        let mut failed = closed_signal("failed", "momentum", 0.02, 1);
        failed.status = SignalStatus::Failed;
        signals.push(failed);

        let (report, _) = PerformanceAnalyzer::build_report(
            "acct-1",
            30,
            Utc::now(),
            &signals,
            &AnalyzerConfig::default(),
        )
        .unwrap();
        assert_eq!(report.total_evaluated, 1);
        assert_eq!(report.failed_executions, 1);
    }

    #[test]
    fn test_failure_patterns() {
        let mut overconfident = closed_signal("a", "momentum", -0.05, 3);
        overconfident.confidence = 0.9;
        let mut risky = closed_signal("b", "momentum", -0.02, 2);
        risky.risk_score = 85.0;
        let mut slipped = closed_signal("c", "momentum", 0.04, 1);
        if let Some(exec) = slipped.execution.as_mut() {
            exec.slippage = Some(0.01);
        }

        let (report, _) = PerformanceAnalyzer::build_report(
            "acct-1",
            30,
            Utc::now(),
            &[overconfident, risky, slipped],
            &AnalyzerConfig::default(),
        )
        .unwrap();
        let kinds: Vec<_> = report.failure_patterns.iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            vec![
                FailureKind::Overconfident,
                FailureKind::HighRiskFailure,
                FailureKind::ExecutionIssue
            ]
        );
        // Newest close had slippage, so no clean streak
        assert_eq!(report.clean_execution_streak, 0);
    }

    #[test]
    fn test_window_days_out_of_range() {
        for days in [0, -3, 1_000_000_000, i64::MAX] {
            let err = PerformanceAnalyzer::build_report(
                "acct-1",
                days,
                Utc::now(),
                &[],
                &AnalyzerConfig::default(),
            )
            .unwrap_err();
            assert!(matches!(err, SignalError::InvalidInput(_)));
        }
    }

    #[tokio::test]
    async fn test_evaluate_window_rejects_huge_window() {
        let store = Arc::new(MemoryStore::new());
        let analyzer =
            PerformanceAnalyzer::new(store.clone(), store, AnalyzerConfig::default());
        let err = analyzer
            .evaluate_window("acct-1", 1_000_000_000)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::InvalidInput(_)));
    }

    #[test]
    fn test_max_drawdown() {
        assert_relative_eq!(max_drawdown(&[0.05, -0.02, -0.04, 0.03]), 0.06, epsilon = 1e-9);
        assert_relative_eq!(max_drawdown(&[0.01, 0.02]), 0.0, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn test_rerun_does_not_duplicate_rows() {
        let store = Arc::new(MemoryStore::new());
        for s in twelve_with_seven_winners() {
            store.insert_signal(&s).await.unwrap();
        }
        let analyzer =
            PerformanceAnalyzer::new(store.clone(), store.clone(), AnalyzerConfig::default());

        analyzer.evaluate_window("acct-1", 30).await.unwrap();
        let first = store.list_performance("acct-1").await.unwrap();
        analyzer.evaluate_window("acct-1", 30).await.unwrap();
        let second = store.list_performance("acct-1").await.unwrap();

        assert_eq!(first.len(), 12);
        assert_eq!(first, second);

        // Signals are untouched
        let signals = store.list_signals("acct-1", &[]).await.unwrap();
        assert!(signals.iter().all(|s| s.status == SignalStatus::Executed));
    }
}
