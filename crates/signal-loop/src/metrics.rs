use std::collections::VecDeque;
use std::time::Instant;

use serde::Serialize;

const RECENT_WINDOW: usize = 20;

/// Running counters for the feedback loop.
/// Tracks per-cycle timing, aggregate stats and a rolling window of evaluated win rates.
#[derive(Debug, Clone, Serialize)]
pub struct LoopMetrics {
    pub cycles_run: u64,
    pub cycles_degraded: u64,
    pub signals_generated: u64,
    pub signals_rejected: u64,
    pub signals_filtered_out: u64,
    pub signals_adjusted: u64,
    pub signals_expired: u64,
    pub orders_executed: u64,
    pub orders_failed: u64,
    pub proposals_built: u64,

    // Per-cycle timing (last cycle)
    pub last_generation_ms: u64,
    pub last_filter_ms: u64,
    pub last_execution_ms: u64,
    pub last_evaluation_ms: u64,
    pub last_total_ms: u64,

    #[serde(skip)]
    recent_win_rates: VecDeque<f64>,
    #[serde(skip)]
    log_interval_cycles: u64,
}

impl LoopMetrics {
    pub fn new(log_interval_cycles: u64) -> Self {
        Self {
            cycles_run: 0,
            cycles_degraded: 0,
            signals_generated: 0,
            signals_rejected: 0,
            signals_filtered_out: 0,
            signals_adjusted: 0,
            signals_expired: 0,
            orders_executed: 0,
            orders_failed: 0,
            proposals_built: 0,
            last_generation_ms: 0,
            last_filter_ms: 0,
            last_execution_ms: 0,
            last_evaluation_ms: 0,
            last_total_ms: 0,
            recent_win_rates: VecDeque::with_capacity(RECENT_WINDOW),
            log_interval_cycles,
        }
    }

    pub fn start_timer() -> Instant {
        Instant::now()
    }

    pub fn elapsed_ms(start: Instant) -> u64 {
        start.elapsed().as_millis() as u64
    }

    pub fn record_generation(&mut self, generated: usize, rejected: usize, duration_ms: u64) {
        self.signals_generated += generated as u64;
        self.signals_rejected += rejected as u64;
        self.last_generation_ms = duration_ms;
    }

    pub fn record_filter(&mut self, filtered_out: usize, adjusted: usize, duration_ms: u64) {
        self.signals_filtered_out += filtered_out as u64;
        self.signals_adjusted += adjusted as u64;
        self.last_filter_ms = duration_ms;
    }

    pub fn record_expired(&mut self, expired: usize) {
        self.signals_expired += expired as u64;
    }

    pub fn record_execution(&mut self, executed: usize, failed: usize, duration_ms: u64) {
        self.orders_executed += executed as u64;
        self.orders_failed += failed as u64;
        self.last_execution_ms = duration_ms;
    }

    /// Only windows with at least one evaluated signal feed the rolling rate.
    pub fn record_evaluation(&mut self, win_rate: f64, evaluated: usize, duration_ms: u64) {
        self.last_evaluation_ms = duration_ms;
        if evaluated == 0 {
            return;
        }
        self.recent_win_rates.push_back(win_rate);
        if self.recent_win_rates.len() > RECENT_WINDOW {
            self.recent_win_rates.pop_front();
        }
    }

    pub fn record_proposal(&mut self) {
        self.proposals_built += 1;
    }

    pub fn finish_cycle(&mut self, cycle_start: Instant, degraded: bool) {
        self.last_total_ms = Self::elapsed_ms(cycle_start);
        self.cycles_run += 1;
        if degraded {
            self.cycles_degraded += 1;
        }

        if self.log_interval_cycles > 0 && self.cycles_run.is_multiple_of(self.log_interval_cycles) {
            self.log_metrics();
        }
    }

    /// Mean of the last 20 evaluated win rates (0-100%)
    pub fn recent_win_rate(&self) -> f64 {
        if self.recent_win_rates.is_empty() {
            return 0.0;
        }
        self.recent_win_rates.iter().sum::<f64>() / self.recent_win_rates.len() as f64 * 100.0
    }

    pub fn execution_success_rate(&self) -> f64 {
        let total = self.orders_executed + self.orders_failed;
        if total == 0 {
            return 0.0;
        }
        (self.orders_executed as f64 / total as f64) * 100.0
    }

    pub fn log_metrics(&self) {
        tracing::info!(
            cycles = self.cycles_run,
            cycles_degraded = self.cycles_degraded,
            signals_generated = self.signals_generated,
            signals_rejected = self.signals_rejected,
            signals_filtered_out = self.signals_filtered_out,
            signals_adjusted = self.signals_adjusted,
            signals_expired = self.signals_expired,
            orders_executed = self.orders_executed,
            orders_failed = self.orders_failed,
            proposals = self.proposals_built,
            execution_success = format!("{:.1}%", self.execution_success_rate()),
            recent_win_rate = format!("{:.1}%", self.recent_win_rate()),
            last_cycle_ms = self.last_total_ms,
            last_execution_ms = self.last_execution_ms,
            "Loop metrics summary"
        );
    }
}
