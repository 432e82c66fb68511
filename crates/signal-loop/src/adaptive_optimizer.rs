use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kelly_position_sizer::{EdgeEstimate, KellyPositionSizer, SizingBand};
use signal_core::{
    ActiveParameters, OptimizationProposal, ParameterAdjustment, ProposalBasis, SignalError,
    MAX_POSITION_FRACTION, MAX_RISK_SCORE, MIN_CONFIDENCE, MIN_STRENGTH, POSITION_FRACTION,
    WEIGHT_PREFIX,
};

use crate::config::OptimizerConfig;
use crate::performance_analyzer::PerformanceReport;

pub const AREA_THRESHOLD: &str = "threshold";
pub const AREA_WEIGHT: &str = "weight";
pub const AREA_RISK: &str = "risk";
pub const AREA_SIZING: &str = "sizing";

/// Changes smaller than this are not worth proposing.
const MIN_CHANGE: f64 = 1e-4;

/// Turns a performance report into advisory parameter changes.
pub struct AdaptiveOptimizer {
    config: OptimizerConfig,
}

struct Draft<'a> {
    params: &'a ActiveParameters,
    adjustments: BTreeMap<String, ParameterAdjustment>,
    declined: BTreeMap<String, String>,
}

impl Draft<'_> {
    fn propose(&mut self, parameter: &str, proposed: f64, reason: String) -> bool {
        let current = self.params.get(parameter).unwrap_or(0.0);
        if (proposed - current).abs() < MIN_CHANGE {
            return false;
        }
        self.adjustments.insert(
            parameter.to_string(),
            ParameterAdjustment {
                current,
                proposed,
                reason,
            },
        );
        true
    }

    fn decline(&mut self, area: &str, reason: impl Into<String>) {
        self.declined.insert(area.to_string(), reason.into());
    }
}

impl AdaptiveOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn propose(
        &self,
        report: &PerformanceReport,
        params: &ActiveParameters,
        now: DateTime<Utc>,
    ) -> OptimizationProposal {
        let mut draft = Draft {
            params,
            adjustments: BTreeMap::new(),
            declined: BTreeMap::new(),
        };

        if report.total_evaluated < self.config.min_sample {
            let reason = SignalError::InsufficientSample {
                have: report.total_evaluated,
                need: self.config.min_sample,
            }
            .to_string();
            for area in [AREA_THRESHOLD, AREA_WEIGHT, AREA_RISK, AREA_SIZING] {
                draft.decline(area, reason.clone());
            }
        } else {
            self.propose_thresholds(report, &mut draft);
            self.propose_weights(report, &mut draft);
            self.propose_risk(report, &mut draft);
            self.propose_sizing(report, &mut draft);
        }

        let proposal = OptimizationProposal {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: report.account_id.clone(),
            created_at: now,
            adjustments: draft.adjustments,
            declined: draft.declined,
            basis: ProposalBasis {
                sample_size: report.total_evaluated,
                window_days: report.window_days,
                win_rate: report.win_rate,
                min_sample: self.config.min_sample,
            },
            applied: false,
            applied_at: None,
        };

        tracing::info!(
            account_id = %proposal.account_id,
            sample = report.total_evaluated,
            adjustments = proposal.adjustments.len(),
            declined = proposal.declined.len(),
            "Optimization proposal built"
        );

        proposal
    }

    fn propose_thresholds(&self, report: &PerformanceReport, draft: &mut Draft<'_>) {
        let cfg = &self.config;
        let thresholds = &draft.params.thresholds;
        let (strength, confidence) = (thresholds.min_strength, thresholds.min_confidence);

        if report.win_rate < cfg.target_win_rate - cfg.win_rate_tolerance {
            let reason = format!(
                "win rate {:.1}% below target {:.1}%",
                report.win_rate * 100.0,
                cfg.target_win_rate * 100.0
            );
            let a = draft.propose(
                MIN_STRENGTH,
                (strength + cfg.strength_step).min(100.0),
                reason.clone(),
            );
            let b = draft.propose(
                MIN_CONFIDENCE,
                (confidence + cfg.confidence_step).min(0.95),
                reason,
            );
            if !(a || b) {
                draft.decline(AREA_THRESHOLD, "thresholds already at their ceiling");
            }
        } else if report.win_rate > cfg.target_win_rate + cfg.win_rate_tolerance
            && report.signals_generated < cfg.low_volume_threshold
        {
            let reason = format!(
                "win rate {:.1}% above target with low volume ({} signals)",
                report.win_rate * 100.0,
                report.signals_generated
            );
            let a = draft.propose(
                MIN_STRENGTH,
                (strength - cfg.strength_step).max(0.0),
                reason.clone(),
            );
            let b = draft.propose(
                MIN_CONFIDENCE,
                (confidence - cfg.confidence_step).max(0.0),
                reason,
            );
            if !(a || b) {
                draft.decline(AREA_THRESHOLD, "thresholds already at their floor");
            }
        } else {
            draft.decline(
                AREA_THRESHOLD,
                format!(
                    "win rate {:.1}% within target band or volume sufficient",
                    report.win_rate * 100.0
                ),
            );
        }
    }

    fn propose_weights(&self, report: &PerformanceReport, draft: &mut Draft<'_>) {
        let cfg = &self.config;
        let mut changed = false;

        for (strategy_id, stats) in &report.by_strategy {
            if stats.total < cfg.min_strategy_sample {
                continue;
            }
            let key = format!("{WEIGHT_PREFIX}{strategy_id}");
            let current = draft.params.strategy_weight(strategy_id);

            let proposed = if stats.win_rate > cfg.target_win_rate && stats.sharpe_like > 0.0 {
                (current + cfg.weight_step).min(cfg.max_weight)
            } else if stats.win_rate < cfg.target_win_rate - cfg.win_rate_tolerance
                && stats.sharpe_like < 0.0
            {
                (current - cfg.weight_step).max(cfg.min_weight)
            } else {
                continue;
            };

            let reason = format!(
                "{} win rate {:.1}%, sharpe-like {:.2} over {} signals",
                strategy_id,
                stats.win_rate * 100.0,
                stats.sharpe_like,
                stats.total
            );
            changed |= draft.propose(&key, proposed, reason);
        }

        if !changed {
            draft.decline(AREA_WEIGHT, "no strategy clearly out- or underperforming");
        }
    }

    fn propose_risk(&self, report: &PerformanceReport, draft: &mut Draft<'_>) {
        let cfg = &self.config;
        let risk = &draft.params.risk;
        let (score, fraction) = (risk.max_risk_score, risk.max_position_fraction);

        let changed = if report.max_drawdown > cfg.drawdown_threshold {
            let reason = format!(
                "drawdown {:.1}% above {:.1}%",
                report.max_drawdown * 100.0,
                cfg.drawdown_threshold * 100.0
            );
            let a = draft.propose(
                MAX_RISK_SCORE,
                (score - cfg.risk_score_step).max(cfg.min_risk_score),
                reason.clone(),
            );
            let b = draft.propose(
                MAX_POSITION_FRACTION,
                (fraction * cfg.tighten_factor).max(cfg.min_fraction),
                reason,
            );
            a || b
        } else if report.clean_execution_streak >= cfg.clean_streak_threshold {
            let reason = format!(
                "{} clean executions in a row",
                report.clean_execution_streak
            );
            // Loosen by half a step at a time
            let a = draft.propose(
                MAX_RISK_SCORE,
                (score + cfg.risk_score_step / 2.0).min(cfg.max_risk_score),
                reason.clone(),
            );
            let b = draft.propose(
                MAX_POSITION_FRACTION,
                (fraction * cfg.loosen_factor).min(cfg.max_fraction_per_symbol),
                reason,
            );
            a || b
        } else {
            false
        };

        if !changed {
            draft.decline(AREA_RISK, "no drawdown event or clean streak to act on");
        }
    }

    fn propose_sizing(&self, report: &PerformanceReport, draft: &mut Draft<'_>) {
        let cfg = &self.config;

        // Honour a risk cap tightened in this same proposal.
        let risk_cap = draft
            .adjustments
            .get(MAX_POSITION_FRACTION)
            .map(|a| a.proposed)
            .unwrap_or(draft.params.risk.max_position_fraction);

        let band = SizingBand {
            multiplier: cfg.kelly_multiplier,
            min_fraction: cfg.min_fraction,
            max_fraction: cfg.max_fraction_per_symbol,
        }
        .capped_at(risk_cap);

        let edge = EdgeEstimate {
            win_rate: report.win_rate,
            avg_win: report.avg_win_pct,
            avg_loss: report.avg_loss_pct,
            sample_size: report.total_evaluated,
        };
        let decision = KellyPositionSizer::new(band).size(&edge);

        if !draft.propose(POSITION_FRACTION, decision.fraction, decision.reasoning) {
            draft.decline(AREA_SIZING, "position fraction already at Kelly target");
        }
    }

    /// Apply every adjustment of `proposal` to a copy of `params`.
    pub fn apply(
        &self,
        proposal: &OptimizationProposal,
        params: &ActiveParameters,
        now: DateTime<Utc>,
    ) -> Result<ActiveParameters, SignalError> {
        let mut next = params.clone();
        for (name, adjustment) in &proposal.adjustments {
            next.set(name, adjustment.proposed)?;
        }
        // The per-symbol ceiling is absolute, whatever the proposal says.
        let ceiling = self.config.max_fraction_per_symbol;
        next.risk.max_position_fraction = next.risk.max_position_fraction.min(ceiling);
        next.position_fraction = next.position_fraction.min(ceiling);
        next.updated_at = Some(now);
        Ok(next)
    }
}
