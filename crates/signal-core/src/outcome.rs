use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SignalError;
use crate::types::SignalSource;

/// One row per executed-and-closed signal. Written by the performance analyzer only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPerformance {
    pub signal_id: String,
    pub account_id: String,
    pub strategy_id: String,
    pub source: SignalSource,
    pub symbol: String,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub holding_period_hours: f64,
    pub is_winner: bool,
    pub closed_at: DateTime<Utc>,
}

pub const MIN_STRENGTH: &str = "threshold.min_strength";
pub const MIN_CONFIDENCE: &str = "threshold.min_confidence";
pub const MAX_RISK_SCORE: &str = "risk.max_risk_score";
pub const MAX_POSITION_FRACTION: &str = "risk.max_position_fraction";
pub const POSITION_FRACTION: &str = "sizing.position_fraction";
pub const WEIGHT_PREFIX: &str = "weight.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalThresholds {
    /// Minimum strength (0-100) a signal needs to survive validation
    pub min_strength: f64,
    /// Minimum confidence (0-1)
    pub min_confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Signals scoring above this are rejected (0-100)
    pub max_risk_score: f64,
    /// Hard cap on equity committed to one symbol (fraction)
    pub max_position_fraction: f64,
}

/// Parameters the adaptive optimizer is allowed to tune, persisted per account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveParameters {
    pub thresholds: SignalThresholds,
    pub risk: RiskLimits,
    /// Relative sizing multiplier per strategy id; missing strategies weigh 1.0
    #[serde(default)]
    pub strategy_weights: BTreeMap<String, f64>,
    /// Base fraction of equity per new position
    pub position_fraction: f64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for ActiveParameters {
    fn default() -> Self {
        Self {
            thresholds: SignalThresholds {
                min_strength: 40.0,
                min_confidence: 0.5,
            },
            risk: RiskLimits {
                max_risk_score: 80.0,
                max_position_fraction: 0.10,
            },
            strategy_weights: BTreeMap::new(),
            position_fraction: 0.02,
            updated_at: None,
        }
    }
}

impl ActiveParameters {
    pub fn strategy_weight(&self, strategy_id: &str) -> f64 {
        self.strategy_weights.get(strategy_id).copied().unwrap_or(1.0)
    }

    /// Sizing fraction actually used: never above the risk cap.
    pub fn effective_position_fraction(&self) -> f64 {
        self.position_fraction.min(self.risk.max_position_fraction)
    }

    pub fn get(&self, parameter: &str) -> Option<f64> {
        match parameter {
            MIN_STRENGTH => Some(self.thresholds.min_strength),
            MIN_CONFIDENCE => Some(self.thresholds.min_confidence),
            MAX_RISK_SCORE => Some(self.risk.max_risk_score),
            MAX_POSITION_FRACTION => Some(self.risk.max_position_fraction),
            POSITION_FRACTION => Some(self.position_fraction),
            other => other
                .strip_prefix(WEIGHT_PREFIX)
                .map(|strategy| self.strategy_weight(strategy)),
        }
    }

    pub fn set(&mut self, parameter: &str, value: f64) -> Result<(), SignalError> {
        if !value.is_finite() {
            return Err(SignalError::InvalidInput(format!(
                "{parameter} must be finite, got {value}"
            )));
        }
        match parameter {
            MIN_STRENGTH => self.thresholds.min_strength = value.clamp(0.0, 100.0),
            MIN_CONFIDENCE => self.thresholds.min_confidence = value.clamp(0.0, 1.0),
            MAX_RISK_SCORE => self.risk.max_risk_score = value.clamp(0.0, 100.0),
            MAX_POSITION_FRACTION => self.risk.max_position_fraction = value.clamp(0.0, 1.0),
            POSITION_FRACTION => self.position_fraction = value.clamp(0.0, 1.0),
            other => match other.strip_prefix(WEIGHT_PREFIX) {
                Some(strategy) if !strategy.is_empty() => {
                    self.strategy_weights
                        .insert(strategy.to_string(), value.max(0.0));
                }
                _ => {
                    return Err(SignalError::InvalidInput(format!(
                        "unknown parameter '{parameter}'"
                    )))
                }
            },
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterAdjustment {
    pub current: f64,
    pub proposed: f64,
    pub reason: String,
}

/// Statistical basis a proposal was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalBasis {
    pub sample_size: usize,
    pub window_days: i64,
    pub win_rate: f64,
    pub min_sample: usize,
}

/// One record per optimizer run. Advisory until `applied` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationProposal {
    pub id: String,
    pub account_id: String,
    pub created_at: DateTime<Utc>,
    pub adjustments: BTreeMap<String, ParameterAdjustment>,
    /// Sub-proposals that declined to act, keyed by area, with the reason
    pub declined: BTreeMap<String, String>,
    pub basis: ProposalBasis,
    pub applied: bool,
    pub applied_at: Option<DateTime<Utc>>,
}

impl OptimizationProposal {
    pub fn has_changes(&self) -> bool {
        !self.adjustments.is_empty()
    }
}
