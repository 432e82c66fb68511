use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::SignalType;

/// A completed strategy run as delivered by the strategy run source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRun {
    pub run_id: String,
    pub strategy_id: String,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

/// One scored asset from a strategy run. Symbol and direction are optional on the
/// wire; candidates missing either are dropped by the signal engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Candidate {
    pub symbol: Option<String>,
    pub direction: Option<String>,
    /// Raw strength, either 0-1 or 0-100.
    #[serde(default)]
    pub strength: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub metadata: CandidateMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateMetadata {
    pub price: Option<f64>,
    /// Daily volatility as a fraction (0.02 = 2%).
    pub volatility: Option<f64>,
    pub risk_score: Option<f64>,
    pub expected_return: Option<f64>,
    pub quantity: Option<f64>,
    pub source: Option<String>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Explicit REDUCE or HEDGE request; other types are inferred from positions.
    pub intent: Option<SignalType>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Candidate {
    pub fn new(symbol: &str, direction: &str, strength: f64, confidence: f64) -> Self {
        Self {
            symbol: Some(symbol.to_string()),
            direction: Some(direction.to_string()),
            strength,
            confidence,
            metadata: CandidateMetadata::default(),
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.metadata.price = Some(price);
        self
    }

    pub fn with_quantity(mut self, quantity: f64) -> Self {
        self.metadata.quantity = Some(quantity);
        self
    }

    pub fn with_intent(mut self, intent: SignalType) -> Self {
        self.metadata.intent = Some(intent);
        self
    }
}
