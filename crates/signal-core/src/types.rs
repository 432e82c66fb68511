use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SignalError;

/// Trade direction. For EXIT/REDUCE signals this is the side of the position being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// +1.0 for long, -1.0 for short.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// Side held by a signed position quantity, `None` when flat.
    pub fn of_quantity(quantity: f64) -> Option<Self> {
        if quantity > 0.0 {
            Some(Self::Long)
        } else if quantity < 0.0 {
            Some(Self::Short)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = SignalError;

    /// Accepts the strategy vocabulary as well ("BUY", "bullish", ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LONG" | "BUY" | "BULLISH" | "UP" => Ok(Self::Long),
            "SHORT" | "SELL" | "BEARISH" | "DOWN" => Ok(Self::Short),
            other => Err(SignalError::InvalidInput(format!("unknown direction '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    Entry,
    Add,
    Exit,
    Reduce,
    Hedge,
}

impl SignalType {
    /// EXIT and REDUCE shrink exposure.
    pub fn reduces_exposure(self) -> bool {
        matches!(self, Self::Exit | Self::Reduce)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "ENTRY",
            Self::Add => "ADD",
            Self::Exit => "EXIT",
            Self::Reduce => "REDUCE",
            Self::Hedge => "HEDGE",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status. Transitions are enforced by [`SignalStatus::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalStatus {
    Generated,
    Validated,
    Rejected,
    Queued,
    Executing,
    Executed,
    Failed,
    Cancelled,
    Expired,
}

impl SignalStatus {
    pub const ALL: [SignalStatus; 9] = [
        Self::Generated,
        Self::Validated,
        Self::Rejected,
        Self::Queued,
        Self::Executing,
        Self::Executed,
        Self::Failed,
        Self::Cancelled,
        Self::Expired,
    ];

    /// Statuses that still await a decision.
    pub const PENDING: [SignalStatus; 2] = [Self::Generated, Self::Validated];

    /// Statuses that hold the per-(account, symbol, direction) execution slot.
    pub const ACTIVE: [SignalStatus; 2] = [Self::Queued, Self::Executing];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Executed | Self::Rejected | Self::Cancelled | Self::Failed | Self::Expired
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Executing)
    }

    pub fn can_transition_to(self, next: SignalStatus) -> bool {
        use SignalStatus::*;
        match (self, next) {
            (Generated, Validated)
            | (Generated, Rejected)
            | (Validated, Rejected)
            | (Validated, Queued)
            | (Queued, Executing)
            | (Queued, Cancelled)
            | (Queued, Failed)
            | (Executing, Executed)
            | (Executing, Failed) => true,
            (from, Expired) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generated => "GENERATED",
            Self::Validated => "VALIDATED",
            Self::Rejected => "REJECTED",
            Self::Queued => "QUEUED",
            Self::Executing => "EXECUTING",
            Self::Executed => "EXECUTED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalStatus {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SignalError::InvalidInput(format!("unknown status '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalSource {
    Technical,
    Fundamental,
    Quantitative,
    Sentiment,
    Composite,
}

impl SignalSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Technical => "TECHNICAL",
            Self::Fundamental => "FUNDAMENTAL",
            Self::Quantitative => "QUANTITATIVE",
            Self::Sentiment => "SENTIMENT",
            Self::Composite => "COMPOSITE",
        }
    }
}

impl fmt::Display for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalSource {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TECHNICAL" => Ok(Self::Technical),
            "FUNDAMENTAL" => Ok(Self::Fundamental),
            "QUANTITATIVE" | "QUANT" => Ok(Self::Quantitative),
            "SENTIMENT" => Ok(Self::Sentiment),
            "COMPOSITE" => Ok(Self::Composite),
            other => Err(SignalError::InvalidInput(format!("unknown source '{other}'"))),
        }
    }
}

/// Typed per-signal annotations plus an open map for forward-compatible extras.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_reason: Option<String>,
    /// Type before the position filter reclassified the signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_signal_type: Option<SignalType>,
    /// Quantity before the position filter clamped it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_quantity: Option<f64>,
    #[serde(default, flatten)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

/// Present once the signal reached EXECUTED or FAILED.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionDetails {
    pub executed_price: Option<f64>,
    pub executed_quantity: Option<f64>,
    pub slippage: Option<f64>,
    pub order_reference: Option<String>,
    pub error: Option<String>,
    pub dry_run: bool,
}

/// Present once an external close event was observed for an executed signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationDetails {
    pub exit_price: f64,
    pub closed_at: DateTime<Utc>,
    pub actual_return: f64,
    pub realized_pnl: f64,
    pub evaluation_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingSignal {
    pub id: String,
    pub account_id: String,

    pub signal_type: SignalType,
    pub direction: Direction,

    /// 0-100
    pub strength: f64,
    /// 0-1
    pub confidence: f64,
    /// 0-100
    pub risk_score: f64,
    /// Signed fraction
    pub expected_return: f64,

    pub symbol: String,
    pub suggested_quantity: f64,
    pub suggested_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,

    pub status: SignalStatus,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub execution: Option<ExecutionDetails>,
    #[serde(default)]
    pub evaluation: Option<EvaluationDetails>,

    pub strategy_id: String,
    pub strategy_run_id: String,
    pub source: SignalSource,

    #[serde(default)]
    pub metadata: SignalMetadata,
}

impl TradingSignal {
    /// Fresh GENERATED signal with a random id and the given time-to-live.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account_id: impl Into<String>,
        symbol: impl Into<String>,
        signal_type: SignalType,
        direction: Direction,
        strategy_id: impl Into<String>,
        strategy_run_id: impl Into<String>,
        generated_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.into(),
            signal_type,
            direction,
            strength: 0.0,
            confidence: 0.0,
            risk_score: 0.0,
            expected_return: 0.0,
            symbol: symbol.into(),
            suggested_quantity: 0.0,
            suggested_price: 0.0,
            stop_loss: 0.0,
            take_profit: 0.0,
            status: SignalStatus::Generated,
            generated_at,
            expires_at: generated_at + ttl,
            executed_at: None,
            execution: None,
            evaluation: None,
            strategy_id: strategy_id.into(),
            strategy_run_id: strategy_run_id.into(),
            source: SignalSource::Composite,
            metadata: SignalMetadata::default(),
        }
    }

    /// Move to `next`, refusing any edge outside the lifecycle graph.
    pub fn transition(&mut self, next: SignalStatus) -> Result<(), SignalError> {
        if !self.status.can_transition_to(next) {
            return Err(SignalError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Key of the at-most-one-in-flight invariant.
    pub fn slot_key(&self) -> (&str, &str, Direction) {
        (&self.account_id, &self.symbol, self.direction)
    }

    /// Expiry applies to every non-terminal status except EXECUTING; an order in
    /// flight is resolved by the broker timeout instead.
    pub fn is_due_for_expiry(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.status != SignalStatus::Executing && now > self.expires_at
    }

    /// Marks the signal EXPIRED when due. Returns whether it changed.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_due_for_expiry(now) {
            self.status = SignalStatus::Expired;
            true
        } else {
            false
        }
    }

    /// Side of the order this signal trades: its own direction for new exposure, the
    /// opposite side when it closes or shrinks a position.
    pub fn order_direction(&self) -> Direction {
        if self.signal_type.reduces_exposure() {
            self.direction.opposite()
        } else {
            self.direction
        }
    }

    pub fn slippage(&self) -> Option<f64> {
        self.execution.as_ref().and_then(|e| e.slippage)
    }

    pub fn executed_price(&self) -> Option<f64> {
        self.execution.as_ref().and_then(|e| e.executed_price)
    }
}
