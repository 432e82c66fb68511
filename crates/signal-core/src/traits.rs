use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::candidate::StrategyRun;
use crate::outcome::{ActiveParameters, OptimizationProposal, SignalPerformance};
use crate::types::{SignalStatus, TradingSignal};

/// Read-only access to finished strategy runs.
#[async_trait]
pub trait StrategyRunSource: Send + Sync {
    /// Latest completed run for a strategy (None if the strategy never ran)
    async fn get_latest_run(&self, strategy_id: &str) -> Result<Option<StrategyRun>>;
}

/// Outcome of the guarded VALIDATED -> QUEUED step.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Queued(TradingSignal),
    /// Another signal already holds the (account, symbol, direction) slot
    SlotBusy { holder_id: String },
    /// The signal is not VALIDATED (or expired on read)
    NotEligible(SignalStatus),
    NotFound,
}

/// Persisted TradingSignal records.
///
/// Reads apply lazy expiry: a signal past `expires_at` is stored and returned as EXPIRED.
/// Every status write is conditional on the status the writer last read, so concurrent
/// writers to one signal id are serialized.
#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn insert_signal(&self, signal: &TradingSignal) -> Result<()>;

    async fn get_signal(&self, id: &str) -> Result<Option<TradingSignal>>;

    /// Signals of an account whose status is in `statuses` (all statuses when empty),
    /// oldest first.
    async fn list_signals(
        &self,
        account_id: &str,
        statuses: &[SignalStatus],
    ) -> Result<Vec<TradingSignal>>;

    /// Write `signal` only if the stored status still equals `expected`.
    /// Returns false when another writer got there first, or when the write would put a
    /// second signal into QUEUED/EXECUTING for the same slot.
    async fn save_if_status(&self, signal: &TradingSignal, expected: SignalStatus)
        -> Result<bool>;

    /// Atomic check-and-set of VALIDATED -> QUEUED guarded by the slot invariant.
    async fn try_enqueue(&self, id: &str) -> Result<EnqueueOutcome>;

    /// Eager expiry sweep. Returns the ids that were expired.
    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<String>>;
}

/// Derived records: performance rows, optimizer proposals and tuned parameters.
#[async_trait]
pub trait OutcomeStore: Send + Sync {
    /// Insert or overwrite the row keyed by `signal_id`.
    async fn upsert_performance(&self, row: &SignalPerformance) -> Result<()>;

    async fn list_performance(&self, account_id: &str) -> Result<Vec<SignalPerformance>>;

    /// Insert or overwrite by proposal id.
    async fn save_proposal(&self, proposal: &OptimizationProposal) -> Result<()>;

    async fn get_proposal(&self, id: &str) -> Result<Option<OptimizationProposal>>;

    async fn latest_proposal(&self, account_id: &str) -> Result<Option<OptimizationProposal>>;

    async fn load_parameters(&self, account_id: &str) -> Result<Option<ActiveParameters>>;

    async fn save_parameters(&self, account_id: &str, params: &ActiveParameters) -> Result<()>;
}
