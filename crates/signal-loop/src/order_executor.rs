use std::collections::HashMap;
use std::sync::Arc;

use broker_trait::{OrderRequest, OrderSink, PositionSource};
use chrono::Utc;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use signal_core::scoring;
use signal_core::{
    Direction, EnqueueOutcome, ExecutionDetails, SignalError, SignalStatus, SignalStore,
    TradingSignal,
};

use crate::config::{ExecutionMode, ExecutorConfig};
use crate::position_filter::PositionSnapshot;

const TERMINAL_WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Executed,
    Failed,
    /// Not attempted; the signal keeps its stored status
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub signal_id: String,
    pub symbol: String,
    pub status: ExecutionStatus,
    pub executed_price: Option<f64>,
    pub executed_quantity: Option<f64>,
    pub slippage: Option<f64>,
    pub order_reference: Option<String>,
    /// Failure or skip reason
    pub error: Option<String>,
    pub dry_run: bool,
}

impl ExecutionResult {
    fn skipped(signal: &TradingSignal, reason: impl Into<String>) -> Self {
        Self {
            signal_id: signal.id.clone(),
            symbol: signal.symbol.clone(),
            status: ExecutionStatus::Skipped,
            executed_price: None,
            executed_quantity: None,
            slippage: None,
            order_reference: None,
            error: Some(reason.into()),
            dry_run: false,
        }
    }

    fn from_signal(signal: &TradingSignal) -> Self {
        let details = signal.execution.clone().unwrap_or_default();
        Self {
            signal_id: signal.id.clone(),
            symbol: signal.symbol.clone(),
            status: if signal.status == SignalStatus::Executed {
                ExecutionStatus::Executed
            } else {
                ExecutionStatus::Failed
            },
            executed_price: details.executed_price,
            executed_quantity: details.executed_quantity,
            slippage: details.slippage,
            order_reference: details.order_reference,
            error: details.error,
            dry_run: details.dry_run,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchExecutionResult {
    pub results: Vec<ExecutionResult>,
    pub executed_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    /// Eligible signals left for a later batch by the order limit
    pub deferred_count: usize,
}

impl BatchExecutionResult {
    fn push(&mut self, result: ExecutionResult) {
        match result.status {
            ExecutionStatus::Executed => self.executed_count += 1,
            ExecutionStatus::Failed => self.failed_count += 1,
            ExecutionStatus::Skipped => self.skipped_count += 1,
        }
        self.results.push(result);
    }
}

/// Submits validated signals to the broker, one guarded status transition at a time.
pub struct OrderExecutor {
    store: Arc<dyn SignalStore>,
    positions: Arc<dyn PositionSource>,
    broker: Arc<dyn OrderSink>,
    config: ExecutorConfig,
}

impl OrderExecutor {
    pub fn new(
        store: Arc<dyn SignalStore>,
        positions: Arc<dyn PositionSource>,
        broker: Arc<dyn OrderSink>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            positions,
            broker,
            config,
        }
    }

    pub fn priority(signal: &TradingSignal) -> f64 {
        scoring::execution_priority(signal.signal_type, signal.strength, signal.confidence)
    }

    /// Execute up to `max_orders` eligible signals, highest priority first.
    ///
    /// One signal's failure never aborts the batch.
    pub async fn execute_batch(
        &self,
        mut signals: Vec<TradingSignal>,
        mode: ExecutionMode,
        max_orders: usize,
    ) -> BatchExecutionResult {
        signals.sort_by(|a, b| {
            Self::priority(b)
                .total_cmp(&Self::priority(a))
                .then(a.generated_at.cmp(&b.generated_at))
        });

        let mut batch = BatchExecutionResult::default();
        let mut snapshots: HashMap<String, Option<PositionSnapshot>> = HashMap::new();
        let mut submitted = 0usize;

        for signal in signals {
            if !matches!(signal.status, SignalStatus::Validated | SignalStatus::Queued) {
                batch.push(ExecutionResult::skipped(
                    &signal,
                    format!("not eligible ({})", signal.status),
                ));
                continue;
            }
            if submitted >= max_orders {
                batch.deferred_count += 1;
                continue;
            }

            if !snapshots.contains_key(&signal.account_id) {
                let snapshot = match self.positions.get_positions(&signal.account_id).await {
                    Ok(positions) => Some(PositionSnapshot::new(positions)),
                    Err(e) => {
                        tracing::warn!(
                            "Position snapshot unavailable for {}: {}",
                            signal.account_id,
                            e
                        );
                        None
                    }
                };
                snapshots.insert(signal.account_id.clone(), snapshot);
            }
            let snapshot = snapshots.get(&signal.account_id).and_then(Option::as_ref);

            let result = self.execute_one(signal, snapshot, mode).await;
            // Slot conflicts and lost claims do not use up the order budget
            if result.status != ExecutionStatus::Skipped {
                submitted += 1;
            }
            batch.push(result);
        }

        tracing::info!(
            mode = %mode,
            executed = batch.executed_count,
            failed = batch.failed_count,
            skipped = batch.skipped_count,
            deferred = batch.deferred_count,
            "Execution batch complete"
        );

        batch
    }

    async fn execute_one(
        &self,
        signal: TradingSignal,
        snapshot: Option<&PositionSnapshot>,
        mode: ExecutionMode,
    ) -> ExecutionResult {
        // 1. VALIDATED -> QUEUED under the slot guard
        let queued = if signal.status == SignalStatus::Validated {
            match self.store.try_enqueue(&signal.id).await {
                Ok(EnqueueOutcome::Queued(queued)) => queued,
                Ok(EnqueueOutcome::SlotBusy { holder_id }) => {
                    return ExecutionResult::skipped(&signal, format!("slot held by {holder_id}"))
                }
                Ok(EnqueueOutcome::NotEligible(status)) => {
                    return ExecutionResult::skipped(&signal, format!("not eligible ({status})"))
                }
                Ok(EnqueueOutcome::NotFound) => {
                    return ExecutionResult::skipped(&signal, "signal not found")
                }
                Err(e) => return ExecutionResult::skipped(&signal, format!("store error: {e}")),
            }
        } else {
            signal
        };

        // 2. QUEUED -> EXECUTING compare-and-set
        let mut executing = queued.clone();
        if let Err(e) = executing.transition(SignalStatus::Executing) {
            return ExecutionResult::skipped(&queued, e.to_string());
        }
        match self.store.save_if_status(&executing, SignalStatus::Queued).await {
            Ok(true) => {}
            Ok(false) => {
                return ExecutionResult::skipped(&queued, "claimed by another executor");
            }
            Err(e) => return ExecutionResult::skipped(&queued, format!("store error: {e}")),
        }

        // 3. Order parameters and submission
        let quantity = Self::order_quantity(&executing, snapshot);
        let outcome = if quantity <= 0.0 {
            Err(SignalError::ExecutionFailure("no quantity to trade".to_string()))
        } else {
            self.submit(&executing, quantity, mode).await
        };

        // 4./5. Terminal status
        let mut done = executing.clone();
        match outcome {
            Ok(details) => {
                done.executed_at = Some(Utc::now());
                done.execution = Some(details);
                done.status = SignalStatus::Executed;
                tracing::info!(
                    "Executed {} {} {} x{} @ {:.4}",
                    done.signal_type,
                    done.direction,
                    done.symbol,
                    quantity,
                    done.executed_price().unwrap_or_default()
                );
            }
            Err(e) => {
                tracing::warn!("Execution of {} ({}) failed: {}", done.id, done.symbol, e);
                done.execution = Some(ExecutionDetails {
                    error: Some(e.to_string()),
                    dry_run: mode == ExecutionMode::DryRun,
                    ..ExecutionDetails::default()
                });
                done.status = SignalStatus::Failed;
            }
        }

        self.persist_terminal(done).await
    }

    /// Write the EXECUTED/FAILED outcome, retrying store errors, then falling back to a
    /// bare FAILED write. The result reflects what was actually stored.
    async fn persist_terminal(&self, done: TradingSignal) -> ExecutionResult {
        let mut last_error = String::new();
        for attempt in 1..=TERMINAL_WRITE_ATTEMPTS {
            match self.store.save_if_status(&done, SignalStatus::Executing).await {
                Ok(true) => return ExecutionResult::from_signal(&done),
                Ok(false) => return self.stored_outcome(&done).await,
                Err(e) => {
                    tracing::warn!(
                        "Persisting {} for {} failed (attempt {}/{}): {}",
                        done.status,
                        done.id,
                        attempt,
                        TERMINAL_WRITE_ATTEMPTS,
                        e
                    );
                    last_error = e.to_string();
                }
            }
        }

        let mut failed = done.clone();
        failed.status = SignalStatus::Failed;
        let details = failed.execution.get_or_insert_with(ExecutionDetails::default);
        details.error = Some(format!("result not persisted: {last_error}"));

        match self.store.save_if_status(&failed, SignalStatus::Executing).await {
            Ok(true) => ExecutionResult::from_signal(&failed),
            Ok(false) => self.stored_outcome(&done).await,
            Err(e) => {
                tracing::error!("Signal {} is stuck in EXECUTING: {}", done.id, e);
                let mut result = ExecutionResult::from_signal(&failed);
                result.error = Some(format!("signal left EXECUTING: {e}"));
                result
            }
        }
    }

    /// Result built from the stored record after a conditional write lost the race.
    async fn stored_outcome(&self, done: &TradingSignal) -> ExecutionResult {
        match self.store.get_signal(&done.id).await {
            Ok(Some(stored))
                if matches!(stored.status, SignalStatus::Executed | SignalStatus::Failed) =>
            {
                ExecutionResult::from_signal(&stored)
            }
            Ok(stored) => {
                let status = stored.map(|s| s.status.to_string());
                tracing::warn!(
                    "Signal {} changed under the executor (stored: {:?})",
                    done.id,
                    status
                );
                let mut result = ExecutionResult::from_signal(done);
                result.status = ExecutionStatus::Failed;
                result.error = Some(format!(
                    "outcome not recorded, stored status {}",
                    status.as_deref().unwrap_or("missing")
                ));
                result
            }
            Err(e) => {
                let mut result = ExecutionResult::from_signal(done);
                result.status = ExecutionStatus::Failed;
                result.error = Some(format!("outcome not recorded: {e}"));
                result
            }
        }
    }

    /// Suggested size, capped by what is actually held for exit/reduce.
    fn order_quantity(signal: &TradingSignal, snapshot: Option<&PositionSnapshot>) -> f64 {
        let requested = signal.suggested_quantity.max(0.0);
        if !signal.signal_type.reduces_exposure() {
            return requested;
        }
        let Some(snapshot) = snapshot else {
            return requested;
        };
        let held = snapshot
            .get(&signal.symbol)
            .filter(|p| Direction::of_quantity(p.quantity) == Some(signal.direction))
            .map(|p| p.abs_quantity())
            .unwrap_or(0.0);
        requested.min(held)
    }

    async fn submit(
        &self,
        signal: &TradingSignal,
        quantity: f64,
        mode: ExecutionMode,
    ) -> Result<ExecutionDetails, SignalError> {
        if mode == ExecutionMode::DryRun {
            return Ok(ExecutionDetails {
                executed_price: Some(signal.suggested_price),
                executed_quantity: Some(quantity),
                slippage: Some(0.0),
                order_reference: Some(format!("dry-run-{}", uuid::Uuid::new_v4())),
                error: None,
                dry_run: true,
            });
        }

        let qty = Decimal::from_f64(quantity)
            .ok_or_else(|| SignalError::InvalidInput(format!("bad quantity {quantity}")))?;
        let mut order = match signal.order_direction() {
            Direction::Long => OrderRequest::buy(&signal.symbol, qty),
            Direction::Short => OrderRequest::sell(&signal.symbol, qty),
        }
        .with_client_order_id(&signal.id);
        if let Some(price) = Decimal::from_f64(signal.suggested_price).filter(|p| *p > Decimal::ZERO)
        {
            order = order.with_price_hint(price);
        }

        tracing::debug!(
            "Submitting {:?} {} x{} via {} (paper: {})",
            order.side,
            signal.symbol,
            quantity,
            self.broker.broker_name(),
            self.broker.is_paper()
        );
        let timeout = self.config.broker_timeout;
        let fill = match tokio::time::timeout(
            timeout,
            self.broker.submit_order(&signal.account_id, order),
        )
        .await
        {
            Ok(Ok(fill)) => fill,
            Ok(Err(e)) => return Err(SignalError::ExecutionFailure(e.to_string())),
            Err(_) => return Err(SignalError::ExecutionTimeout(timeout)),
        };

        let price = fill.filled_price_f64();
        Ok(ExecutionDetails {
            executed_price: Some(price),
            executed_quantity: Some(fill.filled_qty_f64()),
            slippage: Some(scoring::slippage(signal.suggested_price, price)),
            order_reference: Some(fill.order_reference),
            error: None,
            dry_run: false,
        })
    }

    /// QUEUED -> CANCELLED.
    pub async fn cancel(&self, signal_id: &str) -> Result<TradingSignal, SignalError> {
        let signal = self
            .store
            .get_signal(signal_id)
            .await
            .map_err(SignalError::storage)?
            .ok_or_else(|| SignalError::NotFound(format!("signal {signal_id}")))?;

        let mut cancelled = signal.clone();
        cancelled.transition(SignalStatus::Cancelled)?;
        let saved = self
            .store
            .save_if_status(&cancelled, signal.status)
            .await
            .map_err(SignalError::storage)?;
        if !saved {
            let current = self
                .store
                .get_signal(signal_id)
                .await
                .map_err(SignalError::storage)?
                .map(|s| s.status)
                .unwrap_or(signal.status);
            return Err(SignalError::InvalidTransition {
                from: current,
                to: SignalStatus::Cancelled,
            });
        }
        tracing::info!("Cancelled signal {} ({})", signal_id, cancelled.symbol);
        Ok(cancelled)
    }
}
