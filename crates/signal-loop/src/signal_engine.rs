use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use broker_trait::Position;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use signal_core::scoring;
use signal_core::{
    ActiveParameters, Candidate, Direction, SignalError, SignalSource, SignalStatus, SignalStore,
    SignalType, StrategyRun, TradingSignal,
};

use crate::config::EngineConfig;
use crate::position_filter::PositionSnapshot;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationCounts {
    pub generated: usize,
    pub rejected: usize,
    pub dropped: usize,
    pub duplicates: usize,
}

impl GenerationCounts {
    pub fn merge(&mut self, other: &GenerationCounts) {
        self.generated += other.generated;
        self.rejected += other.rejected;
        self.dropped += other.dropped;
        self.duplicates += other.duplicates;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroppedCandidate {
    pub symbol: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationOutcome {
    /// Persisted with status GENERATED
    pub signals: Vec<TradingSignal>,
    /// Persisted with status REJECTED for audit
    pub rejected: Vec<TradingSignal>,
    pub dropped: Vec<DroppedCandidate>,
    pub counts: GenerationCounts,
}

/// Statuses that still occupy a (symbol, direction) for deduplication.
const OPEN_STATUSES: [SignalStatus; 4] = [
    SignalStatus::Generated,
    SignalStatus::Validated,
    SignalStatus::Queued,
    SignalStatus::Executing,
];

/// Converts strategy candidates into typed, scored, deduplicated signals.
pub struct SignalEngine {
    store: Arc<dyn SignalStore>,
    config: EngineConfig,
}

struct ParsedCandidate<'a> {
    symbol: String,
    direction: Direction,
    strength: f64,
    candidate: &'a Candidate,
}

impl SignalEngine {
    pub fn new(store: Arc<dyn SignalStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub async fn generate(
        &self,
        account_id: &str,
        run: &StrategyRun,
        snapshot: &PositionSnapshot,
        equity: f64,
        params: &ActiveParameters,
    ) -> Result<GenerationOutcome, SignalError> {
        let mut outcome = GenerationOutcome::default();

        let parsed = self.dedupe(run, &mut outcome);

        let open: HashSet<(String, Direction)> = self
            .store
            .list_signals(account_id, &OPEN_STATUSES)
            .await
            .map_err(SignalError::storage)?
            .into_iter()
            .map(|s| (s.symbol, s.direction))
            .collect();

        let now = Utc::now();
        for item in parsed {
            let position = snapshot.get(&item.symbol);
            let mut signal =
                match self.build_signal(account_id, run, &item, position, equity, params, now) {
                    Ok(signal) => signal,
                    Err(reason) => {
                        tracing::warn!(
                            "Dropping candidate {} from run {}: {}",
                            item.symbol,
                            run.run_id,
                            reason
                        );
                        outcome.dropped.push(DroppedCandidate {
                            symbol: Some(item.symbol),
                            reason,
                        });
                        continue;
                    }
                };

            if open.contains(&(signal.symbol.clone(), signal.direction)) {
                tracing::debug!(
                    "Skipping {} {}: an open signal already covers it",
                    signal.symbol,
                    signal.direction
                );
                outcome.counts.duplicates += 1;
                continue;
            }

            if let Some(reason) = Self::validate(&signal, params) {
                signal.transition(SignalStatus::Rejected)?;
                signal.metadata.rejection_reason = Some(reason);
                self.store
                    .insert_signal(&signal)
                    .await
                    .map_err(SignalError::storage)?;
                outcome.rejected.push(signal);
                continue;
            }

            self.store
                .insert_signal(&signal)
                .await
                .map_err(SignalError::storage)?;
            outcome.signals.push(signal);
        }

        outcome.counts.generated = outcome.signals.len();
        outcome.counts.rejected = outcome.rejected.len();
        outcome.counts.dropped = outcome.dropped.len();

        tracing::info!(
            account_id,
            strategy_id = %run.strategy_id,
            run_id = %run.run_id,
            generated = outcome.counts.generated,
            rejected = outcome.counts.rejected,
            dropped = outcome.counts.dropped,
            duplicates = outcome.counts.duplicates,
            "Signal generation complete"
        );

        Ok(outcome)
    }

    /// Parse candidates and keep the strongest per symbol, in first-seen order.
    fn dedupe<'a>(
        &self,
        run: &'a StrategyRun,
        outcome: &mut GenerationOutcome,
    ) -> Vec<ParsedCandidate<'a>> {
        let mut kept: Vec<ParsedCandidate<'a>> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for candidate in &run.candidates {
            let symbol = match candidate.symbol.as_deref().map(str::trim) {
                Some(s) if !s.is_empty() => s.to_ascii_uppercase(),
                _ => {
                    tracing::warn!("Dropping candidate from run {}: missing symbol", run.run_id);
                    outcome.dropped.push(DroppedCandidate {
                        symbol: None,
                        reason: "missing symbol".to_string(),
                    });
                    continue;
                }
            };
            let direction = match candidate.direction.as_deref().map(str::parse::<Direction>) {
                Some(Ok(direction)) => direction,
                Some(Err(e)) => {
                    tracing::warn!("Dropping candidate {}: {}", symbol, e);
                    outcome.dropped.push(DroppedCandidate {
                        symbol: Some(symbol),
                        reason: e.to_string(),
                    });
                    continue;
                }
                None => {
                    tracing::warn!("Dropping candidate {}: missing direction", symbol);
                    outcome.dropped.push(DroppedCandidate {
                        symbol: Some(symbol),
                        reason: "missing direction".to_string(),
                    });
                    continue;
                }
            };

            let parsed = ParsedCandidate {
                strength: scoring::normalize_strength(candidate.strength),
                symbol,
                direction,
                candidate,
            };
            match index.get(&parsed.symbol) {
                Some(&i) => {
                    outcome.counts.duplicates += 1;
                    if parsed.strength > kept[i].strength {
                        kept[i] = parsed;
                    }
                }
                None => {
                    index.insert(parsed.symbol.clone(), kept.len());
                    kept.push(parsed);
                }
            }
        }
        kept
    }

    /// Type inference, scoring and sizing for one candidate. `Err` carries the drop reason.
    #[allow(clippy::too_many_arguments)]
    fn build_signal(
        &self,
        account_id: &str,
        run: &StrategyRun,
        item: &ParsedCandidate<'_>,
        position: Option<&Position>,
        equity: f64,
        params: &ActiveParameters,
        now: DateTime<Utc>,
    ) -> Result<TradingSignal, String> {
        let meta = &item.candidate.metadata;
        let held = position.and_then(|p| Direction::of_quantity(p.quantity));

        let (signal_type, direction) = match (meta.intent, held) {
            (Some(SignalType::Reduce), Some(side)) => (SignalType::Reduce, side),
            (Some(SignalType::Reduce), None) => (SignalType::Reduce, item.direction),
            (Some(SignalType::Hedge), _) => (SignalType::Hedge, item.direction),
            (_, None) => (SignalType::Entry, item.direction),
            (_, Some(side)) if side == item.direction => (SignalType::Add, item.direction),
            (_, Some(side)) => (SignalType::Exit, side),
        };

        let price = meta
            .price
            .filter(|p| p.is_finite() && *p > 0.0)
            .or_else(|| position.and_then(Position::reference_price))
            .ok_or_else(|| "no reference price".to_string())?;

        let mut signal = TradingSignal::new(
            account_id,
            item.symbol.clone(),
            signal_type,
            direction,
            run.strategy_id.clone(),
            run.run_id.clone(),
            now,
            self.config.signal_ttl(),
        );

        signal.strength = item.strength;
        signal.confidence = scoring::clamp_confidence(item.candidate.confidence);
        signal.risk_score = match meta.risk_score.filter(|r| r.is_finite()) {
            Some(r) => r.clamp(0.0, 100.0),
            None => scoring::risk_score(meta.volatility, signal.confidence),
        };
        signal.source = meta
            .source
            .as_deref()
            .and_then(|s| s.parse::<SignalSource>().ok())
            .unwrap_or(SignalSource::Composite);
        signal.metadata.extensions = meta.extra.clone();

        signal.suggested_price = price;
        let (stop_loss, take_profit) = self.protective_levels(direction, price);
        signal.stop_loss = meta.stop_loss.filter(|p| *p > 0.0).unwrap_or(stop_loss);
        signal.take_profit = meta.take_profit.filter(|p| *p > 0.0).unwrap_or(take_profit);
        signal.expected_return = meta.expected_return.unwrap_or_else(|| {
            scoring::expected_return(
                signal.confidence,
                (signal.take_profit - price) / price,
                (price - signal.stop_loss) / price,
            )
        });

        let held_size = position.map(Position::abs_quantity).unwrap_or(0.0);
        let requested = meta.quantity.filter(|q| q.is_finite() && *q > 0.0);
        signal.suggested_quantity = match signal_type {
            SignalType::Exit => held_size,
            SignalType::Reduce => requested.unwrap_or_else(|| (held_size / 2.0).ceil()),
            _ => {
                let room = Self::max_quantity(equity, params, price, held_size);
                let quantity = match requested {
                    Some(q) => q.min(room),
                    None => {
                        Self::entry_quantity(equity, params, &run.strategy_id, price, held_size)
                    }
                };
                if quantity <= 0.0 {
                    return Err("no whole share fits under the per-symbol cap".to_string());
                }
                quantity
            }
        };

        Ok(signal)
    }

    /// Whole shares of `strategy_id` sized at min(fraction * weight, cap) of equity,
    /// never pushing the symbol's exposure past the cap. Zero when nothing fits.
    pub fn entry_quantity(
        equity: f64,
        params: &ActiveParameters,
        strategy_id: &str,
        price: f64,
        held_size: f64,
    ) -> f64 {
        if price <= 0.0 || !equity.is_finite() || equity <= 0.0 {
            return 0.0;
        }
        let fraction = (params.effective_position_fraction() * params.strategy_weight(strategy_id))
            .min(params.risk.max_position_fraction);
        let sized = (equity * fraction / price).floor();
        sized.min(Self::max_quantity(equity, params, price, held_size)).max(0.0)
    }

    /// Whole shares still available under `risk.max_position_fraction` for one symbol.
    pub fn max_quantity(equity: f64, params: &ActiveParameters, price: f64, held_size: f64) -> f64 {
        if price <= 0.0 || !equity.is_finite() || equity <= 0.0 {
            return 0.0;
        }
        let room = equity * params.risk.max_position_fraction - held_size * price;
        (room / price).floor().max(0.0)
    }

    /// Default stop-loss / take-profit around `price`, on the losing and winning side.
    fn protective_levels(&self, direction: Direction, price: f64) -> (f64, f64) {
        let stop = self.config.default_stop_loss_pct;
        let target = self.config.default_take_profit_pct;
        match direction {
            Direction::Long => (price * (1.0 - stop), price * (1.0 + target)),
            Direction::Short => (price * (1.0 + stop), price * (1.0 - target)),
        }
    }

    /// Risk/quality gate. Returns the rejection reason, if any.
    pub fn validate(signal: &TradingSignal, params: &ActiveParameters) -> Option<String> {
        if signal.risk_score > params.risk.max_risk_score {
            return Some(format!(
                "risk score {:.1} above ceiling {:.1}",
                signal.risk_score, params.risk.max_risk_score
            ));
        }
        if signal.confidence < params.thresholds.min_confidence {
            return Some(format!(
                "confidence {:.2} below floor {:.2}",
                signal.confidence, params.thresholds.min_confidence
            ));
        }
        if signal.strength < params.thresholds.min_strength {
            return Some(format!(
                "strength {:.1} below threshold {:.1}",
                signal.strength, params.thresholds.min_strength
            ));
        }
        None
    }
}
