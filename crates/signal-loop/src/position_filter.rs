use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use broker_trait::Position;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use signal_core::{Direction, SignalError, SignalStatus, SignalStore, SignalType, TradingSignal};

pub const REASON_AT_TARGET: &str = "already at or above target exposure";
pub const REASON_NOTHING_TO_EXIT: &str = "nothing to exit";
pub const REASON_NOTHING_TO_REDUCE: &str = "nothing to reduce";
pub const REASON_DIRECTION_MISMATCH: &str = "direction mismatch";
pub const REASON_OPPOSITE_POSITION: &str = "conflicting opposite position";
pub const REASON_EXPIRED: &str = "expired";

/// Point-in-time copy of an account's holdings. Never mutated after construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionSnapshot {
    positions: HashMap<String, Position>,
    pub taken_at: Option<DateTime<Utc>>,
}

impl PositionSnapshot {
    pub fn new(positions: Vec<Position>) -> Self {
        Self {
            positions: positions
                .into_iter()
                .filter(|p| !p.is_flat())
                .map(|p| (p.symbol.to_ascii_uppercase(), p))
                .collect(),
            taken_at: Some(Utc::now()),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(&symbol.to_ascii_uppercase())
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Decision for one signal against one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterVerdict {
    Pass,
    /// Pass after reclassification and/or quantity clamp
    Adjust {
        signal_type: SignalType,
        quantity: f64,
        note: String,
    },
    Reject { reason: String },
    Expire,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterStats {
    pub total: usize,
    pub passed: usize,
    pub filtered_out: usize,
    /// Passed after reclassification or clamping
    pub adjusted: usize,
    pub reasons: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilteredSignal {
    pub signal: TradingSignal,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterOutcome {
    pub passed: Vec<TradingSignal>,
    pub filtered: Vec<FilteredSignal>,
    pub stats: FilterStats,
}

impl FilterOutcome {
    fn pass(&mut self, signal: TradingSignal, adjusted: bool) {
        self.stats.total += 1;
        self.stats.passed += 1;
        if adjusted {
            self.stats.adjusted += 1;
        }
        self.passed.push(signal);
    }

    fn reject(&mut self, signal: TradingSignal, reason: String) {
        self.stats.total += 1;
        self.stats.filtered_out += 1;
        *self.stats.reasons.entry(reason.clone()).or_insert(0) += 1;
        self.filtered.push(FilteredSignal { signal, reason });
    }
}

/// Reconciles proposed signals with the holdings the broker actually reports.
pub struct PositionFilter {
    store: Arc<dyn SignalStore>,
}

impl PositionFilter {
    pub fn new(store: Arc<dyn SignalStore>) -> Self {
        Self { store }
    }

    /// Pure per-type rules.
    pub fn evaluate(
        signal: &TradingSignal,
        snapshot: &PositionSnapshot,
        now: DateTime<Utc>,
    ) -> FilterVerdict {
        if signal.is_due_for_expiry(now) {
            return FilterVerdict::Expire;
        }

        let position = snapshot.get(&signal.symbol);
        let held = position.and_then(|p| Direction::of_quantity(p.quantity));
        let held_size = position.map(Position::abs_quantity).unwrap_or(0.0);
        let reject = |reason: &str| FilterVerdict::Reject {
            reason: reason.to_string(),
        };

        match signal.signal_type {
            SignalType::Entry => match held {
                None => FilterVerdict::Pass,
                Some(side) if side != signal.direction => reject(REASON_OPPOSITE_POSITION),
                Some(_) if held_size >= signal.suggested_quantity => reject(REASON_AT_TARGET),
                Some(_) => FilterVerdict::Pass,
            },
            SignalType::Add => match held {
                None => FilterVerdict::Adjust {
                    signal_type: SignalType::Entry,
                    quantity: signal.suggested_quantity,
                    note: "no base position; reclassified ADD as ENTRY".to_string(),
                },
                Some(side) if side != signal.direction => reject(REASON_DIRECTION_MISMATCH),
                Some(_) => FilterVerdict::Pass,
            },
            SignalType::Exit => match held {
                None => reject(REASON_NOTHING_TO_EXIT),
                Some(side) if side != signal.direction => reject(REASON_DIRECTION_MISMATCH),
                Some(_) if signal.suggested_quantity > held_size
                    || signal.suggested_quantity <= 0.0 =>
                {
                    FilterVerdict::Adjust {
                        signal_type: SignalType::Exit,
                        quantity: held_size,
                        note: format!("exit clamped to held size {held_size}"),
                    }
                }
                Some(_) => FilterVerdict::Pass,
            },
            SignalType::Reduce => match held {
                None => reject(REASON_NOTHING_TO_REDUCE),
                Some(side) if side != signal.direction => reject(REASON_DIRECTION_MISMATCH),
                Some(_) if signal.suggested_quantity > held_size => FilterVerdict::Adjust {
                    signal_type: SignalType::Exit,
                    quantity: held_size,
                    note: format!(
                        "reduction of {} exceeds held size {}; clamped and reclassified EXIT",
                        signal.suggested_quantity, held_size
                    ),
                },
                Some(_) => FilterVerdict::Pass,
            },
            SignalType::Hedge => FilterVerdict::Pass,
        }
    }

    /// The signal as it looks after `verdict`. Pure; nothing is persisted.
    pub fn apply_verdict(
        signal: &TradingSignal,
        verdict: &FilterVerdict,
    ) -> Result<TradingSignal, SignalError> {
        let mut next = signal.clone();
        match verdict {
            FilterVerdict::Pass => {
                if next.status == SignalStatus::Generated {
                    next.transition(SignalStatus::Validated)?;
                }
            }
            FilterVerdict::Adjust {
                signal_type,
                quantity,
                note,
            } => {
                if next.metadata.original_signal_type.is_none() {
                    next.metadata.original_signal_type = Some(next.signal_type);
                }
                if next.metadata.original_quantity.is_none() {
                    next.metadata.original_quantity = Some(next.suggested_quantity);
                }
                next.signal_type = *signal_type;
                next.suggested_quantity = *quantity;
                next.metadata.filter_reason = Some(note.clone());
                if next.status == SignalStatus::Generated {
                    next.transition(SignalStatus::Validated)?;
                }
            }
            FilterVerdict::Reject { reason } => {
                next.transition(SignalStatus::Rejected)?;
                next.metadata.filter_reason = Some(reason.clone());
            }
            FilterVerdict::Expire => {
                next.transition(SignalStatus::Expired)?;
                next.metadata.filter_reason = Some(REASON_EXPIRED.to_string());
            }
        }
        Ok(next)
    }

    /// Evaluate every signal, persist the resulting transitions, and report counters.
    ///
    /// Signals that are no longer pending are reported as filtered with their recorded
    /// reason and left untouched, so a second pass yields the same outcome.
    pub async fn filter(
        &self,
        signals: Vec<TradingSignal>,
        snapshot: &PositionSnapshot,
    ) -> Result<FilterOutcome, SignalError> {
        let now = Utc::now();
        let mut outcome = FilterOutcome::default();

        for signal in signals {
            if !SignalStatus::PENDING.contains(&signal.status) {
                let reason = signal
                    .metadata
                    .filter_reason
                    .clone()
                    .or_else(|| signal.metadata.rejection_reason.clone())
                    .unwrap_or_else(|| format!("not pending ({})", signal.status));
                outcome.reject(signal, reason);
                continue;
            }

            let verdict = Self::evaluate(&signal, snapshot, now);
            let next = Self::apply_verdict(&signal, &verdict)?;

            if next != signal {
                let saved = self
                    .store
                    .save_if_status(&next, signal.status)
                    .await
                    .map_err(SignalError::storage)?;
                if !saved {
                    tracing::warn!(
                        "Signal {} changed while filtering; leaving it as stored",
                        signal.id
                    );
                    outcome.reject(signal, "status changed concurrently".to_string());
                    continue;
                }
            }

            tracing::debug!("Filter {} {} -> {:?}", next.symbol, next.signal_type, verdict);

            match verdict {
                FilterVerdict::Pass => outcome.pass(next, false),
                FilterVerdict::Adjust { .. } => outcome.pass(next, true),
                FilterVerdict::Reject { reason } => outcome.reject(next, reason),
                FilterVerdict::Expire => outcome.reject(next, REASON_EXPIRED.to_string()),
            }
        }

        tracing::info!(
            total = outcome.stats.total,
            passed = outcome.stats.passed,
            filtered_out = outcome.stats.filtered_out,
            adjusted = outcome.stats.adjusted,
            "Position filter complete"
        );

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use signal_store::MemoryStore;

    fn signal(signal_type: SignalType, direction: Direction, quantity: f64) -> TradingSignal {
        let mut s = TradingSignal::new(
            "acct-1",
            "XYZ",
            signal_type,
            direction,
            "momentum",
            "run-1",
            Utc::now(),
            Duration::hours(4),
        );
        s.strength = 80.0;
        s.confidence = 0.7;
        s.suggested_price = 50.0;
        s.suggested_quantity = quantity;
        s
    }

    fn long(quantity: f64) -> PositionSnapshot {
        PositionSnapshot::new(vec![Position::new("XYZ", quantity, 45.0)])
    }

    async fn filter_one(
        store: &Arc<MemoryStore>,
        s: TradingSignal,
        snapshot: &PositionSnapshot,
    ) -> FilterOutcome {
        store.insert_signal(&s).await.unwrap();
        PositionFilter::new(store.clone())
            .filter(vec![s], snapshot)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_entry_without_position_passes_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let s = signal(SignalType::Entry, Direction::Long, 10.0);
        let outcome = filter_one(&store, s.clone(), &PositionSnapshot::empty()).await;

        assert_eq!(outcome.stats.passed, 1);
        let passed = &outcome.passed[0];
        assert_eq!(passed.status, SignalStatus::Validated);
        assert_eq!(passed.signal_type, SignalType::Entry);
        assert_eq!(passed.suggested_quantity, 10.0);
        assert_eq!(
            store.get_signal(&s.id).await.unwrap().unwrap().status,
            SignalStatus::Validated
        );
    }

    #[tokio::test]
    async fn test_entry_at_target_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let s = signal(SignalType::Entry, Direction::Long, 10.0);
        let outcome = filter_one(&store, s.clone(), &long(10.0)).await;

        assert_eq!(outcome.stats.filtered_out, 1);
        assert_eq!(outcome.filtered[0].reason, REASON_AT_TARGET);
        let stored = store.get_signal(&s.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SignalStatus::Rejected);
        assert_eq!(stored.metadata.filter_reason.as_deref(), Some(REASON_AT_TARGET));
    }

    #[tokio::test]
    async fn test_exit_without_position() {
        let store = Arc::new(MemoryStore::new());
        let s = signal(SignalType::Exit, Direction::Long, 10.0);
        let outcome = filter_one(&store, s, &PositionSnapshot::empty()).await;
        assert_eq!(outcome.filtered[0].reason, REASON_NOTHING_TO_EXIT);
        assert_eq!(outcome.stats.reasons[REASON_NOTHING_TO_EXIT], 1);
    }

    #[tokio::test]
    async fn test_reduce_clamps_and_becomes_exit() {
        let store = Arc::new(MemoryStore::new());
        let s = signal(SignalType::Reduce, Direction::Long, 100.0);
        let outcome = filter_one(&store, s, &long(60.0)).await;

        assert_eq!(outcome.stats.adjusted, 1);
        let passed = &outcome.passed[0];
        assert_eq!(passed.signal_type, SignalType::Exit);
        assert_eq!(passed.suggested_quantity, 60.0);
        assert_eq!(passed.metadata.original_signal_type, Some(SignalType::Reduce));
        assert_eq!(passed.metadata.original_quantity, Some(100.0));
    }

    #[test]
    fn test_add_without_base_becomes_entry() {
        let s = signal(SignalType::Add, Direction::Long, 5.0);
        let verdict = PositionFilter::evaluate(&s, &PositionSnapshot::empty(), Utc::now());
        assert!(matches!(
            verdict,
            FilterVerdict::Adjust {
                signal_type: SignalType::Entry,
                ..
            }
        ));
    }

    #[test]
    fn test_direction_rules() {
        let short_book = PositionSnapshot::new(vec![Position::new("XYZ", -20.0, 50.0)]);
        let now = Utc::now();

        let exit_long = signal(SignalType::Exit, Direction::Long, 10.0);
        assert_eq!(
            PositionFilter::evaluate(&exit_long, &short_book, now),
            FilterVerdict::Reject {
                reason: REASON_DIRECTION_MISMATCH.to_string()
            }
        );

        let entry_long = signal(SignalType::Entry, Direction::Long, 10.0);
        assert_eq!(
            PositionFilter::evaluate(&entry_long, &short_book, now),
            FilterVerdict::Reject {
                reason: REASON_OPPOSITE_POSITION.to_string()
            }
        );

        let reduce = signal(SignalType::Reduce, Direction::Short, 5.0);
        assert_eq!(
            PositionFilter::evaluate(&reduce, &PositionSnapshot::empty(), now),
            FilterVerdict::Reject {
                reason: REASON_NOTHING_TO_REDUCE.to_string()
            }
        );
        assert_eq!(
            PositionFilter::evaluate(&reduce, &short_book, now),
            FilterVerdict::Pass
        );

        let hedge = signal(SignalType::Hedge, Direction::Long, 5.0);
        assert_eq!(
            PositionFilter::evaluate(&hedge, &short_book, now),
            FilterVerdict::Pass
        );
    }

    #[test]
    fn test_expired_signal() {
        let s = signal(SignalType::Entry, Direction::Long, 10.0);
        let later = Utc::now() + Duration::hours(5);
        let verdict = PositionFilter::evaluate(&s, &PositionSnapshot::empty(), later);
        assert_eq!(verdict, FilterVerdict::Expire);
        let expired = PositionFilter::apply_verdict(&s, &verdict).unwrap();
        assert_eq!(expired.status, SignalStatus::Expired);
    }

    #[tokio::test]
    async fn test_filter_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let snapshot = long(60.0);
        let mut signals = vec![
            signal(SignalType::Entry, Direction::Long, 100.0),
            signal(SignalType::Entry, Direction::Long, 10.0),
            signal(SignalType::Reduce, Direction::Long, 100.0),
            signal(SignalType::Add, Direction::Short, 5.0),
            signal(SignalType::Exit, Direction::Long, 30.0),
        ];
        for (i, s) in signals.iter_mut().enumerate() {
            s.symbol = "XYZ".to_string();
            s.id = format!("sig-{i}");
            store.insert_signal(s).await.unwrap();
        }

        let filter = PositionFilter::new(store.clone());
        let first = filter.filter(signals, &snapshot).await.unwrap();

        let again: Vec<TradingSignal> = first
            .passed
            .iter()
            .cloned()
            .chain(first.filtered.iter().map(|f| f.signal.clone()))
            .collect();
        let second = filter.filter(again, &snapshot).await.unwrap();

        assert_eq!(first.stats.passed, second.stats.passed);
        assert_eq!(first.stats.filtered_out, second.stats.filtered_out);
        assert_eq!(first.stats.reasons, second.stats.reasons);
        assert_eq!(first.passed, second.passed);
        for (a, b) in first.filtered.iter().zip(&second.filtered) {
            assert_eq!(a.signal, b.signal);
            assert_eq!(a.reason, b.reason);
        }
    }
}
