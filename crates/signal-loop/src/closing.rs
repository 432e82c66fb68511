use chrono::{DateTime, Utc};
use signal_core::scoring;
use signal_core::{EvaluationDetails, SignalError, SignalStatus, SignalStore, TradingSignal};

/// Record the external close event of an executed signal.
///
/// The return is measured on the side the signal traded, so an EXIT that sold before a
/// drop scores as a win. Status stays EXECUTED; closing again overwrites the evaluation.
pub async fn close_signal(
    store: &dyn SignalStore,
    signal_id: &str,
    exit_price: f64,
    closed_at: DateTime<Utc>,
) -> Result<TradingSignal, SignalError> {
    if !exit_price.is_finite() || exit_price <= 0.0 {
        return Err(SignalError::InvalidInput(format!(
            "exit price must be positive, got {exit_price}"
        )));
    }

    let signal = store
        .get_signal(signal_id)
        .await
        .map_err(SignalError::storage)?
        .ok_or_else(|| SignalError::NotFound(format!("signal {signal_id}")))?;

    if signal.status != SignalStatus::Executed {
        return Err(SignalError::InvalidInput(format!(
            "signal {signal_id} is {}; only EXECUTED signals can be closed",
            signal.status
        )));
    }
    if let Some(executed_at) = signal.executed_at {
        if closed_at < executed_at {
            return Err(SignalError::InvalidInput(format!(
                "close at {closed_at} precedes execution at {executed_at}"
            )));
        }
    }

    let entry_price = signal
        .executed_price()
        .filter(|p| *p > 0.0)
        .unwrap_or(signal.suggested_price);
    let quantity = signal
        .execution
        .as_ref()
        .and_then(|e| e.executed_quantity)
        .unwrap_or(signal.suggested_quantity);

    let actual_return = scoring::directional_return(signal.order_direction(), entry_price, exit_price);
    let realized_pnl = actual_return * entry_price * quantity;
    let evaluation_score = scoring::evaluation_score(
        actual_return,
        signal.expected_return,
        signal.slippage().unwrap_or(0.0),
    );

    let mut closed = signal.clone();
    closed.evaluation = Some(EvaluationDetails {
        exit_price,
        closed_at,
        actual_return,
        realized_pnl,
        evaluation_score,
    });

    let saved = store
        .save_if_status(&closed, SignalStatus::Executed)
        .await
        .map_err(SignalError::storage)?;
    if !saved {
        return Err(SignalError::Storage(format!(
            "signal {signal_id} changed while closing"
        )));
    }

    tracing::info!(
        signal_id,
        symbol = %closed.symbol,
        actual_return,
        realized_pnl,
        evaluation_score,
        "Signal closed"
    );
    Ok(closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Duration;
    use signal_core::{Direction, ExecutionDetails, SignalType};
    use signal_store::MemoryStore;

    fn executed(signal_type: SignalType, direction: Direction) -> TradingSignal {
        let mut s = TradingSignal::new(
            "acct-1",
            "XYZ",
            signal_type,
            direction,
            "momentum",
            "run-1",
            Utc::now() - Duration::hours(2),
            Duration::hours(4),
        );
        s.status = SignalStatus::Executed;
        s.suggested_price = 100.0;
        s.suggested_quantity = 10.0;
        s.expected_return = 0.03;
        s.executed_at = Some(Utc::now() - Duration::hours(1));
        s.execution = Some(ExecutionDetails {
            executed_price: Some(100.0),
            executed_quantity: Some(10.0),
            slippage: Some(0.0),
            order_reference: Some("dry-run-1".to_string()),
            error: None,
            dry_run: true,
        });
        s
    }

    #[tokio::test]
    async fn test_close_long_entry() {
        let store = MemoryStore::new();
        let s = executed(SignalType::Entry, Direction::Long);
        store.insert_signal(&s).await.unwrap();

        let closed = close_signal(&store, &s.id, 110.0, Utc::now()).await.unwrap();
        let eval = closed.evaluation.unwrap();
        assert_relative_eq!(eval.actual_return, 0.10, epsilon = 1e-9);
        assert_relative_eq!(eval.realized_pnl, 100.0, epsilon = 1e-9);
        // 50 + 50 (capped) + 10 direction bonus, clamped to 100
        assert_relative_eq!(eval.evaluation_score, 100.0, epsilon = 1e-9);
        assert_eq!(closed.status, SignalStatus::Executed);
    }

    #[tokio::test]
    async fn test_exit_that_sold_before_a_drop_wins() {
        let store = MemoryStore::new();
        let s = executed(SignalType::Exit, Direction::Long);
        store.insert_signal(&s).await.unwrap();

        let closed = close_signal(&store, &s.id, 95.0, Utc::now()).await.unwrap();
        assert!(closed.evaluation.unwrap().actual_return > 0.0);
    }

    #[tokio::test]
    async fn test_close_twice_overwrites() {
        let store = MemoryStore::new();
        let s = executed(SignalType::Entry, Direction::Short);
        store.insert_signal(&s).await.unwrap();

        close_signal(&store, &s.id, 90.0, Utc::now()).await.unwrap();
        let second = close_signal(&store, &s.id, 105.0, Utc::now()).await.unwrap();
        let stored = store.get_signal(&s.id).await.unwrap().unwrap();
        assert_eq!(stored.evaluation, second.evaluation);
        assert!(stored.evaluation.unwrap().actual_return < 0.0);
    }

    #[tokio::test]
    async fn test_close_rejects_bad_input() {
        let store = MemoryStore::new();
        let mut pending = executed(SignalType::Entry, Direction::Long);
        pending.status = SignalStatus::Validated;
        store.insert_signal(&pending).await.unwrap();

        assert!(matches!(
            close_signal(&store, &pending.id, 100.0, Utc::now()).await,
            Err(SignalError::InvalidInput(_))
        ));
        assert!(matches!(
            close_signal(&store, "missing", 100.0, Utc::now()).await,
            Err(SignalError::NotFound(_))
        ));
        assert!(matches!(
            close_signal(&store, &pending.id, -1.0, Utc::now()).await,
            Err(SignalError::InvalidInput(_))
        ));
    }
}
