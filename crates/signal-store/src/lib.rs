//! Persistence for trading signals, closed-signal outcomes, optimizer proposals and
//! per-account active parameters.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use signal_core::*;

    use super::*;

    fn signal(symbol: &str, direction: Direction, status: SignalStatus) -> TradingSignal {
        let mut s = TradingSignal::new(
            "acct-1",
            symbol,
            SignalType::Entry,
            direction,
            "momentum",
            "run-1",
            Utc::now(),
            Duration::hours(4),
        );
        s.status = status;
        s
    }

    async fn check_slot_invariant<S: SignalStore>(store: &S) {
        let a = signal("XYZ", Direction::Long, SignalStatus::Validated);
        let b = signal("XYZ", Direction::Long, SignalStatus::Validated);
        let short = signal("XYZ", Direction::Short, SignalStatus::Validated);
        for s in [&a, &b, &short] {
            store.insert_signal(s).await.unwrap();
        }

        assert!(matches!(
            store.try_enqueue(&a.id).await.unwrap(),
            EnqueueOutcome::Queued(_)
        ));
        match store.try_enqueue(&b.id).await.unwrap() {
            EnqueueOutcome::SlotBusy { holder_id } => assert_eq!(holder_id, a.id),
            other => panic!("expected SlotBusy, got {other:?}"),
        }
        // Opposite direction is a different slot.
        assert!(matches!(
            store.try_enqueue(&short.id).await.unwrap(),
            EnqueueOutcome::Queued(_)
        ));
        // Re-enqueueing a queued signal is not allowed.
        assert!(matches!(
            store.try_enqueue(&a.id).await.unwrap(),
            EnqueueOutcome::NotEligible(SignalStatus::Queued)
        ));
        assert!(matches!(
            store.try_enqueue("missing").await.unwrap(),
            EnqueueOutcome::NotFound
        ));

        let stored_b = store.get_signal(&b.id).await.unwrap().unwrap();
        assert_eq!(stored_b.status, SignalStatus::Validated);
    }

    async fn check_conditional_save<S: SignalStore>(store: &S) {
        let s = signal("ABC", Direction::Long, SignalStatus::Generated);
        store.insert_signal(&s).await.unwrap();

        let mut validated = s.clone();
        validated.transition(SignalStatus::Validated).unwrap();
        assert!(store
            .save_if_status(&validated, SignalStatus::Generated)
            .await
            .unwrap());

        // Second writer still believes the signal is GENERATED.
        let mut rejected = s.clone();
        rejected.transition(SignalStatus::Rejected).unwrap();
        assert!(!store
            .save_if_status(&rejected, SignalStatus::Generated)
            .await
            .unwrap());

        let stored = store.get_signal(&s.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SignalStatus::Validated);
    }

    async fn check_expiry<S: SignalStore>(store: &S) {
        let mut stale = signal("OLD", Direction::Long, SignalStatus::Validated);
        stale.generated_at = Utc::now() - Duration::hours(10);
        stale.expires_at = Utc::now() - Duration::hours(6);
        let mut executing = signal("RUN", Direction::Long, SignalStatus::Executing);
        executing.expires_at = Utc::now() - Duration::hours(1);
        let fresh = signal("NEW", Direction::Long, SignalStatus::Generated);
        for s in [&stale, &executing, &fresh] {
            store.insert_signal(s).await.unwrap();
        }

        // Lazy: a pending listing never reports the stale signal.
        let pending = store
            .list_signals("acct-1", &SignalStatus::PENDING)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, fresh.id);

        let got = store.get_signal(&stale.id).await.unwrap().unwrap();
        assert_eq!(got.status, SignalStatus::Expired);

        // Eager sweep finds nothing more and leaves EXECUTING alone.
        let swept = store.expire_due(Utc::now()).await.unwrap();
        assert!(swept.is_empty());
        let got = store.get_signal(&executing.id).await.unwrap().unwrap();
        assert_eq!(got.status, SignalStatus::Executing);
    }

    async fn check_outcomes<S: OutcomeStore>(store: &S) {
        let row = SignalPerformance {
            signal_id: "sig-1".to_string(),
            account_id: "acct-1".to_string(),
            strategy_id: "momentum".to_string(),
            source: SignalSource::Technical,
            symbol: "XYZ".to_string(),
            pnl: 50.0,
            pnl_pct: 0.05,
            holding_period_hours: 24.0,
            is_winner: true,
            closed_at: Utc::now(),
        };
        store.upsert_performance(&row).await.unwrap();
        let mut updated = row.clone();
        updated.pnl = 60.0;
        store.upsert_performance(&updated).await.unwrap();

        let rows = store.list_performance("acct-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pnl, 60.0);
        assert!(store.list_performance("other").await.unwrap().is_empty());

        assert!(store.load_parameters("acct-1").await.unwrap().is_none());
        let mut params = ActiveParameters::default();
        params.set(MIN_STRENGTH, 55.0).unwrap();
        store.save_parameters("acct-1", &params).await.unwrap();
        assert_eq!(store.load_parameters("acct-1").await.unwrap(), Some(params));

        let mut proposal = OptimizationProposal {
            id: "p-1".to_string(),
            account_id: "acct-1".to_string(),
            created_at: Utc::now(),
            adjustments: Default::default(),
            declined: Default::default(),
            basis: ProposalBasis {
                sample_size: 12,
                window_days: 30,
                win_rate: 0.5,
                min_sample: 10,
            },
            applied: false,
            applied_at: None,
        };
        store.save_proposal(&proposal).await.unwrap();
        proposal.applied = true;
        proposal.applied_at = Some(Utc::now());
        store.save_proposal(&proposal).await.unwrap();

        let latest = store.latest_proposal("acct-1").await.unwrap().unwrap();
        assert!(latest.applied);
        assert_eq!(store.get_proposal("p-1").await.unwrap(), Some(proposal));
        assert!(store.latest_proposal("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_slot_invariant() {
        check_slot_invariant(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_memory_store_conditional_save() {
        check_conditional_save(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_memory_store_expiry() {
        check_expiry(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_memory_store_outcomes() {
        check_outcomes(&MemoryStore::new()).await;
    }

    async fn sqlite() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_store_slot_invariant() {
        check_slot_invariant(&sqlite().await).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_conditional_save() {
        check_conditional_save(&sqlite().await).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_expiry() {
        check_expiry(&sqlite().await).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_outcomes() {
        check_outcomes(&sqlite().await).await;
    }

    #[tokio::test]
    async fn test_sqlite_unique_index_blocks_second_active_row() {
        let store = sqlite().await;
        let a = signal("XYZ", Direction::Long, SignalStatus::Queued);
        store.insert_signal(&a).await.unwrap();

        let b = signal("XYZ", Direction::Long, SignalStatus::Validated);
        store.insert_signal(&b).await.unwrap();
        let mut forced = b.clone();
        forced.status = SignalStatus::Queued;
        assert!(!store
            .save_if_status(&forced, SignalStatus::Validated)
            .await
            .unwrap());
    }
}
