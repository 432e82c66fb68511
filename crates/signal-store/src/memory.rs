use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use signal_core::{
    ActiveParameters, EnqueueOutcome, OptimizationProposal, OutcomeStore, SignalPerformance,
    SignalStatus, SignalStore, TradingSignal,
};
use tokio::sync::Mutex;

#[derive(Default)]
struct Inner {
    signals: HashMap<String, TradingSignal>,
    /// Insertion order, used for stable listing.
    order: Vec<String>,
    performance: BTreeMap<String, SignalPerformance>,
    proposals: Vec<OptimizationProposal>,
    parameters: HashMap<String, ActiveParameters>,
}

impl Inner {
    fn slot_holder(&self, signal: &TradingSignal) -> Option<String> {
        self.signals
            .values()
            .find(|other| {
                other.id != signal.id
                    && other.status.is_active()
                    && other.slot_key() == signal.slot_key()
            })
            .map(|other| other.id.clone())
    }

    fn expire_if_due(&mut self, id: &str, now: DateTime<Utc>) {
        if let Some(signal) = self.signals.get_mut(id) {
            if signal.expire_if_due(now) {
                tracing::debug!("Signal {} expired on read", id);
            }
        }
    }
}

/// Process-local store. All operations run under one lock, which makes every
/// check-and-set trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalStore for MemoryStore {
    async fn insert_signal(&self, signal: &TradingSignal) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.signals.contains_key(&signal.id) {
            bail!("signal {} already exists", signal.id);
        }
        if signal.status.is_active() {
            if let Some(holder) = inner.slot_holder(signal) {
                bail!("slot for {} held by {}", signal.symbol, holder);
            }
        }
        inner.order.push(signal.id.clone());
        inner.signals.insert(signal.id.clone(), signal.clone());
        Ok(())
    }

    async fn get_signal(&self, id: &str) -> Result<Option<TradingSignal>> {
        let mut inner = self.inner.lock().await;
        inner.expire_if_due(id, Utc::now());
        Ok(inner.signals.get(id).cloned())
    }

    async fn list_signals(
        &self,
        account_id: &str,
        statuses: &[SignalStatus],
    ) -> Result<Vec<TradingSignal>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let ids: Vec<String> = inner.order.clone();
        let mut out = Vec::new();
        for id in ids {
            inner.expire_if_due(&id, now);
            if let Some(signal) = inner.signals.get(&id) {
                if signal.account_id == account_id
                    && (statuses.is_empty() || statuses.contains(&signal.status))
                {
                    out.push(signal.clone());
                }
            }
        }
        Ok(out)
    }

    async fn save_if_status(
        &self,
        signal: &TradingSignal,
        expected: SignalStatus,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let current = match inner.signals.get(&signal.id) {
            Some(current) => current.status,
            None => bail!("signal {} not found", signal.id),
        };
        if current != expected {
            return Ok(false);
        }
        if signal.status.is_active() && inner.slot_holder(signal).is_some() {
            return Ok(false);
        }
        inner.signals.insert(signal.id.clone(), signal.clone());
        Ok(true)
    }

    async fn try_enqueue(&self, id: &str) -> Result<EnqueueOutcome> {
        let mut inner = self.inner.lock().await;
        inner.expire_if_due(id, Utc::now());
        let Some(signal) = inner.signals.get(id).cloned() else {
            return Ok(EnqueueOutcome::NotFound);
        };
        if signal.status != SignalStatus::Validated {
            return Ok(EnqueueOutcome::NotEligible(signal.status));
        }
        if let Some(holder_id) = inner.slot_holder(&signal) {
            return Ok(EnqueueOutcome::SlotBusy { holder_id });
        }
        let mut queued = signal;
        queued.transition(SignalStatus::Queued)?;
        inner.signals.insert(queued.id.clone(), queued.clone());
        Ok(EnqueueOutcome::Queued(queued))
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let mut expired = Vec::new();
        for signal in inner.signals.values_mut() {
            if signal.expire_if_due(now) {
                expired.push(signal.id.clone());
            }
        }
        expired.sort();
        Ok(expired)
    }
}

#[async_trait]
impl OutcomeStore for MemoryStore {
    async fn upsert_performance(&self, row: &SignalPerformance) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.performance.insert(row.signal_id.clone(), row.clone());
        Ok(())
    }

    async fn list_performance(&self, account_id: &str) -> Result<Vec<SignalPerformance>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<SignalPerformance> = inner
            .performance
            .values()
            .filter(|row| row.account_id == account_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.closed_at.cmp(&b.closed_at).then(a.signal_id.cmp(&b.signal_id)));
        Ok(rows)
    }

    async fn save_proposal(&self, proposal: &OptimizationProposal) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.proposals.iter_mut().find(|p| p.id == proposal.id) {
            Some(existing) => *existing = proposal.clone(),
            None => inner.proposals.push(proposal.clone()),
        }
        Ok(())
    }

    async fn get_proposal(&self, id: &str) -> Result<Option<OptimizationProposal>> {
        let inner = self.inner.lock().await;
        Ok(inner.proposals.iter().find(|p| p.id == id).cloned())
    }

    async fn latest_proposal(&self, account_id: &str) -> Result<Option<OptimizationProposal>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .proposals
            .iter()
            .filter(|p| p.account_id == account_id)
            .max_by_key(|p| p.created_at)
            .cloned())
    }

    async fn load_parameters(&self, account_id: &str) -> Result<Option<ActiveParameters>> {
        let inner = self.inner.lock().await;
        Ok(inner.parameters.get(account_id).cloned())
    }

    async fn save_parameters(&self, account_id: &str, params: &ActiveParameters) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .parameters
            .insert(account_id.to_string(), params.clone());
        Ok(())
    }
}
