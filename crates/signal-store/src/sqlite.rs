use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use signal_core::{
    ActiveParameters, EnqueueOutcome, OptimizationProposal, OutcomeStore, SignalPerformance,
    SignalStatus, SignalStore, TradingSignal,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS trading_signals (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        symbol TEXT NOT NULL,
        direction TEXT NOT NULL,
        signal_type TEXT NOT NULL,
        status TEXT NOT NULL,
        generated_at TEXT NOT NULL,
        expires_at TEXT NOT NULL,
        payload TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_signals_account_status
        ON trading_signals(account_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_signals_expiry
        ON trading_signals(status, expires_at)",
    // At most one QUEUED/EXECUTING signal per (account, symbol, direction).
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_signals_active_slot
        ON trading_signals(account_id, symbol, direction)
        WHERE status IN ('QUEUED', 'EXECUTING')",
    "CREATE TABLE IF NOT EXISTS signal_performance (
        signal_id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        closed_at TEXT NOT NULL,
        payload TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_performance_account
        ON signal_performance(account_id, closed_at)",
    "CREATE TABLE IF NOT EXISTS optimization_proposals (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        applied INTEGER NOT NULL DEFAULT 0,
        payload TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS active_parameters (
        account_id TEXT PRIMARY KEY,
        payload TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
];

/// Fixed-width UTC timestamps so that TEXT comparison matches time order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// SQLite-backed signal and outcome store.
///
/// Queryable fields are mirrored into columns; the full record lives in `payload` as JSON.
/// Status writes are conditional updates on the previous status.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (and create if missing) the database and ensure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid database url {database_url}"))?
            .create_if_missing(true);

        // Every connection to :memory: is its own database; keep exactly one alive.
        let in_memory = database_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .idle_timeout(if in_memory { None } else { Some(Duration::from_secs(600)) })
            .max_lifetime(if in_memory { None } else { Some(Duration::from_secs(1800)) })
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn fetch_raw(&self, id: &str) -> Result<Option<TradingSignal>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT payload FROM trading_signals WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(payload,)| decode_signal(&payload)).transpose()
    }

    /// Lazy expiry: persist EXPIRED for a due signal and return the fresh record.
    async fn expire_on_read(&self, signal: TradingSignal) -> Result<TradingSignal> {
        let mut candidate = signal.clone();
        let previous = candidate.status;
        if !candidate.expire_if_due(Utc::now()) {
            return Ok(signal);
        }
        if self.save_if_status(&candidate, previous).await? {
            tracing::debug!("Signal {} expired on read", candidate.id);
            return Ok(candidate);
        }
        // Lost a race with another writer; report whatever is stored now.
        Ok(self.fetch_raw(&candidate.id).await?.unwrap_or(signal))
    }

    async fn slot_holder(&self, signal: &TradingSignal) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM trading_signals
             WHERE account_id = ? AND symbol = ? AND direction = ?
               AND status IN ('QUEUED', 'EXECUTING') AND id != ?
             LIMIT 1",
        )
        .bind(&signal.account_id)
        .bind(&signal.symbol)
        .bind(signal.direction.as_str())
        .bind(&signal.id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }
}

fn decode_signal(payload: &str) -> Result<TradingSignal> {
    serde_json::from_str(payload).context("corrupt trading_signals payload")
}

#[async_trait]
impl SignalStore for SqliteStore {
    async fn insert_signal(&self, signal: &TradingSignal) -> Result<()> {
        let payload = serde_json::to_string(signal)?;
        sqlx::query(
            "INSERT INTO trading_signals
             (id, account_id, symbol, direction, signal_type, status,
              generated_at, expires_at, payload, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&signal.id)
        .bind(&signal.account_id)
        .bind(&signal.symbol)
        .bind(signal.direction.as_str())
        .bind(signal.signal_type.as_str())
        .bind(signal.status.as_str())
        .bind(ts(signal.generated_at))
        .bind(ts(signal.expires_at))
        .bind(payload)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert signal {}", signal.id))?;
        Ok(())
    }

    async fn get_signal(&self, id: &str) -> Result<Option<TradingSignal>> {
        match self.fetch_raw(id).await? {
            Some(signal) => Ok(Some(self.expire_on_read(signal).await?)),
            None => Ok(None),
        }
    }

    async fn list_signals(
        &self,
        account_id: &str,
        statuses: &[SignalStatus],
    ) -> Result<Vec<TradingSignal>> {
        let mut sql = String::from("SELECT payload FROM trading_signals WHERE account_id = ?");
        if !statuses.is_empty() {
            // Also read pending rows so lazily-expired ones are not reported stale.
            let placeholders = vec!["?"; statuses.len() + 3].join(", ");
            sql.push_str(&format!(" AND status IN ({placeholders})"));
        }
        sql.push_str(" ORDER BY generated_at, id");

        let mut query = sqlx::query_as::<_, (String,)>(&sql).bind(account_id);
        if !statuses.is_empty() {
            for status in statuses {
                query = query.bind(status.as_str());
            }
            for status in [SignalStatus::Generated, SignalStatus::Validated, SignalStatus::Queued] {
                query = query.bind(status.as_str());
            }
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for (payload,) in rows {
            let signal = self.expire_on_read(decode_signal(&payload)?).await?;
            if statuses.is_empty() || statuses.contains(&signal.status) {
                out.push(signal);
            }
        }
        Ok(out)
    }

    async fn save_if_status(
        &self,
        signal: &TradingSignal,
        expected: SignalStatus,
    ) -> Result<bool> {
        let payload = serde_json::to_string(signal)?;
        let result = sqlx::query(
            "UPDATE trading_signals
             SET status = ?, signal_type = ?, expires_at = ?, payload = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(signal.status.as_str())
        .bind(signal.signal_type.as_str())
        .bind(ts(signal.expires_at))
        .bind(payload)
        .bind(ts(Utc::now()))
        .bind(&signal.id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() == 1),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn try_enqueue(&self, id: &str) -> Result<EnqueueOutcome> {
        let Some(signal) = self.get_signal(id).await? else {
            return Ok(EnqueueOutcome::NotFound);
        };
        if signal.status != SignalStatus::Validated {
            return Ok(EnqueueOutcome::NotEligible(signal.status));
        }

        let mut queued = signal.clone();
        queued.transition(SignalStatus::Queued)?;
        let payload = serde_json::to_string(&queued)?;

        // Single statement: status check and slot check happen atomically.
        let result = sqlx::query(
            "UPDATE trading_signals
             SET status = 'QUEUED', payload = ?, updated_at = ?
             WHERE id = ? AND status = 'VALIDATED'
               AND NOT EXISTS (
                   SELECT 1 FROM trading_signals AS other
                   WHERE other.account_id = trading_signals.account_id
                     AND other.symbol = trading_signals.symbol
                     AND other.direction = trading_signals.direction
                     AND other.status IN ('QUEUED', 'EXECUTING')
                     AND other.id != trading_signals.id
               )",
        )
        .bind(payload)
        .bind(ts(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await;

        let applied = match result {
            Ok(done) => done.rows_affected() == 1,
            Err(e) if is_unique_violation(&e) => false,
            Err(e) => return Err(e.into()),
        };
        if applied {
            return Ok(EnqueueOutcome::Queued(queued));
        }

        match self.fetch_raw(id).await? {
            Some(current) if current.status != SignalStatus::Validated => {
                Ok(EnqueueOutcome::NotEligible(current.status))
            }
            Some(current) => match self.slot_holder(&current).await? {
                Some(holder_id) => Ok(EnqueueOutcome::SlotBusy { holder_id }),
                None => Ok(EnqueueOutcome::NotEligible(current.status)),
            },
            None => Ok(EnqueueOutcome::NotFound),
        }
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT payload FROM trading_signals
             WHERE status IN ('GENERATED', 'VALIDATED', 'QUEUED') AND expires_at < ?
             ORDER BY id",
        )
        .bind(ts(now))
        .fetch_all(&self.pool)
        .await?;

        let mut expired = Vec::new();
        for (payload,) in rows {
            let mut signal = decode_signal(&payload)?;
            let previous = signal.status;
            if signal.expire_if_due(now) && self.save_if_status(&signal, previous).await? {
                expired.push(signal.id);
            }
        }
        Ok(expired)
    }
}

#[async_trait]
impl OutcomeStore for SqliteStore {
    async fn upsert_performance(&self, row: &SignalPerformance) -> Result<()> {
        sqlx::query(
            "INSERT INTO signal_performance (signal_id, account_id, closed_at, payload)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(signal_id) DO UPDATE SET
              account_id = excluded.account_id,
              closed_at = excluded.closed_at,
              payload = excluded.payload",
        )
        .bind(&row.signal_id)
        .bind(&row.account_id)
        .bind(ts(row.closed_at))
        .bind(serde_json::to_string(row)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_performance(&self, account_id: &str) -> Result<Vec<SignalPerformance>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT payload FROM signal_performance
             WHERE account_id = ? ORDER BY closed_at, signal_id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(payload,)| serde_json::from_str(&payload).map_err(Into::into))
            .collect()
    }

    async fn save_proposal(&self, proposal: &OptimizationProposal) -> Result<()> {
        sqlx::query(
            "INSERT INTO optimization_proposals (id, account_id, created_at, applied, payload)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
              applied = excluded.applied,
              payload = excluded.payload",
        )
        .bind(&proposal.id)
        .bind(&proposal.account_id)
        .bind(ts(proposal.created_at))
        .bind(proposal.applied)
        .bind(serde_json::to_string(proposal)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_proposal(&self, id: &str) -> Result<Option<OptimizationProposal>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT payload FROM optimization_proposals WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(payload,)| serde_json::from_str(&payload).map_err(Into::into))
            .transpose()
    }

    async fn latest_proposal(&self, account_id: &str) -> Result<Option<OptimizationProposal>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT payload FROM optimization_proposals
             WHERE account_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(payload,)| serde_json::from_str(&payload).map_err(Into::into))
            .transpose()
    }

    async fn load_parameters(&self, account_id: &str) -> Result<Option<ActiveParameters>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT payload FROM active_parameters WHERE account_id = ?")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(payload,)| serde_json::from_str(&payload).map_err(Into::into))
            .transpose()
    }

    async fn save_parameters(&self, account_id: &str, params: &ActiveParameters) -> Result<()> {
        sqlx::query(
            "INSERT INTO active_parameters (account_id, payload, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(account_id) DO UPDATE SET
              payload = excluded.payload, updated_at = excluded.updated_at",
        )
        .bind(account_id)
        .bind(serde_json::to_string(params)?)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
