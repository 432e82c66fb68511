use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use signal_core::{StrategyRun, StrategyRunSource};
use tokio::sync::RwLock;

/// Strategy runs held in memory, latest per strategy id.
///
/// Backs the binary (runs loaded from a JSON file) and the coordinator tests.
#[derive(Default)]
pub struct StaticRunSource {
    runs: RwLock<HashMap<String, StrategyRun>>,
}

impl StaticRunSource {
    pub fn new(runs: Vec<StrategyRun>) -> Self {
        let mut latest: HashMap<String, StrategyRun> = HashMap::new();
        for run in runs {
            keep_latest(&mut latest, run);
        }
        Self {
            runs: RwLock::new(latest),
        }
    }

    /// Load a JSON array of strategy runs.
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading strategy runs from {}", path.display()))?;
        let runs: Vec<StrategyRun> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing strategy runs in {}", path.display()))?;
        tracing::info!("Loaded {} strategy runs from {}", runs.len(), path.display());
        Ok(Self::new(runs))
    }

    /// Replace the latest run of a strategy if `run` finished later.
    pub async fn publish(&self, run: StrategyRun) {
        keep_latest(&mut *self.runs.write().await, run);
    }

    pub async fn strategy_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn keep_latest(runs: &mut HashMap<String, StrategyRun>, run: StrategyRun) {
    match runs.get(&run.strategy_id) {
        Some(existing) if existing.finished_at > run.finished_at => {}
        _ => {
            runs.insert(run.strategy_id.clone(), run);
        }
    }
}

#[async_trait]
impl StrategyRunSource for StaticRunSource {
    async fn get_latest_run(&self, strategy_id: &str) -> Result<Option<StrategyRun>> {
        Ok(self.runs.read().await.get(strategy_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn run(strategy_id: &str, run_id: &str, minutes_ago: i64) -> StrategyRun {
        StrategyRun {
            run_id: run_id.to_string(),
            strategy_id: strategy_id.to_string(),
            finished_at: Utc::now() - Duration::minutes(minutes_ago),
            candidates: vec![],
        }
    }

    #[tokio::test]
    async fn test_keeps_latest_run_per_strategy() {
        let source = StaticRunSource::new(vec![
            run("momentum", "new", 5),
            run("momentum", "old", 60),
            run("reversion", "only", 10),
        ]);

        let latest = source.get_latest_run("momentum").await.unwrap().unwrap();
        assert_eq!(latest.run_id, "new");
        assert!(source.get_latest_run("unknown").await.unwrap().is_none());
        assert_eq!(source.strategy_ids().await, vec!["momentum", "reversion"]);

        source.publish(run("momentum", "stale", 120)).await;
        let latest = source.get_latest_run("momentum").await.unwrap().unwrap();
        assert_eq!(latest.run_id, "new");
    }

    #[tokio::test]
    async fn test_from_json_file() {
        let path = std::env::temp_dir().join(format!("runs-{}.json", uuid::Uuid::new_v4()));
        let json = r#"[{
            "run_id": "r1",
            "strategy_id": "momentum",
            "finished_at": "2026-01-05T14:30:00Z",
            "candidates": [{"symbol": "xyz", "direction": "long", "strength": 80, "confidence": 0.7,
                            "metadata": {"price": 100.0, "sector": "tech"}}]
        }]"#;
        tokio::fs::write(&path, json).await.unwrap();

        let source = StaticRunSource::from_json_file(&path).await.unwrap();
        let run = source.get_latest_run("momentum").await.unwrap().unwrap();
        assert_eq!(run.candidates.len(), 1);
        assert_eq!(run.candidates[0].metadata.price, Some(100.0));
        assert!(run.candidates[0].metadata.extra.contains_key("sector"));

        tokio::fs::remove_file(&path).await.ok();
        assert!(StaticRunSource::from_json_file(&path).await.is_err());
    }
}
