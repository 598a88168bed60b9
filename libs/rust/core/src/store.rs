//! Training session records and the persistence seam.
//!
//! The registry is the single source of truth once a round commits; the
//! engine's in-memory round state is disposable. Implementations must keep
//! `commit_aggregated_round` a plain +1 on the round counter so the engine
//! can rely on "counter advanced" as proof an aggregation happened.

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::confusion::ConfusionSnapshot;
use crate::device::DeviceId;
use crate::metrics::RoundMetrics;
use crate::tensor::Tensor;

pub type TrainId = u64;

/// One federated run: a (date, model) pair trained over a fixed number of
/// rounds. At most one session exists per pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Train {
    pub id: TrainId,
    pub date: NaiveDate,
    pub model_name: String,
    pub round_count: u32,
    pub max_rounds: u32,
    pub epochs: u32,
    pub global_weights: Option<Vec<Tensor>>,
    pub is_active: bool,
    pub ready: bool,
    pub global_confusion: Option<ConfusionSnapshot>,
}

/// One persisted record per submission, append-only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoundRecord {
    pub train_id: TrainId,
    pub device_id: DeviceId,
    pub round: u32,
    pub metrics: RoundMetrics,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait TrainStore: Send + Sync {
    /// Idempotent session lookup/creation for a (date, model) pair. An
    /// existing session only has `max_rounds`/`epochs` updated and gets
    /// reactivated when the request differs; the round counter is never
    /// touched here.
    async fn get_or_create_session(
        &self,
        date: NaiveDate,
        model: &str,
        max_rounds: u32,
        epochs: u32,
    ) -> anyhow::Result<Train>;

    async fn train(&self, id: TrainId) -> anyhow::Result<Option<Train>>;

    /// Most recent active session for a date, for weight replay on hello.
    async fn latest_active(&self, date: NaiveDate) -> anyhow::Result<Option<Train>>;

    /// Append-only; duplicate calls for the same (device, round) produce
    /// duplicate records. Not calling it twice per submission is the
    /// engine's job.
    async fn record_round_result(
        &self,
        train: TrainId,
        device: &DeviceId,
        round: u32,
        metrics: RoundMetrics,
    ) -> anyhow::Result<()>;

    /// Advances the round counter by exactly one and replaces the global
    /// weights (and confusion when supplied). The only place the counter
    /// moves.
    async fn commit_aggregated_round(
        &self,
        train: TrainId,
        weights: Vec<Tensor>,
        confusion: Option<ConfusionSnapshot>,
    ) -> anyhow::Result<Train>;

    /// active=false, ready=true; idempotent.
    async fn finalize_session(&self, train: TrainId) -> anyhow::Result<()>;

    async fn round_results(&self, train: TrainId, round: u32) -> anyhow::Result<Vec<RoundMetrics>>;

    /// Mean of the accuracy-like values reported for a round, 0.0 when none.
    async fn average_accuracy(&self, train: TrainId, round: u32) -> anyhow::Result<f64> {
        Ok(mean_accuracy(&self.round_results(train, round).await?))
    }

    /// Mean reported loss for a round; `None` when nobody reported one.
    async fn average_loss(&self, train: TrainId, round: u32) -> anyhow::Result<Option<f64>> {
        Ok(mean_loss(&self.round_results(train, round).await?))
    }
}

pub fn mean_accuracy(results: &[RoundMetrics]) -> f64 {
    let vals: Vec<f64> = results.iter().filter_map(RoundMetrics::accuracy_like).collect();
    if vals.is_empty() {
        0.0
    } else {
        vals.iter().sum::<f64>() / vals.len() as f64
    }
}

pub fn mean_loss(results: &[RoundMetrics]) -> Option<f64> {
    let vals: Vec<f64> = results.iter().filter_map(RoundMetrics::loss_like).collect();
    if vals.is_empty() {
        None
    } else {
        Some(vals.iter().sum::<f64>() / vals.len() as f64)
    }
}

#[derive(Default)]
struct MemoryInner {
    next_id: TrainId,
    trains: HashMap<TrainId, Train>,
    index: HashMap<(NaiveDate, String), TrainId>,
    results: Vec<RoundRecord>,
}

/// In-memory registry, used by tests and as the ephemeral fallback when no
/// database path is configured.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrainStore for MemoryStore {
    async fn get_or_create_session(
        &self,
        date: NaiveDate,
        model: &str,
        max_rounds: u32,
        epochs: u32,
    ) -> anyhow::Result<Train> {
        let mut inner = self.inner.write();
        let key = (date, model.to_string());
        if let Some(&id) = inner.index.get(&key) {
            let t = inner.trains.get_mut(&id).context("index points at a missing session")?;
            if t.max_rounds != max_rounds || t.epochs != epochs || !t.is_active {
                t.max_rounds = max_rounds;
                t.epochs = epochs;
                t.is_active = true;
            }
            return Ok(t.clone());
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let t = Train {
            id,
            date,
            model_name: model.to_string(),
            round_count: 0,
            max_rounds,
            epochs,
            global_weights: None,
            is_active: true,
            ready: false,
            global_confusion: None,
        };
        inner.trains.insert(id, t.clone());
        inner.index.insert(key, id);
        Ok(t)
    }

    async fn train(&self, id: TrainId) -> anyhow::Result<Option<Train>> {
        Ok(self.inner.read().trains.get(&id).cloned())
    }

    async fn latest_active(&self, date: NaiveDate) -> anyhow::Result<Option<Train>> {
        Ok(self
            .inner
            .read()
            .trains
            .values()
            .filter(|t| t.date == date && t.is_active)
            .max_by_key(|t| t.id)
            .cloned())
    }

    async fn record_round_result(
        &self,
        train: TrainId,
        device: &DeviceId,
        round: u32,
        metrics: RoundMetrics,
    ) -> anyhow::Result<()> {
        self.inner.write().results.push(RoundRecord {
            train_id: train,
            device_id: device.clone(),
            round,
            metrics,
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    async fn commit_aggregated_round(
        &self,
        train: TrainId,
        weights: Vec<Tensor>,
        confusion: Option<ConfusionSnapshot>,
    ) -> anyhow::Result<Train> {
        let mut inner = self.inner.write();
        let t = inner
            .trains
            .get_mut(&train)
            .with_context(|| format!("unknown training session {train}"))?;
        t.round_count += 1;
        t.global_weights = Some(weights);
        if confusion.is_some() {
            t.global_confusion = confusion;
        }
        Ok(t.clone())
    }

    async fn finalize_session(&self, train: TrainId) -> anyhow::Result<()> {
        let mut inner = self.inner.write();
        let t = inner
            .trains
            .get_mut(&train)
            .with_context(|| format!("unknown training session {train}"))?;
        t.is_active = false;
        t.ready = true;
        Ok(())
    }

    async fn round_results(&self, train: TrainId, round: u32) -> anyhow::Result<Vec<RoundMetrics>> {
        Ok(self
            .inner
            .read()
            .results
            .iter()
            .filter(|r| r.train_id == train && r.round == round)
            .map(|r| r.metrics.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        Utc::now().date_naive()
    }

    #[tokio::test]
    async fn one_session_per_date_and_model() {
        let store = MemoryStore::new();
        let a = store.get_or_create_session(day(), "dnn", 10, 5).await.unwrap();
        let b = store.get_or_create_session(day(), "dnn", 30, 5).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.max_rounds, 30);
        let other = store.get_or_create_session(day(), "cnn", 10, 5).await.unwrap();
        assert_ne!(a.id, other.id);
    }

    #[tokio::test]
    async fn reactivation_keeps_round_count() {
        let store = MemoryStore::new();
        let t = store.get_or_create_session(day(), "dnn", 2, 1).await.unwrap();
        store
            .commit_aggregated_round(t.id, vec![Tensor::from_flat(vec![1.0])], None)
            .await
            .unwrap();
        store.finalize_session(t.id).await.unwrap();
        let again = store.get_or_create_session(day(), "dnn", 2, 1).await.unwrap();
        assert!(again.is_active);
        assert_eq!(again.round_count, 1);
    }

    #[tokio::test]
    async fn commit_increments_by_exactly_one() {
        let store = MemoryStore::new();
        let t = store.get_or_create_session(day(), "dnn", 5, 1).await.unwrap();
        assert_eq!(t.round_count, 0);
        let t = store
            .commit_aggregated_round(t.id, vec![Tensor::from_flat(vec![1.0])], None)
            .await
            .unwrap();
        assert_eq!(t.round_count, 1);
        assert_eq!(t.global_weights, Some(vec![Tensor::from_flat(vec![1.0])]));
        let t = store
            .commit_aggregated_round(t.id, vec![Tensor::from_flat(vec![2.0])], None)
            .await
            .unwrap();
        assert_eq!(t.round_count, 2);
        assert_eq!(t.global_weights, Some(vec![Tensor::from_flat(vec![2.0])]));
    }

    #[tokio::test]
    async fn commit_keeps_confusion_until_replaced() {
        let store = MemoryStore::new();
        let t = store.get_or_create_session(day(), "dnn", 5, 1).await.unwrap();
        let snap = ConfusionSnapshot {
            matrix: vec![vec![1.0]],
            support: None,
            classes: None,
        };
        let t = store
            .commit_aggregated_round(t.id, vec![], Some(snap.clone()))
            .await
            .unwrap();
        assert_eq!(t.global_confusion, Some(snap.clone()));
        // a round without confusion data leaves the last snapshot in place
        let t = store.commit_aggregated_round(t.id, vec![], None).await.unwrap();
        assert_eq!(t.global_confusion, Some(snap));
    }

    #[tokio::test]
    async fn average_accuracy_falls_back_and_defaults_to_zero() {
        let store = MemoryStore::new();
        let t = store.get_or_create_session(day(), "dnn", 5, 1).await.unwrap();
        assert_eq!(store.average_accuracy(t.id, 0).await.unwrap(), 0.0);

        let mut direct = RoundMetrics::empty(0);
        direct.accuracy = Some(0.9);
        let mut fallback = RoundMetrics::empty(0);
        fallback.val_accuracy = Some(0.7);
        let silent = RoundMetrics::empty(0);
        for (dev, m) in [("a", direct), ("b", fallback), ("c", silent)] {
            store.record_round_result(t.id, &dev.to_string(), 0, m).await.unwrap();
        }
        let avg = store.average_accuracy(t.id, 0).await.unwrap();
        assert!((avg - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn duplicate_round_results_are_kept() {
        let store = MemoryStore::new();
        let t = store.get_or_create_session(day(), "dnn", 5, 1).await.unwrap();
        let dev = "a".to_string();
        store.record_round_result(t.id, &dev, 0, RoundMetrics::empty(0)).await.unwrap();
        store.record_round_result(t.id, &dev, 0, RoundMetrics::empty(0)).await.unwrap();
        assert_eq!(store.round_results(t.id, 0).await.unwrap().len(), 2);
        assert_eq!(store.round_results(t.id, 1).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn latest_active_picks_newest() {
        let store = MemoryStore::new();
        let a = store.get_or_create_session(day(), "dnn", 5, 1).await.unwrap();
        let b = store.get_or_create_session(day(), "cnn", 5, 1).await.unwrap();
        assert_eq!(store.latest_active(day()).await.unwrap().unwrap().id, b.id);
        store.finalize_session(b.id).await.unwrap();
        assert_eq!(store.latest_active(day()).await.unwrap().unwrap().id, a.id);
    }
}
