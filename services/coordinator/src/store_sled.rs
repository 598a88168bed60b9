//! sled-backed session registry.
//!
//! One keyspace, prefixed string keys:
//!   train:{id}              -> Train (json)
//!   index:{date}:{model}    -> TrainId (json)
//!   result:{train}:{round}:{seq} -> RoundRecord (json)
//!
//! Trailing separators keep scan_prefix from matching across numeric
//! boundaries. Read-modify-write cycles on train records go through one
//! mutex; everything inside it is synchronous sled work.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use fedfleet_core::confusion::ConfusionSnapshot;
use fedfleet_core::device::DeviceId;
use fedfleet_core::metrics::RoundMetrics;
use fedfleet_core::store::{RoundRecord, Train, TrainId, TrainStore};
use fedfleet_core::tensor::Tensor;
use parking_lot::Mutex;
use sled::Db;
use tracing::info;

pub struct SledStore {
    db: Db,
    write_lock: Mutex<()>,
}

fn train_key(id: TrainId) -> String {
    format!("train:{id}")
}

fn index_key(date: NaiveDate, model: &str) -> String {
    format!("index:{date}:{model}")
}

fn result_prefix(train: TrainId, round: u32) -> String {
    format!("result:{train}:{round}:")
}

impl SledStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let db = sled::open(path)
            .with_context(|| format!("open session registry at {}", path.display()))?;
        let store = Self { db, write_lock: Mutex::new(()) };
        info!(
            path = %path.display(),
            sessions = store.db.scan_prefix("train:").count(),
            "session registry opened"
        );
        Ok(store)
    }

    /// In-memory sled instance, for tests.
    #[cfg(test)]
    pub fn temporary() -> anyhow::Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db, write_lock: Mutex::new(()) })
    }

    fn load_train(&self, id: TrainId) -> anyhow::Result<Option<Train>> {
        match self.db.get(train_key(id).as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw).context("corrupt train record")?)),
            None => Ok(None),
        }
    }

    fn put_train(&self, train: &Train) -> anyhow::Result<()> {
        self.db.insert(train_key(train.id).as_bytes(), serde_json::to_vec(train)?)?;
        Ok(())
    }
}

#[async_trait]
impl TrainStore for SledStore {
    async fn get_or_create_session(
        &self,
        date: NaiveDate,
        model: &str,
        max_rounds: u32,
        epochs: u32,
    ) -> anyhow::Result<Train> {
        let _guard = self.write_lock.lock();
        if let Some(raw) = self.db.get(index_key(date, model).as_bytes())? {
            let id: TrainId = serde_json::from_slice(&raw).context("corrupt session index")?;
            let mut train = self
                .load_train(id)?
                .with_context(|| format!("session index points at missing train {id}"))?;
            if train.max_rounds != max_rounds || train.epochs != epochs || !train.is_active {
                train.max_rounds = max_rounds;
                train.epochs = epochs;
                train.is_active = true;
                self.put_train(&train)?;
                self.db.flush()?;
            }
            return Ok(train);
        }
        let id = self.db.generate_id()?;
        let train = Train {
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
        self.put_train(&train)?;
        self.db
            .insert(index_key(date, model).as_bytes(), serde_json::to_vec(&id)?)?;
        self.db.flush()?;
        Ok(train)
    }

    async fn train(&self, id: TrainId) -> anyhow::Result<Option<Train>> {
        self.load_train(id)
    }

    async fn latest_active(&self, date: NaiveDate) -> anyhow::Result<Option<Train>> {
        let mut newest: Option<Train> = None;
        for kv in self.db.scan_prefix("train:") {
            let (_, raw) = kv?;
            let t: Train = serde_json::from_slice(&raw).context("corrupt train record")?;
            if t.date == date && t.is_active && newest.as_ref().map(|n| t.id > n.id).unwrap_or(true) {
                newest = Some(t);
            }
        }
        Ok(newest)
    }

    async fn record_round_result(
        &self,
        train: TrainId,
        device: &DeviceId,
        round: u32,
        metrics: RoundMetrics,
    ) -> anyhow::Result<()> {
        let record = RoundRecord {
            train_id: train,
            device_id: device.clone(),
            round,
            metrics,
            recorded_at: Utc::now(),
        };
        let seq = self.db.generate_id()?;
        let key = format!("{}{seq}", result_prefix(train, round));
        self.db.insert(key.as_bytes(), serde_json::to_vec(&record)?)?;
        Ok(())
    }

    async fn commit_aggregated_round(
        &self,
        train: TrainId,
        weights: Vec<Tensor>,
        confusion: Option<ConfusionSnapshot>,
    ) -> anyhow::Result<Train> {
        let _guard = self.write_lock.lock();
        let mut t = self
            .load_train(train)?
            .with_context(|| format!("unknown training session {train}"))?;
        t.round_count += 1;
        t.global_weights = Some(weights);
        if confusion.is_some() {
            t.global_confusion = confusion;
        }
        self.put_train(&t)?;
        self.db.flush()?;
        Ok(t)
    }

    async fn finalize_session(&self, train: TrainId) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock();
        let mut t = self
            .load_train(train)?
            .with_context(|| format!("unknown training session {train}"))?;
        t.is_active = false;
        t.ready = true;
        self.put_train(&t)?;
        self.db.flush()?;
        Ok(())
    }

    async fn round_results(&self, train: TrainId, round: u32) -> anyhow::Result<Vec<RoundMetrics>> {
        let mut out = Vec::new();
        for kv in self.db.scan_prefix(result_prefix(train, round).as_bytes()) {
            let (_, raw) = kv?;
            let record: RoundRecord = serde_json::from_slice(&raw).context("corrupt round record")?;
            out.push(record.metrics);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        Utc::now().date_naive()
    }

    #[tokio::test]
    async fn create_then_reload() {
        let store = SledStore::temporary().unwrap();
        let a = store.get_or_create_session(day(), "dnn", 5, 10).await.unwrap();
        let b = store.get_or_create_session(day(), "dnn", 5, 10).await.unwrap();
        assert_eq!(a.id, b.id);
        let loaded = store.train(a.id).await.unwrap().unwrap();
        assert_eq!(loaded.model_name, "dnn");
        assert_eq!(loaded.round_count, 0);
    }

    #[tokio::test]
    async fn commit_round_trips_weights() {
        let store = SledStore::temporary().unwrap();
        let t = store.get_or_create_session(day(), "dnn", 5, 10).await.unwrap();
        let weights = vec![Tensor::from_flat(vec![1.5, -2.0])];
        let updated = store.commit_aggregated_round(t.id, weights.clone(), None).await.unwrap();
        assert_eq!(updated.round_count, 1);
        let loaded = store.train(t.id).await.unwrap().unwrap();
        assert_eq!(loaded.global_weights, Some(weights));
    }

    #[tokio::test]
    async fn results_scan_does_not_leak_across_rounds() {
        let store = SledStore::temporary().unwrap();
        let t = store.get_or_create_session(day(), "dnn", 5, 10).await.unwrap();
        let dev = "edge-1".to_string();
        let mut m = RoundMetrics::empty(1);
        m.loss = Some(0.5);
        store.record_round_result(t.id, &dev, 1, m).await.unwrap();
        store.record_round_result(t.id, &dev, 11, RoundMetrics::empty(11)).await.unwrap();
        store.record_round_result(t.id, &dev, 12, RoundMetrics::empty(12)).await.unwrap();
        let round1 = store.round_results(t.id, 1).await.unwrap();
        assert_eq!(round1.len(), 1);
        assert_eq!(round1[0].loss, Some(0.5));
    }

    #[tokio::test]
    async fn finalize_flips_flags_and_reactivation_restores() {
        let store = SledStore::temporary().unwrap();
        let t = store.get_or_create_session(day(), "dnn", 2, 10).await.unwrap();
        store.finalize_session(t.id).await.unwrap();
        let done = store.train(t.id).await.unwrap().unwrap();
        assert!(!done.is_active);
        assert!(done.ready);
        let again = store.get_or_create_session(day(), "dnn", 4, 10).await.unwrap();
        assert_eq!(again.id, t.id);
        assert!(again.is_active);
        assert!(again.ready, "reactivation must not clear the ready flag");
        assert_eq!(again.max_rounds, 4);
    }

    #[tokio::test]
    async fn latest_active_skips_finished_sessions() {
        let store = SledStore::temporary().unwrap();
        let a = store.get_or_create_session(day(), "dnn", 2, 10).await.unwrap();
        let b = store.get_or_create_session(day(), "cnn", 2, 10).await.unwrap();
        assert!(b.id > a.id);
        store.finalize_session(b.id).await.unwrap();
        let latest = store.latest_active(day()).await.unwrap().unwrap();
        assert_eq!(latest.id, a.id);
    }
}
