//! Round aggregation state machine.
//!
//! Per session: collect per-device weight submissions, close the round when
//! the quorum is complete or the deadline passes, aggregate, commit through
//! the registry and fan the new global model out. All round-state mutation
//! for one session happens under that session's slot lock; sessions never
//! block each other. The buffer take, the quorum shrink and the timer rearm
//! are one critical section, which is what makes aggregation fire at most
//! once per (session, round).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::confusion;
use crate::device::DeviceId;
use crate::error::CoordError;
use crate::fanout::Fanout;
use crate::fedavg::fedavg;
use crate::metrics as round_metrics;
use crate::protocol::Outbound;
use crate::store::{Train, TrainId, TrainStore};
use crate::tensor::{self, Tensor};

static ROUND_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("fedfleet_rounds"));

struct EngineMetrics {
    submissions_total: Counter<u64>,
    rounds_completed: Counter<u64>,
    round_timeouts: Counter<u64>,
    sessions_finished: Counter<u64>,
    aggregation_latency_ms: Histogram<f64>,
}

impl EngineMetrics {
    fn new() -> Self {
        Self {
            submissions_total: ROUND_METER
                .u64_counter("fed_submissions_total")
                .with_description("Weight submissions accepted")
                .build(),
            rounds_completed: ROUND_METER
                .u64_counter("fed_rounds_completed_total")
                .with_description("Rounds aggregated and committed")
                .build(),
            round_timeouts: ROUND_METER
                .u64_counter("fed_round_timeouts_total")
                .with_description("Rounds closed by deadline instead of quorum")
                .build(),
            sessions_finished: ROUND_METER
                .u64_counter("fed_sessions_finished_total")
                .with_description("Sessions that reached max rounds")
                .build(),
            aggregation_latency_ms: ROUND_METER
                .f64_histogram("fed_aggregation_latency_ms")
                .with_description("Aggregation latency ms")
                .build(),
        }
    }
}

#[derive(Default)]
struct RoundState {
    /// Quorum snapshot; empty means no explicit start yet and readiness
    /// falls back to whoever is connected (degraded mode).
    expected: HashSet<DeviceId>,
    received: BTreeMap<DeviceId, Vec<Tensor>>,
    deadline: Option<Instant>,
    timer: Option<TimerHandle>,
}

struct TimerHandle {
    round: u32,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct SessionSlot {
    state: Mutex<RoundState>,
}

/// What [`RoundEngine::handle_submission`] did with a submission.
#[derive(Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Buffered toward the current round's quorum.
    Buffered { have: usize, goal: usize },
    /// Persisted for a past round or a finished session; no round state
    /// touched.
    Historical,
    /// This submission closed the round and the aggregation committed.
    Aggregated,
    /// The round fired but produced nothing usable; the window was rearmed.
    Stalled,
}

struct RoundTake {
    round: u32,
    trigger: &'static str,
    submissions: BTreeMap<DeviceId, Vec<Tensor>>,
}

enum RoundOutcome {
    Committed,
    Stalled,
}

pub struct RoundEngine {
    store: Arc<dyn TrainStore>,
    fanout: Arc<Fanout>,
    round_timeout: Duration,
    slots: RwLock<HashMap<TrainId, Arc<SessionSlot>>>,
    metrics: EngineMetrics,
    self_ref: Weak<RoundEngine>,
}

impl RoundEngine {
    pub fn new(store: Arc<dyn TrainStore>, fanout: Arc<Fanout>, round_timeout: Duration) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            fanout,
            round_timeout,
            slots: RwLock::new(HashMap::new()),
            metrics: EngineMetrics::new(),
            self_ref: weak.clone(),
        })
    }

    /// Sessions with live in-memory round state.
    pub fn active_sessions(&self) -> usize {
        self.slots.read().len()
    }

    /// Explicit round start: get-or-create the session for today and rearm
    /// its collection window with the currently connected devices as the
    /// quorum snapshot.
    pub async fn start_session(
        &self,
        model: &str,
        max_rounds: u32,
        epochs: u32,
    ) -> Result<Train, CoordError> {
        let date = chrono::Utc::now().date_naive();
        let train = self.store.get_or_create_session(date, model, max_rounds, epochs).await?;
        let connected = self.fanout.connected_devices();
        {
            let slot = self.slot(train.id);
            let mut st = slot.state.lock();
            st.expected = connected.clone();
            st.received.clear();
            st.deadline = Some(Instant::now() + self.round_timeout);
            self.arm_timer(&mut st, train.id, train.round_count);
        }
        info!(
            train_id = train.id,
            model = %train.model_name,
            round = train.round_count,
            expected = connected.len(),
            "round_armed"
        );
        self.fanout.broadcast(&Outbound::StartTraining {
            model: train.model_name.clone(),
            round: train.round_count,
            rounds: train.max_rounds,
            train_id: train.id,
        });
        self.fanout.ui_log(format!(
            "training started: {} from round {}",
            train.model_name, train.round_count
        ));
        if let Some(weights) = &train.global_weights {
            let payload = tensor::tensors_to_hex(weights)?;
            self.fanout.broadcast(&Outbound::GlobalWeights {
                payload,
                round: train.round_count,
                accuracy: None,
                model: train.model_name.clone(),
                train_id: train.id,
                confusion: None,
                classes: None,
                support: None,
            });
        }
        Ok(train)
    }

    /// A device's weight submission. Raw metrics are persisted first, even
    /// for late or post-final submissions; only live ones touch round state.
    pub async fn handle_submission(
        &self,
        train_id: TrainId,
        device: &DeviceId,
        round: Option<u32>,
        tensors: Vec<Tensor>,
        raw_metrics: Option<&Value>,
    ) -> Result<SubmitOutcome, CoordError> {
        let train = self
            .store
            .train(train_id)
            .await?
            .ok_or(CoordError::UnknownSession(train_id))?;
        let claimed = round.unwrap_or(train.round_count);
        if claimed > train.round_count {
            warn!(
                train_id,
                %device,
                claimed,
                current = train.round_count,
                "submission tagged ahead of the session, folding into the current round"
            );
        }
        let round_no = claimed.min(train.round_count);
        let metrics = round_metrics::normalize(raw_metrics, round_no);
        self.store.record_round_result(train_id, device, round_no, metrics.clone()).await?;
        self.metrics.submissions_total.add(1, &[]);

        if !train.is_active || round_no < train.round_count {
            debug!(train_id, %device, round = round_no, "historical submission persisted");
            return Ok(SubmitOutcome::Historical);
        }

        // observer diagnostics ride on every live submission
        if let Some(loss) = metrics.loss_like() {
            self.fanout.emit_ui(&Outbound::TrainLoss { round: round_no, loss });
        }
        let parts = self.store.round_results(train_id, round_no).await?;
        if let Some(snap) = confusion::accumulate(&parts) {
            self.fanout.emit_ui(&Outbound::ConfusionMatrix {
                labels: snap.classes,
                matrix: snap.matrix,
                support: snap.support,
            });
        }

        let take = {
            let slot = self.slot(train_id);
            let mut st = slot.state.lock();
            st.received.insert(device.clone(), tensors);
            if st.deadline.is_none() {
                // implicit round start: first activity for a session nobody
                // explicitly started
                st.deadline = Some(Instant::now() + self.round_timeout);
                self.arm_timer(&mut st, train_id, train.round_count);
            }
            let goal: HashSet<DeviceId> = if st.expected.is_empty() {
                debug!(train_id, "expected_fallback_dynamic");
                self.fanout.connected_devices()
            } else {
                st.expected.clone()
            };
            let quorum = !goal.is_empty() && goal.iter().all(|d| st.received.contains_key(d));
            let expired = st.deadline.map(|d| Instant::now() >= d).unwrap_or(false);
            if !quorum && !expired {
                let have = st.received.len();
                debug!(train_id, have, goal = goal.len(), "submission buffered");
                return Ok(SubmitOutcome::Buffered { have, goal: goal.len() });
            }
            let trigger = if quorum { "quorum" } else { "deadline" };
            self.take_round(&mut st, train_id, train.round_count, trigger)
        };

        match self.run_aggregation(train_id, take).await? {
            RoundOutcome::Committed => Ok(SubmitOutcome::Aggregated),
            RoundOutcome::Stalled => Ok(SubmitOutcome::Stalled),
        }
    }

    /// Timeout path: close the round with whatever arrived, or rearm when
    /// the buffer is empty. A timer that outlived its round is a no-op.
    async fn on_deadline(&self, train_id: TrainId, armed_round: u32) {
        let train = match self.store.train(train_id).await {
            Ok(Some(t)) => t,
            Ok(None) => {
                self.drop_slot(train_id);
                return;
            }
            Err(e) => {
                warn!(train_id, error = ?e, "deadline check could not load the session, rearming");
                self.rearm(train_id, armed_round);
                return;
            }
        };
        if !train.is_active || train.round_count != armed_round {
            debug!(train_id, armed_round, current = train.round_count, "stale_timer_ignored");
            return;
        }
        let take = {
            let slot = self.slot(train_id);
            let mut st = slot.state.lock();
            if st.received.is_empty() {
                warn!(train_id, round = armed_round, "deadline with no submissions, rearming");
                st.deadline = Some(Instant::now() + self.round_timeout);
                self.arm_timer(&mut st, train_id, armed_round);
                None
            } else {
                self.metrics.round_timeouts.add(1, &[]);
                Some(self.take_round(&mut st, train_id, armed_round, "deadline"))
            }
        };
        if let Some(take) = take {
            let round = take.round;
            if let Err(e) = self.run_aggregation(train_id, take).await {
                warn!(train_id, round, error = %e, "deadline aggregation failed");
            }
        }
    }

    /// The exactly-once transition. Empties the buffer, shrinks the quorum
    /// to the devices that actually contributed and rearms the window, all
    /// under the slot lock, so no concurrent submission or timer can take
    /// the same round again.
    fn take_round(
        &self,
        st: &mut RoundState,
        train_id: TrainId,
        round: u32,
        trigger: &'static str,
    ) -> RoundTake {
        let submissions = std::mem::take(&mut st.received);
        st.expected = submissions.keys().cloned().collect();
        st.deadline = Some(Instant::now() + self.round_timeout);
        self.arm_timer(st, train_id, round);
        info!(train_id, round, trigger, contributors = submissions.len(), "round_ready");
        RoundTake { round, trigger, submissions }
    }

    async fn run_aggregation(&self, train_id: TrainId, take: RoundTake) -> Result<RoundOutcome, CoordError> {
        let started = Instant::now();
        let train = self
            .store
            .train(train_id)
            .await?
            .ok_or(CoordError::UnknownSession(train_id))?;
        let round = train.round_count;
        if round != take.round {
            debug!(train_id, taken = take.round, round, "round advanced between take and aggregate");
        }
        let (avg, contributors) = match reduce_submissions(take.submissions) {
            Ok(v) => v,
            Err(e) => {
                warn!(train_id, round, error = %e, "nothing usable to aggregate, window rearmed");
                self.fanout
                    .ui_log(format!("round {round}: no valid weights, waiting for resubmission"));
                return Ok(RoundOutcome::Stalled);
            }
        };

        let parts = self.store.round_results(train_id, round).await?;
        let snapshot = confusion::accumulate(&parts);
        let accuracy = self.store.average_accuracy(train_id, round).await?;
        let avg_loss = self.store.average_loss(train_id, round).await?;
        let payload = tensor::tensors_to_hex(&avg)?;

        let updated = match self.store.commit_aggregated_round(train_id, avg, snapshot.clone()).await {
            Ok(t) => t,
            Err(e) => {
                warn!(train_id, round, error = ?e, "commit failed, restoring the round buffer");
                self.restore(train_id, round, contributors);
                return Err(CoordError::Persistence(e));
            }
        };
        self.metrics.rounds_completed.add(1, &[]);
        self.metrics
            .aggregation_latency_ms
            .record(started.elapsed().as_secs_f64() * 1000.0, &[]);
        info!(
            train_id = updated.id,
            round = updated.round_count,
            trigger = take.trigger,
            contributors = contributors.len(),
            accuracy,
            "round_committed"
        );

        self.fanout.broadcast(&Outbound::GlobalWeights {
            payload,
            round: updated.round_count,
            accuracy: Some(accuracy),
            model: updated.model_name.clone(),
            train_id: updated.id,
            confusion: snapshot.as_ref().map(|s| s.matrix.clone()),
            classes: snapshot.as_ref().and_then(|s| s.classes.clone()),
            support: snapshot.as_ref().and_then(|s| s.support.clone()),
        });
        if let Some(loss) = avg_loss {
            self.fanout.emit_ui(&Outbound::TrainLoss { round: updated.round_count, loss });
        }
        if let Some(snap) = &snapshot {
            self.fanout.emit_ui(&Outbound::ConfusionMatrix {
                labels: snap.classes.clone(),
                matrix: snap.matrix.clone(),
                support: snap.support.clone(),
            });
        }
        self.fanout.ui_log(format!(
            "round {} aggregated from {} devices (avg_acc={accuracy:.4})",
            updated.round_count,
            contributors.len()
        ));

        if updated.round_count >= updated.max_rounds {
            self.finish_session(&updated, accuracy, snapshot).await?;
            return Ok(RoundOutcome::Committed);
        }

        {
            let slot = self.slot(updated.id);
            let mut st = slot.state.lock();
            st.deadline = Some(Instant::now() + self.round_timeout);
            self.arm_timer(&mut st, updated.id, updated.round_count);
        }
        self.fanout.broadcast(&Outbound::StartTraining {
            model: updated.model_name.clone(),
            round: updated.round_count,
            rounds: updated.max_rounds,
            train_id: updated.id,
        });
        Ok(RoundOutcome::Committed)
    }

    async fn finish_session(
        &self,
        train: &Train,
        final_accuracy: f64,
        snapshot: Option<confusion::ConfusionSnapshot>,
    ) -> Result<(), CoordError> {
        self.store.finalize_session(train.id).await?;
        self.metrics.sessions_finished.add(1, &[]);
        info!(train_id = train.id, rounds = train.round_count, "session_finished");
        let final_conf = train.global_confusion.clone().or(snapshot);
        let (labels, matrix, support) = match final_conf {
            Some(s) => (s.classes, Some(s.matrix), s.support),
            None => (None, None, None),
        };
        self.fanout.broadcast(&Outbound::TrainingComplete {
            rounds: train.max_rounds,
            final_accuracy: Some(final_accuracy),
            train_id: train.id,
            labels,
            matrix,
            support,
        });
        self.fanout.ui_log(format!("training complete after {} rounds", train.round_count));
        self.drop_slot(train.id);
        Ok(())
    }

    fn slot(&self, train: TrainId) -> Arc<SessionSlot> {
        if let Some(s) = self.slots.read().get(&train) {
            return s.clone();
        }
        self.slots.write().entry(train).or_default().clone()
    }

    fn drop_slot(&self, train: TrainId) {
        if let Some(slot) = self.slots.write().remove(&train) {
            if let Some(t) = slot.state.lock().timer.take() {
                t.task.abort();
            }
        }
    }

    fn rearm(&self, train: TrainId, round: u32) {
        let slot = self.slot(train);
        let mut st = slot.state.lock();
        st.deadline = Some(Instant::now() + self.round_timeout);
        self.arm_timer(&mut st, train, round);
    }

    /// Puts a taken buffer back after a failed commit so the next submission
    /// or timeout retries the round. Entries resubmitted in the meantime win
    /// over the restored ones.
    fn restore(&self, train: TrainId, round: u32, submissions: BTreeMap<DeviceId, Vec<Tensor>>) {
        let slot = self.slot(train);
        let mut st = slot.state.lock();
        for (device, tensors) in submissions {
            st.received.entry(device).or_insert(tensors);
        }
        st.deadline = Some(Instant::now() + self.round_timeout);
        self.arm_timer(&mut st, train, round);
    }

    /// Cancels any scheduled timer for the slot and schedules a fresh one
    /// carrying the round it was armed for; a fired timer compares that
    /// round against the session's current one, so a cancelled or stale
    /// timer is a safe no-op.
    fn arm_timer(&self, st: &mut RoundState, train: TrainId, round: u32) {
        if let Some(old) = st.timer.take() {
            old.task.abort();
            if old.round != round {
                debug!(train_id = train, from = old.round, to = round, "timer moved to a new round");
            }
        }
        let Some(deadline) = st.deadline else { return };
        // a pending timer must not keep the engine alive
        let weak = self.self_ref.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(engine) = weak.upgrade() {
                engine.on_deadline(train, round).await;
            }
        });
        st.timer = Some(TimerHandle { round, task });
    }
}

impl Drop for RoundEngine {
    fn drop(&mut self) {
        for slot in self.slots.get_mut().values() {
            if let Some(t) = slot.state.lock().timer.take() {
                t.task.abort();
            }
        }
    }
}

/// FedAvg with the degraded-mode policy: a device whose layer count does
/// not match is dropped with a warning and the aggregation retried once
/// without it.
fn reduce_submissions(
    mut submissions: BTreeMap<DeviceId, Vec<Tensor>>,
) -> Result<(Vec<Tensor>, BTreeMap<DeviceId, Vec<Tensor>>), CoordError> {
    match fedavg(&submissions) {
        Ok(avg) => Ok((avg, submissions)),
        Err(CoordError::ShapeMismatch { device, detail }) => {
            warn!(%device, detail = %detail, "dropping inconsistent submission");
            submissions.remove(&device);
            if submissions.is_empty() {
                return Err(CoordError::NoValidSubmissions);
            }
            let avg = fedavg(&submissions)?;
            Ok((avg, submissions))
        }
        Err(e) => Err(e),
    }
}
