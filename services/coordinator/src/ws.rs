//! WebSocket endpoint for the training fleet.
//!
//! One task per connection reads frames and drives the round engine; a
//! paired writer task owns the sink and drains the connection's outbound
//! queue, so a slow socket never blocks the reader or a broadcast. The
//! writer also delivers the close frame, after the queue is flushed, which
//! keeps error replies ordered before the close.

use std::borrow::Cow;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::Utc;
use fedfleet_core::device::Device;
use fedfleet_core::error::CoordError;
use fedfleet_core::fanout::ConnId;
use fedfleet_core::protocol::{Inbound, Outbound, CLOSE_AUTH_FAILURE, CLOSE_PROTOCOL_ERROR};
use fedfleet_core::store::TrainId;
use fedfleet_core::tensor;
use futures::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

use crate::AppState;

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle(socket, state))
}

enum Flow {
    Continue,
    Close(CloseFrame<'static>),
}

fn close_frame(code: u16, reason: &'static str) -> CloseFrame<'static> {
    CloseFrame { code, reason: Cow::Borrowed(reason) }
}

struct Conn {
    state: AppState,
    id: ConnId,
    tx: UnboundedSender<Outbound>,
    bound: Option<Device>,
}

async fn handle(socket: WebSocket, state: AppState) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let conn_id = state.fanout.register(tx.clone());
    debug!(conn = %conn_id, "socket connected");

    let close_reason: Arc<Mutex<Option<CloseFrame<'static>>>> = Arc::new(Mutex::new(None));
    let writer = tokio::spawn(drain_outbound(sink, rx, close_reason.clone()));

    let mut conn = Conn { state: state.clone(), id: conn_id, tx, bound: None };
    while let Some(frame) = stream.next().await {
        let msg = match frame {
            Ok(m) => m,
            Err(e) => {
                debug!(conn = %conn_id, error = %e, "socket read failed");
                break;
            }
        };
        let flow = match msg {
            Message::Text(text) => conn.dispatch(&text).await,
            Message::Binary(_) => {
                Flow::Close(close_frame(CLOSE_PROTOCOL_ERROR, "binary frames unsupported"))
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => Flow::Continue,
        };
        if let Flow::Close(frame) = flow {
            *close_reason.lock() = Some(frame);
            break;
        }
    }

    // drop both senders so the writer drains and delivers any close frame
    let device = state.fanout.remove(conn_id);
    drop(conn);
    if let Some(dev) = &device {
        if let Err(e) = state.directory.mark_offline(&dev.id).await {
            warn!(device = %dev.id, error = %e, "could not mark device offline");
        }
        state.fanout.ui_log(format!("{} disconnected", dev.name));
        info!(conn = %conn_id, device = %dev.id, "device disconnected");
    } else {
        debug!(conn = %conn_id, "socket closed");
    }
    let _ = writer.await;
}

/// Writer half: drains the connection's queue into the sink, then delivers
/// the close frame, if one was set, after the last queued reply.
async fn drain_outbound<S>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    close_reason: Arc<Mutex<Option<CloseFrame<'static>>>>,
) where
    S: Sink<Message> + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let text = match serde_json::to_string(&msg) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "outbound frame did not serialize");
                continue;
            }
        };
        if sink.send(Message::Text(text)).await.is_err() {
            return;
        }
    }
    // take the frame out first; the guard must not cross the await
    let frame = close_reason.lock().take();
    if let Some(frame) = frame {
        let _ = sink.send(Message::Close(Some(frame))).await;
    }
}

impl Conn {
    fn send(&self, msg: Outbound) {
        let _ = self.tx.send(msg);
    }

    fn reply_error(&self, message: impl Into<String>) {
        self.send(Outbound::Error { message: message.into() });
    }

    async fn dispatch(&mut self, raw: &str) -> Flow {
        let msg: Inbound = match serde_json::from_str(raw) {
            Ok(m) => m,
            Err(e) => {
                debug!(conn = %self.id, error = %e, "unrecognized frame");
                return Flow::Close(close_frame(CLOSE_PROTOCOL_ERROR, "unrecognized message"));
            }
        };
        match msg {
            Inbound::Hello { device_token, mode } => {
                self.on_hello(&device_token, mode.as_deref()).await
            }
            Inbound::Subscribe { device_token, client } => {
                self.on_subscribe(&device_token, client).await
            }
            Inbound::UiSync => self.on_ui_sync(),
            Inbound::StartTraining { model, rounds, epochs } => {
                self.on_start_training(model, rounds, epochs).await
            }
            Inbound::Weights { train_id, round, payload, metrics, device_token } => {
                self.on_weights(train_id, round, &payload, metrics, device_token.as_deref())
                    .await
            }
            Inbound::Heartbeat => {
                self.send(Outbound::Pong);
                Flow::Continue
            }
        }
    }

    /// Resolves a credential through the device directory.
    async fn resolve(&self, token: &str) -> Result<Device, CoordError> {
        match self.state.directory.resolve(token).await {
            Ok(Some(device)) => Ok(device),
            Ok(None) => Err(CoordError::AuthenticationFailure),
            Err(e) => Err(CoordError::Persistence(e)),
        }
    }

    async fn bind(&mut self, token: &str) -> Result<Device, Flow> {
        let device = match self.resolve(token).await {
            Ok(d) => d,
            Err(e @ CoordError::AuthenticationFailure) => {
                info!(conn = %self.id, error = %e, "credential rejected");
                return Err(Flow::Close(close_frame(
                    CLOSE_AUTH_FAILURE,
                    "unknown device credential",
                )));
            }
            Err(e) => {
                warn!(conn = %self.id, error = %e, "device lookup failed");
                return Err(Flow::Close(close_frame(CLOSE_AUTH_FAILURE, "device lookup failed")));
            }
        };
        if let Err(e) = self.state.directory.touch(&device.id).await {
            warn!(device = %device.id, error = %e, "could not mark device online");
        }
        self.state.fanout.bind_device(self.id, device.clone());
        self.bound = Some(device.clone());
        Ok(device)
    }

    async fn on_hello(&mut self, token: &str, mode: Option<&str>) -> Flow {
        let device = match self.bind(token).await {
            Ok(d) => d,
            Err(flow) => return flow,
        };
        if matches!(mode, Some("ui") | Some("observer")) {
            self.state.fanout.mark_observer(self.id);
        }
        self.send(Outbound::Ack { status: "ok".into() });
        self.replay_global_weights().await;
        self.state.fanout.ui_log(format!("{} connected", device.name));
        info!(conn = %self.id, device = %device.id, "device authenticated");
        Flow::Continue
    }

    /// Today's newest active session, replayed to this connection only, so
    /// a reconnecting device can resume mid-run.
    async fn replay_global_weights(&self) {
        let today = Utc::now().date_naive();
        let train = match self.state.store.latest_active(today).await {
            Ok(Some(t)) => t,
            Ok(None) => return,
            Err(e) => {
                warn!(conn = %self.id, error = %e, "weight replay lookup failed");
                return;
            }
        };
        let Some(weights) = &train.global_weights else { return };
        match tensor::tensors_to_hex(weights) {
            Ok(payload) => self.send(Outbound::GlobalWeights {
                payload,
                round: train.round_count,
                accuracy: None,
                model: train.model_name.clone(),
                train_id: train.id,
                confusion: None,
                classes: None,
                support: None,
            }),
            Err(e) => warn!(train_id = train.id, error = %e, "stored weights did not encode"),
        }
    }

    async fn on_subscribe(&mut self, token: &str, client: Option<String>) -> Flow {
        let device = match self.bind(token).await {
            Ok(d) => d,
            Err(flow) => return flow,
        };
        self.state.fanout.broadcast(&Outbound::Subscribe {
            device_token: device.token.clone(),
            device_name: client.unwrap_or_else(|| device.name.clone()),
            device_id: device.id.clone(),
        });
        Flow::Continue
    }

    fn on_ui_sync(&self) -> Flow {
        self.state.fanout.mark_observer(self.id);
        self.send(Outbound::FullSubscribers { items: self.state.fanout.subscribers() });
        Flow::Continue
    }

    async fn on_start_training(
        &self,
        model: Option<String>,
        rounds: Option<u32>,
        epochs: Option<u32>,
    ) -> Flow {
        // the requester is an observer from here on
        self.state.fanout.mark_observer(self.id);
        let cfg = &self.state.cfg;
        let model = model.unwrap_or_else(|| cfg.default_model.clone()).to_lowercase();
        let rounds = rounds.unwrap_or(cfg.default_rounds).max(1);
        let epochs = epochs.unwrap_or(cfg.default_epochs).max(1);
        match self.state.engine.start_session(&model, rounds, epochs).await {
            Ok(train) => {
                info!(conn = %self.id, train_id = train.id, model = %model, "training session started");
                Flow::Continue
            }
            Err(e) => {
                warn!(conn = %self.id, error = %e, "start_training failed");
                self.reply_error(format!("could not start training: {e}"));
                Flow::Continue
            }
        }
    }

    async fn on_weights(
        &mut self,
        train_id: TrainId,
        round: Option<u32>,
        payload: &str,
        metrics: Option<Value>,
        token: Option<&str>,
    ) -> Flow {
        // a device may submit on a fresh connection by carrying its token
        let device = match (&self.bound, token) {
            (Some(d), _) => d.clone(),
            (None, Some(token)) => match self.bind(token).await {
                Ok(d) => d,
                Err(flow) => return flow,
            },
            (None, None) => {
                info!(conn = %self.id, "weights without authentication");
                return Flow::Close(close_frame(CLOSE_AUTH_FAILURE, "not authenticated"));
            }
        };
        let tensors = match tensor::tensors_from_hex(payload) {
            Ok(t) if t.is_empty() => {
                self.reply_error("empty weight payload");
                return Flow::Continue;
            }
            Ok(t) => t,
            Err(e) => {
                debug!(conn = %self.id, error = %e, "weight payload did not decode");
                self.reply_error(format!("bad weight payload: {e}"));
                return Flow::Continue;
            }
        };
        match self
            .state
            .engine
            .handle_submission(train_id, &device.id, round, tensors, metrics.as_ref())
            .await
        {
            Ok(outcome) => {
                debug!(conn = %self.id, device = %device.id, ?outcome, "submission handled");
                Flow::Continue
            }
            Err(CoordError::UnknownSession(id)) => {
                self.reply_error(format!("unknown training session {id}"));
                Flow::Continue
            }
            Err(e) => {
                warn!(conn = %self.id, device = %device.id, error = %e, "submission failed");
                self.reply_error(format!("submission failed: {e}"));
                Flow::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fedfleet_core::config::CoordinatorConfig;
    use fedfleet_core::device::DeviceRoster;
    use fedfleet_core::fanout::Fanout;
    use fedfleet_core::round::RoundEngine;
    use fedfleet_core::store::{MemoryStore, TrainStore};

    fn test_state() -> AppState {
        let store: Arc<dyn TrainStore> = Arc::new(MemoryStore::new());
        let fanout = Arc::new(Fanout::new());
        let engine = RoundEngine::new(store.clone(), fanout.clone(), Duration::from_secs(30));
        AppState {
            cfg: Arc::new(CoordinatorConfig::default()),
            store,
            directory: Arc::new(DeviceRoster::empty()),
            fanout,
            engine,
        }
    }

    #[tokio::test]
    async fn writer_flushes_replies_before_the_close_frame() {
        let (tx, rx) = mpsc::unbounded_channel();
        let close_reason: Arc<Mutex<Option<CloseFrame<'static>>>> = Arc::new(Mutex::new(None));
        tx.send(Outbound::Error { message: "bad payload".into() }).unwrap();
        *close_reason.lock() = Some(close_frame(CLOSE_PROTOCOL_ERROR, "unrecognized message"));
        drop(tx);

        let (sink, collected) = futures::channel::mpsc::unbounded::<Message>();
        drain_outbound(sink, rx, close_reason).await;

        let frames: Vec<Message> = collected.collect().await;
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], Message::Text(t) if t.contains("bad payload")));
        match &frames[1] {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CLOSE_PROTOCOL_ERROR);
                assert_eq!(frame.reason, "unrecognized message");
            }
            other => panic!("expected a close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn writer_sends_no_close_frame_without_a_reason() {
        let (tx, rx) = mpsc::unbounded_channel();
        let close_reason = Arc::new(Mutex::new(None));
        tx.send(Outbound::Pong).unwrap();
        drop(tx);

        let (sink, collected) = futures::channel::mpsc::unbounded::<Message>();
        drain_outbound(sink, rx, close_reason).await;

        let frames: Vec<Message> = collected.collect().await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], Message::Text(_)));
    }

    #[tokio::test]
    async fn unknown_credential_maps_to_the_auth_taxonomy() {
        let state = test_state();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = state.fanout.register(tx.clone());
        let mut conn = Conn { state, id, tx, bound: None };

        assert!(matches!(
            conn.resolve("no-such-token").await,
            Err(CoordError::AuthenticationFailure)
        ));
        match conn.bind("no-such-token").await {
            Err(Flow::Close(frame)) => assert_eq!(frame.code, CLOSE_AUTH_FAILURE),
            _ => panic!("expected an auth close"),
        }
        assert!(conn.bound.is_none());
    }
}
