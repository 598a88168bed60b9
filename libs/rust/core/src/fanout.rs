//! Live connection registry and broadcast fanout.
//!
//! Every WebSocket connection registers an outbound sender here. A
//! connection is either bound to a device (after credential resolution) or
//! marked as an observer; observers receive the diagnostic feed but never
//! count toward a round's quorum. Delivery is best-effort: broadcasts walk
//! a snapshot of senders, and a dead sender is reaped instead of aborting
//! the walk.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::device::{Device, DeviceId};
use crate::protocol::{Outbound, SubscriberInfo};

pub type ConnId = Uuid;

#[derive(Clone)]
struct Peer {
    device: Option<Device>,
    observer: bool,
    tx: UnboundedSender<Outbound>,
}

#[derive(Default)]
pub struct Fanout {
    peers: RwLock<HashMap<ConnId, Peer>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tx: UnboundedSender<Outbound>) -> ConnId {
        let id = Uuid::new_v4();
        self.peers.write().insert(id, Peer { device: None, observer: false, tx });
        id
    }

    pub fn bind_device(&self, conn: ConnId, device: Device) {
        if let Some(p) = self.peers.write().get_mut(&conn) {
            p.device = Some(device);
        }
    }

    pub fn mark_observer(&self, conn: ConnId) {
        if let Some(p) = self.peers.write().get_mut(&conn) {
            p.observer = true;
        }
    }

    /// Removes the connection, returning the device it was bound to.
    pub fn remove(&self, conn: ConnId) -> Option<Device> {
        self.peers.write().remove(&conn).and_then(|p| p.device)
    }

    /// Device ids with a live authenticated connection right now. Feeds the
    /// quorum snapshot at round start and the dynamic fallback.
    pub fn connected_devices(&self) -> HashSet<DeviceId> {
        self.peers
            .read()
            .values()
            .filter_map(|p| p.device.as_ref().map(|d| d.id.clone()))
            .collect()
    }

    /// Roster snapshot for `full_subscribers`.
    pub fn subscribers(&self) -> Vec<SubscriberInfo> {
        self.peers
            .read()
            .values()
            .filter_map(|p| p.device.as_ref())
            .map(|d| SubscriberInfo {
                device_id: d.id.clone(),
                device_name: d.name.clone(),
                device_token: d.token.clone(),
            })
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Best-effort delivery to every live connection, devices and observers.
    pub fn broadcast(&self, msg: &Outbound) {
        self.send_where(msg, |_| true);
    }

    /// Observer-only delivery for the diagnostic feed.
    pub fn emit_ui(&self, msg: &Outbound) {
        self.send_where(msg, |p| p.observer);
    }

    pub fn ui_log(&self, text: impl Into<String>) {
        self.emit_ui(&Outbound::TrainLog { text: text.into() });
    }

    fn send_where(&self, msg: &Outbound, keep: impl Fn(&Peer) -> bool) {
        let snapshot: Vec<(ConnId, UnboundedSender<Outbound>)> = self
            .peers
            .read()
            .iter()
            .filter(|(_, p)| keep(p))
            .map(|(id, p)| (*id, p.tx.clone()))
            .collect();
        let mut dead = Vec::new();
        for (id, tx) in snapshot {
            if tx.send(msg.clone()).is_err() {
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            let mut peers = self.peers.write();
            for id in &dead {
                peers.remove(id);
            }
            tracing::debug!(reaped = dead.len(), "dropped closed connections during fanout");
        }
    }
}
