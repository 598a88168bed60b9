//! Wire protocol for the training endpoint: JSON objects tagged by `type`.
//!
//! Field names are part of the device contract and do not follow internal
//! naming. The `payload` on weight messages is the hex-armored tensor blob
//! from [`crate::tensor`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::TrainId;

/// Close code when a credential fails to resolve.
pub const CLOSE_AUTH_FAILURE: u16 = 4001;
/// Close code for frames that are not part of the protocol at all.
pub const CLOSE_PROTOCOL_ERROR: u16 = 4002;

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Device announcement; authenticates the connection.
    Hello {
        device_token: String,
        #[serde(default)]
        mode: Option<String>,
    },
    /// Participation announcement, relayed to everyone.
    Subscribe {
        device_token: String,
        /// Optional display-name override for the relay.
        #[serde(default)]
        client: Option<String>,
    },
    /// Marks the connection as an observer and requests a roster snapshot.
    UiSync,
    StartTraining {
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        rounds: Option<u32>,
        #[serde(default)]
        epochs: Option<u32>,
    },
    /// A device's round submission.
    Weights {
        train_id: TrainId,
        #[serde(default)]
        round: Option<u32>,
        payload: String,
        #[serde(default)]
        metrics: Option<Value>,
        /// Lets a device submit without a prior hello on this connection.
        #[serde(default)]
        device_token: Option<String>,
    },
    Heartbeat,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriberInfo {
    pub device_id: String,
    pub device_name: String,
    pub device_token: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    GlobalWeights {
        payload: String,
        round: u32,
        accuracy: Option<f64>,
        model: String,
        train_id: TrainId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confusion: Option<Vec<Vec<f64>>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        classes: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        support: Option<Vec<f64>>,
    },
    StartTraining {
        model: String,
        round: u32,
        rounds: u32,
        train_id: TrainId,
    },
    TrainingComplete {
        rounds: u32,
        final_accuracy: Option<f64>,
        train_id: TrainId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        labels: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        matrix: Option<Vec<Vec<f64>>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        support: Option<Vec<f64>>,
    },
    /// Observer-only diagnostic feed.
    TrainLog { text: String },
    /// Observer-only loss curve point.
    TrainLoss { round: u32, loss: f64 },
    /// Observer-only rolling confusion preview.
    ConfusionMatrix {
        labels: Option<Vec<String>>,
        matrix: Vec<Vec<f64>>,
        support: Option<Vec<f64>>,
    },
    /// Relay of a device's participation announcement.
    Subscribe {
        device_token: String,
        device_name: String,
        device_id: String,
    },
    FullSubscribers { items: Vec<SubscriberInfo> },
    Pong,
    Ack { status: String },
    Error { message: String },
}
