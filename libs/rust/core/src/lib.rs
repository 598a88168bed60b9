//! Core federated-round coordination shared by FedFleet services.

pub mod config;
pub mod confusion;
pub mod device;
pub mod error;
pub mod fanout;
pub mod fedavg;
pub mod metrics;
pub mod protocol;
pub mod round;
pub mod store;
pub mod tensor;

pub use config::CoordinatorConfig;
pub use confusion::{accumulate, ConfusionSnapshot};
pub use device::{Device, DeviceDirectory, DeviceId, DeviceRoster};
pub use error::CoordError;
pub use fanout::{ConnId, Fanout};
pub use fedavg::fedavg;
pub use metrics::RoundMetrics;
pub use protocol::{
    Inbound, Outbound, SubscriberInfo, CLOSE_AUTH_FAILURE, CLOSE_PROTOCOL_ERROR,
};
pub use round::{RoundEngine, SubmitOutcome};
pub use store::{MemoryStore, RoundRecord, Train, TrainId, TrainStore};
pub use tensor::{
    decode_tensors, encode_tensors, tensors_from_hex, tensors_to_hex, Tensor,
};
