//! Error taxonomy for the coordination subsystem.
//!
//! Nothing here is allowed to take the process down: decode and shape
//! problems are reported to the offending connection or degrade a single
//! round, persistence problems leave round state in place for a retry.

use thiserror::Error;

use crate::device::DeviceId;
use crate::store::TrainId;

#[derive(Debug, Error)]
pub enum CoordError {
    /// Transport payload could not be decoded into a tensor list.
    #[error("malformed payload: {0}")]
    Decode(String),

    /// A device submitted tensors inconsistent with the round's reference
    /// shapes.
    #[error("shape mismatch from device {device}: {detail}")]
    ShapeMismatch { device: DeviceId, detail: String },

    /// Credential did not resolve to a known device.
    #[error("credential did not resolve to a known device")]
    AuthenticationFailure,

    /// Aggregation fired with nothing usable in the buffer.
    #[error("no valid submissions to aggregate")]
    NoValidSubmissions,

    /// Message referenced a training session the registry does not know.
    #[error("unknown training session {0}")]
    UnknownSession(TrainId),

    /// Session registry call failed; the caller keeps its round state so a
    /// later submission or timeout can retry.
    #[error("persistence failure: {0}")]
    Persistence(anyhow::Error),
}

impl From<anyhow::Error> for CoordError {
    fn from(e: anyhow::Error) -> Self {
        CoordError::Persistence(e)
    }
}
