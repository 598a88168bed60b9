//! Tensor type and the opaque transport codec.
//!
//! The coordinator never interprets model semantics; a submission is an
//! ordered list of shaped numeric arrays. On the wire that list travels as
//! JSON bytes, hex-armored so it can sit inside a text frame untouched.

use serde::{Deserialize, Serialize};

use crate::error::CoordError;

/// One layer's worth of numbers: flattened row-major data plus its shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, CoordError> {
        let t = Self { shape, data };
        if t.volume() != t.data.len() {
            return Err(CoordError::Decode(format!(
                "shape {:?} does not cover {} values",
                t.shape,
                t.data.len()
            )));
        }
        Ok(t)
    }

    /// Rank-1 tensor straight from a flat vector.
    pub fn from_flat(data: Vec<f32>) -> Self {
        Self { shape: vec![data.len()], data }
    }

    fn volume(&self) -> usize {
        self.shape.iter().product()
    }
}

pub fn encode_tensors(tensors: &[Tensor]) -> Result<Vec<u8>, CoordError> {
    serde_json::to_vec(tensors).map_err(|e| CoordError::Decode(e.to_string()))
}

pub fn decode_tensors(blob: &[u8]) -> Result<Vec<Tensor>, CoordError> {
    let tensors: Vec<Tensor> =
        serde_json::from_slice(blob).map_err(|e| CoordError::Decode(e.to_string()))?;
    for (i, t) in tensors.iter().enumerate() {
        if t.volume() != t.data.len() {
            return Err(CoordError::Decode(format!(
                "tensor {i}: shape {:?} does not cover {} values",
                t.shape,
                t.data.len()
            )));
        }
    }
    Ok(tensors)
}

/// Armors an encoded tensor list for the text transport.
pub fn tensors_to_hex(tensors: &[Tensor]) -> Result<String, CoordError> {
    Ok(hex::encode(encode_tensors(tensors)?))
}

pub fn tensors_from_hex(armored: &str) -> Result<Vec<Tensor>, CoordError> {
    let blob = hex::decode(armored.trim())
        .map_err(|e| CoordError::Decode(format!("hex armor: {e}")))?;
    decode_tensors(&blob)
}
