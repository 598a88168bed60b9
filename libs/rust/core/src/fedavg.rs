//! Federated averaging across per-device tensor submissions.

use std::collections::BTreeMap;

use tracing::warn;

use crate::device::DeviceId;
use crate::error::CoordError;
use crate::tensor::Tensor;

/// Element-wise mean per layer across every submission.
///
/// The first device in id order fixes the reference layer shapes, so the
/// outcome does not depend on arrival order. A submission with a different
/// layer count fails the whole call naming the device. A single layer whose
/// shape disagrees is replaced by zeros of the reference shape and logged,
/// so one bad client degrades the round instead of blocking it.
pub fn fedavg(submissions: &BTreeMap<DeviceId, Vec<Tensor>>) -> Result<Vec<Tensor>, CoordError> {
    let mut devices = submissions.iter();
    let Some((reference_device, reference)) = devices.next() else {
        return Err(CoordError::NoValidSubmissions);
    };
    for (device, layers) in devices {
        if layers.len() != reference.len() {
            return Err(CoordError::ShapeMismatch {
                device: device.clone(),
                detail: format!(
                    "{} layers, reference {} set by {}",
                    layers.len(),
                    reference.len(),
                    reference_device
                ),
            });
        }
    }

    let count = submissions.len() as f64;
    let mut out = Vec::with_capacity(reference.len());
    for (k, reference_layer) in reference.iter().enumerate() {
        let mut acc = vec![0f64; reference_layer.data.len()];
        for (device, layers) in submissions {
            let layer = &layers[k];
            if layer.shape != reference_layer.shape {
                warn!(
                    %device,
                    layer = k,
                    expected = ?reference_layer.shape,
                    got = ?layer.shape,
                    "layer shape mismatch, substituting zeros"
                );
                continue;
            }
            for (a, v) in acc.iter_mut().zip(&layer.data) {
                *a += f64::from(*v);
            }
        }
        out.push(Tensor {
            shape: reference_layer.shape.clone(),
            data: acc.into_iter().map(|v| (v / count) as f32).collect(),
        });
    }
    Ok(out)
}
