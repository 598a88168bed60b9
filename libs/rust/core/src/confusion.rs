//! Accumulates per-device confusion matrices into one round-wide snapshot.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::metrics::RoundMetrics;

/// Session/round-wide classification picture: summed confusion matrix,
/// summed per-class support, class labels from whichever device named them
/// first (assumed stable within a session).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfusionSnapshot {
    pub matrix: Vec<Vec<f64>>,
    pub support: Option<Vec<f64>>,
    pub classes: Option<Vec<String>>,
}

/// Sums the confusion parts of a round's results element-wise.
///
/// Matrix, support and labels are folded independently so a device that
/// reported only some of the triple still contributes what it had. A shape
/// that disagrees with the running sum skips that part with a warning
/// instead of poisoning the round. `None` means no device reported a matrix
/// this round, which callers treat as "no confusion data", not an error.
pub fn accumulate(parts: &[RoundMetrics]) -> Option<ConfusionSnapshot> {
    let mut matrix: Option<Vec<Vec<f64>>> = None;
    let mut support: Option<Vec<f64>> = None;
    let mut classes: Option<Vec<String>> = None;

    for part in parts {
        if let Some(m) = &part.confusion {
            match &mut matrix {
                None => matrix = Some(m.clone()),
                Some(acc) if same_shape(acc, m) => {
                    for (row_acc, row) in acc.iter_mut().zip(m) {
                        for (cell_acc, cell) in row_acc.iter_mut().zip(row) {
                            *cell_acc += cell;
                        }
                    }
                }
                Some(_) => {
                    warn!(round = part.round, "confusion shape mismatch, partial skipped");
                }
            }
        }
        if let Some(s) = &part.support {
            match &mut support {
                None => support = Some(s.clone()),
                Some(acc) if acc.len() == s.len() => {
                    for (a, b) in acc.iter_mut().zip(s) {
                        *a += b;
                    }
                }
                Some(_) => {
                    warn!(round = part.round, "support length mismatch, partial skipped");
                }
            }
        }
        if classes.is_none() {
            classes = part.classes.clone();
        }
    }

    matrix.map(|matrix| ConfusionSnapshot { matrix, support, classes })
}

fn same_shape(a: &[Vec<f64>], b: &[Vec<f64>]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(ra, rb)| ra.len() == rb.len())
}
