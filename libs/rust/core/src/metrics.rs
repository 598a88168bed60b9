//! Per-device round metrics and normalization of what devices actually send.
//!
//! Training clients report metrics as a JSON object, a JSON string wrapping
//! one, or a one-element list, depending on client version. Normalization
//! flattens all of that into one record and folds the accuracy fallback
//! chain (`accuracy` -> `val_accuracy` -> `acc`) so downstream averaging
//! stays simple. Anything unreadable collapses to an empty record rather
//! than an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundMetrics {
    pub round: u32,
    #[serde(default)]
    pub loss: Option<f64>,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub val_loss: Option<f64>,
    #[serde(default)]
    pub val_accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confusion: Option<Vec<Vec<f64>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classes: Option<Vec<String>>,
}

impl RoundMetrics {
    pub fn empty(round: u32) -> Self {
        Self { round, ..Self::default() }
    }

    /// Accuracy after the reporting fallbacks were folded in.
    pub fn accuracy_like(&self) -> Option<f64> {
        self.accuracy.or(self.val_accuracy)
    }

    pub fn loss_like(&self) -> Option<f64> {
        self.loss.or(self.val_loss)
    }
}

/// Normalizes a raw `metrics` value as reported with a submission.
pub fn normalize(raw: Option<&Value>, round: u32) -> RoundMetrics {
    match raw {
        Some(v) => normalize_value(v, round),
        None => RoundMetrics::empty(round),
    }
}

fn normalize_value(v: &Value, round: u32) -> RoundMetrics {
    match v {
        Value::Object(map) => {
            let mut out = RoundMetrics::empty(round);
            out.loss = num(map.get("loss")).or_else(|| num(map.get("val_loss")));
            out.accuracy = num(map.get("accuracy"))
                .or_else(|| num(map.get("val_accuracy")))
                .or_else(|| num(map.get("acc")));
            out.val_loss = num(map.get("val_loss"));
            out.val_accuracy = num(map.get("val_accuracy"));
            out.confusion = matrix(map.get("confusion"));
            out.support = vector(map.get("support"));
            out.classes = labels(map.get("classes"));
            out
        }
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(parsed) => normalize_value(&parsed, round),
            Err(_) => RoundMetrics::empty(round),
        },
        Value::Array(items) => items
            .iter()
            .find(|i| i.is_object())
            .map(|i| normalize_value(i, round))
            .unwrap_or_else(|| RoundMetrics::empty(round)),
        _ => RoundMetrics::empty(round),
    }
}

fn num(v: Option<&Value>) -> Option<f64> {
    v.and_then(Value::as_f64)
}

fn matrix(v: Option<&Value>) -> Option<Vec<Vec<f64>>> {
    let rows = v?.as_array()?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let cells = row.as_array()?;
        out.push(cells.iter().map(Value::as_f64).collect::<Option<Vec<_>>>()?);
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

fn vector(v: Option<&Value>) -> Option<Vec<f64>> {
    let cells = v?.as_array()?;
    let out = cells.iter().map(Value::as_f64).collect::<Option<Vec<_>>>()?;
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

fn labels(v: Option<&Value>) -> Option<Vec<String>> {
    let cells = v?.as_array()?;
    if cells.is_empty() {
        return None;
    }
    Some(
        cells
            .iter()
            .map(|c| match c {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
    )
}
