//! Scoring functions evaluated on test organizations.

use std::sync::Arc;

use ndarray::{Array2, ArrayView1, Axis};

use crate::error::{PlatformError, Result};
use crate::opener::Datasamples;

/// Scores the predictions (one row of class scores per sample) against samples.
pub type MetricFunction = Arc<dyn Fn(&Datasamples, &Array2<f32>) -> Result<f64> + Send + Sync>;

pub fn argmax(row: ArrayView1<'_, f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best_i, best), (i, v)| if *v > best { (i, *v) } else { (best_i, best) })
        .0
}

/// Fraction of samples whose highest scoring class equals the label.
pub fn accuracy(samples: &Datasamples, predictions: &Array2<f32>) -> Result<f64> {
    let n = predictions.len_of(Axis(0));
    if n != samples.len() {
        return Err(PlatformError::DimensionMismatch { expected: samples.len(), actual: n });
    }
    if n == 0 {
        return Err(PlatformError::invalid("predictions", "cannot score an empty test set"));
    }
    let correct = predictions
        .axis_iter(Axis(0))
        .zip(&samples.labels)
        .filter(|(row, label)| argmax(*row) == **label as usize)
        .count();
    Ok(correct as f64 / n as f64)
}

pub fn accuracy_metric() -> MetricFunction { Arc::new(accuracy) }
