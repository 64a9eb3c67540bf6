//! Models trained with `burn` on the CPU `NdArray` backend, plus the
//! serialisable parameter snapshot exchanged between organizations.

pub mod cnn;
pub mod optim;

use burn::backend::{Autodiff, NdArray};
use ndarray::{Array2, Array4};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::{PlatformError, Result};

pub use cnn::{Cnn, CnnConfig, Net};
pub use optim::{ModelOptimizer, OptimizerConfig};

/// Inference backend.
pub type CpuBackend = NdArray<f32>;
/// Training backend, `CpuBackend` with reverse-mode autodiff.
pub type TrainBackend = Autodiff<CpuBackend>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorState {
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

/// Ordered named tensors describing every trainable parameter of a model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub tensors: Vec<TensorState>,
}

impl ModelState {
    pub fn num_parameters(&self) -> usize { self.tensors.iter().map(|t| t.values.len()).sum() }

    pub fn flatten(&self) -> Vec<f32> {
        let mut flat = Vec::with_capacity(self.num_parameters());
        for t in &self.tensors { flat.extend_from_slice(&t.values); }
        flat
    }

    /// Same layout as `self`, values taken from `flat`.
    pub fn with_values(&self, flat: &[f32]) -> Result<ModelState> {
        if flat.len() != self.num_parameters() {
            return Err(PlatformError::DimensionMismatch { expected: self.num_parameters(), actual: flat.len() });
        }
        let mut offset = 0;
        let tensors = self
            .tensors
            .iter()
            .map(|t| {
                let values = flat[offset..offset + t.values.len()].to_vec();
                offset += t.values.len();
                TensorState { name: t.name.clone(), shape: t.shape.clone(), values }
            })
            .collect();
        Ok(ModelState { tensors })
    }

    /// Flat `self - older`.
    pub fn delta(&self, older: &ModelState) -> Result<Vec<f32>> {
        let (new, old) = (self.flatten(), older.flatten());
        if new.len() != old.len() {
            return Err(PlatformError::DimensionMismatch { expected: old.len(), actual: new.len() });
        }
        Ok(new.iter().zip(&old).map(|(n, o)| n - o).collect())
    }

    pub fn apply_delta(&self, delta: &[f32]) -> Result<ModelState> {
        let flat = self.flatten();
        if flat.len() != delta.len() {
            return Err(PlatformError::DimensionMismatch { expected: flat.len(), actual: delta.len() });
        }
        let summed: Vec<f32> = flat.iter().zip(delta).map(|(w, d)| w + d).collect();
        self.with_values(&summed)
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorState> { self.tensors.iter().find(|t| t.name == name) }
}

/// A trainable classifier over image batches shaped (N, C, H, W).
pub trait Model: Send {
    type Optimizer: Send;

    /// Fresh optimizer state for this model's parameters.
    fn init_optimizer(&self, config: &OptimizerConfig) -> Self::Optimizer;
    fn state(&self) -> ModelState;
    fn load_state(&mut self, state: &ModelState) -> Result<()>;
    /// One optimisation step on class-index targets; returns the mean batch loss.
    fn train_step(&mut self, inputs: &Array4<f32>, targets: &[i64], optimizer: &mut Self::Optimizer, rng: &mut StdRng) -> Result<f32>;
    /// Log-probabilities per class, dropout disabled.
    fn predict(&self, inputs: &Array4<f32>) -> Result<Array2<f32>>;
}
