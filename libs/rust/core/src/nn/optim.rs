use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer, SgdConfig};
use serde::{Deserialize, Serialize};

use crate::nn::TrainBackend;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Adam { lr: f32 },
    Sgd { lr: f32 },
}

impl Default for OptimizerConfig {
    fn default() -> Self { Self::Adam { lr: 0.001 } }
}

impl OptimizerConfig {
    pub fn learning_rate(&self) -> f32 {
        match *self {
            Self::Adam { lr } | Self::Sgd { lr } => lr,
        }
    }

    pub fn init<M: AutodiffModule<TrainBackend> + 'static>(&self) -> ModelOptimizer<M> {
        let inner: Box<dyn Step<M>> = match self {
            Self::Adam { .. } => Box::new(AdamConfig::new().with_epsilon(1e-8).init::<TrainBackend, M>()),
            Self::Sgd { .. } => Box::new(SgdConfig::new().init::<TrainBackend, M>()),
        };
        ModelOptimizer { inner, lr: self.learning_rate() as f64, steps: 0 }
    }
}

trait Step<M>: Send {
    fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> M;
}

impl<M, O> Step<M> for O
where
    M: AutodiffModule<TrainBackend>,
    O: Optimizer<M, TrainBackend>,
{
    fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> M { Optimizer::step(self, lr, module, grads) }
}

/// A `burn` optimizer bound to one module type, with its learning rate.
/// Moment estimates are keyed by parameter id and survive weight reloads.
pub struct ModelOptimizer<M> {
    inner: Box<dyn Step<M>>,
    lr: f64,
    steps: u64,
}

impl<M> ModelOptimizer<M> {
    pub fn step(&mut self, module: M, grads: GradientsParams) -> M {
        self.steps += 1;
        self.inner.step(self.lr, module, grads)
    }

    pub fn steps(&self) -> u64 { self.steps }
    pub fn learning_rate(&self) -> f64 { self.lr }
}

impl<M> std::fmt::Debug for ModelOptimizer<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelOptimizer").field("lr", &self.lr).field("steps", &self.steps).finish()
    }
}
