//! Per-organization training logic run between aggregations.

use ndarray::{concatenate, s, Array2, Array4, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PlatformError, Result};
use crate::index_generator::{IndexGenerator, IndexGeneratorConfig};
use crate::mnist::IMAGE_SIDE;
use crate::nn::{Model, ModelState, OptimizerConfig};
use crate::opener::Datasamples;

const PREDICT_BATCH: usize = 256;

/// Turns opened samples into model inputs and class-index targets.
pub trait BatchTransform: Send + Sync {
    fn inputs(&self, samples: &Datasamples, idx: &[usize]) -> Result<Array4<f32>>;
    fn targets(&self, samples: &Datasamples, idx: &[usize]) -> Result<Vec<i64>>;
}

/// Grey levels scaled to [0, 1], one input channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct MnistTransform;

fn check_index(samples: &Datasamples, idx: &[usize]) -> Result<()> {
    match idx.iter().find(|&&i| i >= samples.len()) {
        Some(i) => Err(PlatformError::invalid("batch", format!("sample {i} out of {}", samples.len()))),
        None => Ok(()),
    }
}

impl BatchTransform for MnistTransform {
    fn inputs(&self, samples: &Datasamples, idx: &[usize]) -> Result<Array4<f32>> {
        let (_, h, w) = samples.images.dim();
        if (h, w) != (IMAGE_SIDE, IMAGE_SIDE) {
            return Err(PlatformError::invalid("images", format!("{h}x{w} images, expected {IMAGE_SIDE}x{IMAGE_SIDE}")));
        }
        check_index(samples, idx)?;
        let mut x = Array4::zeros((idx.len(), 1, IMAGE_SIDE, IMAGE_SIDE));
        for (row, &i) in idx.iter().enumerate() {
            x.slice_mut(s![row, 0, .., ..]).assign(&samples.images.slice(s![i, .., ..]).mapv(|p| p as f32 / 255.0));
        }
        Ok(x)
    }

    fn targets(&self, samples: &Datasamples, idx: &[usize]) -> Result<Vec<i64>> {
        check_index(samples, idx)?;
        Ok(idx.iter().map(|&i| samples.labels[i] as i64).collect())
    }
}

/// Flat parameter delta produced by one organization in one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalUpdate {
    pub parameters_update: Vec<f32>,
    pub n_samples: u64,
    pub mean_loss: f32,
}

/// Averaged delta every organization applies before training again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AveragedUpdate {
    pub round: u64,
    pub parameters_update: Vec<f32>,
}

pub trait Algo: Send {
    /// Applies `shared`, trains for one round and returns the parameter
    /// delta. The held model is then reset to its pre-training weights.
    fn train(&mut self, samples: &Datasamples, shared: Option<&AveragedUpdate>) -> Result<LocalUpdate>;
    /// Applies a shared update without training, used by evaluation-only holders.
    fn apply_update(&mut self, shared: &AveragedUpdate) -> Result<()>;
    fn predict(&self, samples: &Datasamples) -> Result<Array2<f32>>;
    fn model_state(&self) -> ModelState;
    fn load_model_state(&mut self, state: &ModelState) -> Result<()>;
    fn describe(&self) -> AlgoDescription;
    /// Derives the seeds of one organization's copy from `salt`.
    fn reseed(&mut self, salt: u64) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgoDescription {
    pub name: String,
    pub index_generator: IndexGeneratorConfig,
    pub optimizer: OptimizerConfig,
    pub seed: u64,
    pub num_parameters: usize,
}

/// Federated averaging on top of any [`Model`].
pub struct FedAvgAlgo<M: Model, T: BatchTransform = MnistTransform> {
    model: M,
    transform: T,
    optimizer: M::Optimizer,
    optimizer_config: OptimizerConfig,
    index_generator: IndexGenerator,
    rng: StdRng,
    seed: u64,
}

impl<M: Model + Clone, T: BatchTransform + Clone> Clone for FedAvgAlgo<M, T> {
    /// Fresh optimizer state and generator position; used to hand every
    /// organization its own copy before the first round.
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            transform: self.transform.clone(),
            optimizer: self.model.init_optimizer(&self.optimizer_config),
            optimizer_config: self.optimizer_config,
            index_generator: self.index_generator.clone(),
            rng: StdRng::seed_from_u64(self.seed),
            seed: self.seed,
        }
    }
}

impl<M: Model> FedAvgAlgo<M, MnistTransform> {
    pub fn new(model: M, optimizer: OptimizerConfig, index_generator: IndexGeneratorConfig, seed: u64) -> Result<Self> {
        Self::with_transform(model, MnistTransform, optimizer, index_generator, seed)
    }
}

impl<M: Model, T: BatchTransform> FedAvgAlgo<M, T> {
    pub fn with_transform(model: M, transform: T, optimizer: OptimizerConfig, index_generator: IndexGeneratorConfig, seed: u64) -> Result<Self> {
        Ok(Self {
            optimizer: model.init_optimizer(&optimizer),
            model,
            transform,
            optimizer_config: optimizer,
            index_generator: IndexGenerator::new(index_generator, seed)?,
            rng: StdRng::seed_from_u64(seed),
            seed,
        })
    }

    pub fn model(&self) -> &M { &self.model }
}

impl<M: Model, T: BatchTransform> Algo for FedAvgAlgo<M, T> {
    fn train(&mut self, samples: &Datasamples, shared: Option<&AveragedUpdate>) -> Result<LocalUpdate> {
        if let Some(update) = shared {
            self.apply_update(update)?;
        }
        self.index_generator.reset_counter(samples.len())?;
        let before = self.model.state();
        let batches = self.index_generator.round_batches()?;
        let mut total_loss = 0.0;
        for idx in &batches {
            let x = self.transform.inputs(samples, idx)?;
            let y = self.transform.targets(samples, idx)?;
            total_loss += self.model.train_step(&x, &y, &mut self.optimizer, &mut self.rng)?;
        }
        let mean_loss = total_loss / batches.len() as f32;
        debug!(updates = batches.len(), mean_loss, "local training finished");
        let parameters_update = self.model.state().delta(&before)?;
        // the round result travels as a delta; the held weights stay global
        self.model.load_state(&before)?;
        Ok(LocalUpdate { parameters_update, n_samples: samples.len() as u64, mean_loss })
    }

    fn apply_update(&mut self, shared: &AveragedUpdate) -> Result<()> {
        let next = self.model.state().apply_delta(&shared.parameters_update)?;
        self.model.load_state(&next)
    }

    fn predict(&self, samples: &Datasamples) -> Result<Array2<f32>> {
        if samples.is_empty() {
            return Err(PlatformError::invalid("predict", "no sample to predict on"));
        }
        let all: Vec<usize> = (0..samples.len()).collect();
        let mut parts = Vec::with_capacity(all.len().div_ceil(PREDICT_BATCH));
        for idx in all.chunks(PREDICT_BATCH) {
            parts.push(self.model.predict(&self.transform.inputs(samples, idx)?)?);
        }
        let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
        Ok(concatenate(Axis(0), &views)?)
    }

    fn model_state(&self) -> ModelState { self.model.state() }

    fn load_model_state(&mut self, state: &ModelState) -> Result<()> { self.model.load_state(state) }

    fn reseed(&mut self, salt: u64) -> Result<()> {
        let seed = self.seed.wrapping_add(salt);
        self.rng = StdRng::seed_from_u64(seed);
        self.index_generator = IndexGenerator::new(self.index_generator.config().clone(), seed)?;
        Ok(())
    }

    fn describe(&self) -> AlgoDescription {
        AlgoDescription {
            name: "fed_avg".into(),
            index_generator: self.index_generator.config().clone(),
            optimizer: self.optimizer_config,
            seed: self.seed,
            num_parameters: self.model.state().num_parameters(),
        }
    }
}
