//! Decides which samples feed each local update.
//!
//! A round always consumes exactly `num_updates` batches. The position in
//! the current epoch survives across rounds, so consecutive rounds keep
//! walking through the dataset instead of restarting at the first batch.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{PlatformError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexGeneratorConfig {
    pub batch_size: usize,
    pub num_updates: usize,
    pub shuffle: bool,
    pub drop_last: bool,
}

impl Default for IndexGeneratorConfig {
    fn default() -> Self { Self { batch_size: 32, num_updates: 100, shuffle: true, drop_last: false } }
}

#[derive(Debug, Clone)]
pub struct IndexGenerator {
    config: IndexGeneratorConfig,
    rng: StdRng,
    n_samples: usize,
    order: Vec<usize>,
    cursor: usize,
    epochs: usize,
}

impl IndexGenerator {
    pub fn new(config: IndexGeneratorConfig, seed: u64) -> Result<Self> {
        if config.batch_size == 0 { return Err(PlatformError::invalid("index generator", "batch_size must be positive")); }
        if config.num_updates == 0 { return Err(PlatformError::invalid("index generator", "num_updates must be positive")); }
        Ok(Self { config, rng: StdRng::seed_from_u64(seed), n_samples: 0, order: Vec::new(), cursor: 0, epochs: 0 })
    }

    pub fn config(&self) -> &IndexGeneratorConfig { &self.config }
    pub fn epochs_completed(&self) -> usize { self.epochs }

    /// Binds the generator to a dataset size. A new size restarts the epoch.
    pub fn reset_counter(&mut self, n_samples: usize) -> Result<()> {
        if n_samples == 0 { return Err(PlatformError::invalid("index generator", "no sample to draw from")); }
        if self.config.drop_last && n_samples < self.config.batch_size {
            return Err(PlatformError::invalid(
                "index generator",
                format!("drop_last with {n_samples} samples and batch size {} yields no batch", self.config.batch_size),
            ));
        }
        if n_samples != self.n_samples {
            self.n_samples = n_samples;
            self.new_epoch();
        }
        Ok(())
    }

    fn new_epoch(&mut self) {
        self.order = (0..self.n_samples).collect();
        if self.config.shuffle { self.order.shuffle(&mut self.rng); }
        self.cursor = 0;
    }

    fn next_batch(&mut self) -> Vec<usize> {
        let remaining = self.n_samples - self.cursor;
        let short = remaining < self.config.batch_size;
        if remaining == 0 || (short && self.config.drop_last) {
            self.epochs += 1;
            self.new_epoch();
        }
        let end = (self.cursor + self.config.batch_size).min(self.n_samples);
        let batch = self.order[self.cursor..end].to_vec();
        self.cursor = end;
        batch
    }

    /// Batches for one round of local training.
    pub fn round_batches(&mut self) -> Result<Vec<Vec<usize>>> {
        if self.n_samples == 0 { return Err(PlatformError::invalid("index generator", "reset_counter was never called")); }
        Ok((0..self.config.num_updates).map(|_| self.next_batch()).collect())
    }
}
