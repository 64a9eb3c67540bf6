//! Three-convolution MNIST classifier.

use burn::backend::ndarray::NdArrayDevice;
use burn::module::{AutodiffModule, Module, ModuleMapper, ModuleVisitor, ParamId};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::loss::CrossEntropyLossConfig;
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::optim::GradientsParams;
use burn::tensor::activation::{log_softmax, relu};
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Int, Tensor, TensorData};
use ndarray::{Array2, Array4, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{PlatformError, Result};
use crate::nn::{CpuBackend, Model, ModelOptimizer, ModelState, OptimizerConfig, TensorState, TrainBackend};

const KERNEL: usize = 5;
const INPUT_SIDE: usize = 28;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CnnConfig {
    pub channels: [usize; 3],
    pub hidden: usize,
    pub classes: usize,
    pub dropout: f32,
}

impl Default for CnnConfig {
    fn default() -> Self { Self { channels: [32, 32, 64], hidden: 256, classes: 10, dropout: 0.5 } }
}

/// 28 -> conv 24 -> conv 20 -> pool 10 -> conv 6 -> pool 3
fn flat_side() -> usize { ((INPUT_SIDE + 1 - KERNEL + 1 - KERNEL) / 2 + 1 - KERNEL) / 2 }

#[derive(Module, Debug)]
pub struct Net<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    pool: MaxPool2d,
    dropout: Dropout,
    fc1: Linear<B>,
    fc2: Linear<B>,
}

impl<B: Backend> Net<B> {
    pub fn new(config: &CnnConfig, device: &B::Device) -> Self {
        let [c1, c2, c3] = config.channels;
        let side = flat_side();
        Self {
            conv1: Conv2dConfig::new([1, c1], [KERNEL, KERNEL]).init(device),
            conv2: Conv2dConfig::new([c1, c2], [KERNEL, KERNEL]).init(device),
            conv3: Conv2dConfig::new([c2, c3], [KERNEL, KERNEL]).init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            dropout: DropoutConfig::new(config.dropout as f64).init(),
            fc1: LinearConfig::new(side * side * c3, config.hidden).init(device),
            fc2: LinearConfig::new(config.hidden, config.classes).init(device),
        }
    }

    /// Class logits for a (N, 1, 28, 28) batch.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = relu(self.conv1.forward(x));
        let x = self.dropout.forward(relu(self.pool.forward(self.conv2.forward(x))));
        let x = self.dropout.forward(relu(self.pool.forward(self.conv3.forward(x))));
        let x = relu(self.fc1.forward(x.flatten::<2>(1, 3)));
        self.fc2.forward(self.dropout.forward(x))
    }
}

/// Parameter names in visiting order, with the fan-in used for initialisation.
fn parameter_layout(config: &CnnConfig) -> Vec<(String, usize)> {
    let [c1, c2, c3] = config.channels;
    let k2 = KERNEL * KERNEL;
    let side = flat_side();
    [("conv1", k2), ("conv2", c1 * k2), ("conv3", c2 * k2), ("fc1", side * side * c3), ("fc2", config.hidden)]
        .into_iter()
        .flat_map(|(layer, fan_in)| [(format!("{layer}.weight"), fan_in), (format!("{layer}.bias"), fan_in)])
        .collect()
}

#[derive(Default)]
struct Collect {
    tensors: Vec<(Vec<usize>, Vec<f32>)>,
}

impl<B: Backend> ModuleVisitor<B> for Collect {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        let values = tensor.to_data().iter::<f32>().collect();
        self.tensors.push((tensor.dims().to_vec(), values));
    }
}

/// Replaces float parameters in visiting order, keeping their ids.
struct Assign<'a> {
    next: std::slice::Iter<'a, TensorState>,
}

impl<B: Backend> ModuleMapper<B> for Assign<'_> {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let Some(src) = self.next.next() else { return tensor };
        let loaded = Tensor::from_data(TensorData::new(src.values.clone(), src.shape.clone()), &tensor.device());
        if tensor.is_require_grad() { loaded.require_grad() } else { loaded }
    }
}

fn collect_params<B: Backend>(net: &Net<B>) -> Vec<(Vec<usize>, Vec<f32>)> {
    let mut collect = Collect::default();
    net.visit(&mut collect);
    collect.tensors
}

#[derive(Debug, Clone)]
pub struct Cnn {
    config: CnnConfig,
    net: Net<TrainBackend>,
    device: NdArrayDevice,
}

impl Cnn {
    /// Weights are drawn uniformly in ±1/sqrt(fan_in) from `seed`.
    pub fn new(config: CnnConfig, seed: u64) -> Self {
        let device = NdArrayDevice::default();
        let net = Net::new(&config, &device);
        let mut rng = StdRng::seed_from_u64(seed);
        let tensors: Vec<TensorState> = parameter_layout(&config)
            .into_iter()
            .zip(collect_params(&net))
            .map(|((name, fan_in), (shape, values))| {
                let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
                let values = (0..values.len()).map(|_| rng.gen_range(-bound..bound)).collect();
                TensorState { name, shape, values }
            })
            .collect();
        let net = net.map(&mut Assign { next: tensors.iter() });
        Self { config, net, device }
    }

    pub fn config(&self) -> &CnnConfig { &self.config }

    fn check_inputs(&self, inputs: &Array4<f32>) -> Result<()> {
        let (_, c, h, w) = inputs.dim();
        if (c, h, w) != (1, INPUT_SIDE, INPUT_SIDE) {
            return Err(PlatformError::invalid("cnn input", format!("expected (N, 1, {INPUT_SIDE}, {INPUT_SIDE}), got {:?}", inputs.dim())));
        }
        Ok(())
    }

    fn input_tensor<B: Backend>(inputs: &Array4<f32>, device: &B::Device) -> Tensor<B, 4> {
        let (b, c, h, w) = inputs.dim();
        Tensor::from_data(TensorData::new(inputs.iter().copied().collect::<Vec<f32>>(), [b, c, h, w]), device)
    }
}

impl Model for Cnn {
    type Optimizer = ModelOptimizer<Net<TrainBackend>>;

    fn init_optimizer(&self, config: &OptimizerConfig) -> Self::Optimizer { config.init() }

    fn state(&self) -> ModelState {
        let tensors = parameter_layout(&self.config)
            .into_iter()
            .zip(collect_params(&self.net))
            .map(|((name, _), (shape, values))| TensorState { name, shape, values })
            .collect();
        ModelState { tensors }
    }

    fn load_state(&mut self, state: &ModelState) -> Result<()> {
        let current = self.state();
        if state.tensors.len() != current.tensors.len() {
            return Err(PlatformError::invalid("model state", format!("{} tensors, expected {}", state.tensors.len(), current.tensors.len())));
        }
        for (incoming, expected) in state.tensors.iter().zip(&current.tensors) {
            if incoming.name != expected.name {
                return Err(PlatformError::invalid("model state", format!("tensor `{}` where `{}` was expected", incoming.name, expected.name)));
            }
            if incoming.shape != expected.shape || incoming.values.len() != expected.values.len() {
                return Err(PlatformError::invalid(
                    "model state",
                    format!("tensor `{}` has shape {:?}, expected {:?}", incoming.name, incoming.shape, expected.shape),
                ));
            }
        }
        self.net = self.net.clone().map(&mut Assign { next: state.tensors.iter() });
        Ok(())
    }

    fn train_step(&mut self, inputs: &Array4<f32>, targets: &[i64], optimizer: &mut Self::Optimizer, rng: &mut StdRng) -> Result<f32> {
        self.check_inputs(inputs)?;
        let batch = inputs.len_of(Axis(0));
        if targets.len() != batch {
            return Err(PlatformError::DimensionMismatch { expected: batch, actual: targets.len() });
        }
        if let Some(bad) = targets.iter().find(|t| !(0..self.config.classes as i64).contains(*t)) {
            return Err(PlatformError::invalid("targets", format!("class {bad} outside 0..{}", self.config.classes)));
        }
        // dropout masks come from the backend generator
        TrainBackend::seed(rng.gen());
        let x = Self::input_tensor::<TrainBackend>(inputs, &self.device);
        let y = Tensor::<TrainBackend, 1, Int>::from_data(TensorData::new(targets.to_vec(), [batch]), &self.device);
        let logits = self.net.forward(x);
        let loss = CrossEntropyLossConfig::new().init(&self.device).forward(logits, y);
        let value: f32 = loss.clone().into_scalar().elem();
        let grads = GradientsParams::from_grads(loss.backward(), &self.net);
        self.net = optimizer.step(self.net.clone(), grads);
        Ok(value)
    }

    fn predict(&self, inputs: &Array4<f32>) -> Result<Array2<f32>> {
        self.check_inputs(inputs)?;
        if inputs.len_of(Axis(0)) == 0 {
            return Ok(Array2::zeros((0, self.config.classes)));
        }
        let net: Net<CpuBackend> = self.net.valid();
        let out = log_softmax(net.forward(Self::input_tensor::<CpuBackend>(inputs, &self.device)), 1);
        let [n, k] = out.dims();
        Ok(Array2::from_shape_vec((n, k), out.into_data().iter::<f32>().collect())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> CnnConfig { CnnConfig { channels: [2, 2, 3], hidden: 8, classes: 10, dropout: 0.0 } }

    fn batch(n: usize) -> (Array4<f32>, Vec<i64>) {
        let x = Array4::from_shape_fn((n, 1, 28, 28), |(b, _, y, x)| if (x + y + b) % 5 == 0 { 1.0 } else { 0.0 });
        (x, (0..n).map(|b| (b % 10) as i64).collect())
    }

    #[test]
    fn flattened_side_is_three() {
        assert_eq!(flat_side(), 3);
        assert_eq!(Cnn::new(tiny(), 0).state().tensor("fc1.weight").unwrap().shape, vec![27, 8]);
    }

    #[test]
    fn same_seed_same_weights() {
        assert_eq!(Cnn::new(tiny(), 5).state(), Cnn::new(tiny(), 5).state());
        assert_ne!(Cnn::new(tiny(), 5).state(), Cnn::new(tiny(), 6).state());
    }

    #[test]
    fn predictions_are_log_probabilities() {
        let cnn = Cnn::new(tiny(), 1);
        let (x, _) = batch(3);
        let out = cnn.predict(&x).unwrap();
        assert_eq!(out.dim(), (3, 10));
        for row in out.axis_iter(Axis(0)) {
            assert!((row.iter().map(|v| v.exp()).sum::<f32>() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn training_reduces_loss_on_fixed_batch() {
        let mut cnn = Cnn::new(tiny(), 2);
        let (x, t) = batch(4);
        let mut opt = cnn.init_optimizer(&OptimizerConfig::Sgd { lr: 0.1 });
        let mut rng = StdRng::seed_from_u64(0);
        let first = cnn.train_step(&x, &t, &mut opt, &mut rng).unwrap();
        let mut last = first;
        for _ in 0..30 {
            last = cnn.train_step(&x, &t, &mut opt, &mut rng).unwrap();
        }
        assert!(last < first, "loss {last} should drop below {first}");
        assert_eq!(opt.steps(), 31);
    }

    #[test]
    fn training_rejects_bad_batches() {
        let mut cnn = Cnn::new(tiny(), 2);
        let mut opt = cnn.init_optimizer(&OptimizerConfig::default());
        let mut rng = StdRng::seed_from_u64(0);
        let (x, t) = batch(2);
        assert!(cnn.train_step(&x, &[0], &mut opt, &mut rng).is_err());
        assert!(cnn.train_step(&x, &[0, 12], &mut opt, &mut rng).is_err());
        assert!(cnn.train_step(&Array4::zeros((2, 1, 14, 14)), &t, &mut opt, &mut rng).is_err());
        assert_eq!(opt.steps(), 0);
    }

    #[test]
    fn state_round_trips_through_load() {
        let a = Cnn::new(tiny(), 3);
        let mut b = Cnn::new(tiny(), 4);
        assert_ne!(a.state(), b.state());
        b.load_state(&a.state()).unwrap();
        assert_eq!(a.state(), b.state());
        assert_eq!(a.state().tensor("conv2.weight").unwrap().shape, vec![2, 2, 5, 5]);
        let (x, _) = batch(2);
        assert_eq!(a.predict(&x).unwrap(), b.predict(&x).unwrap());
    }

    #[test]
    fn adam_keeps_training_after_reload() {
        let mut cnn = Cnn::new(tiny(), 3);
        let snapshot = cnn.state();
        let mut opt = cnn.init_optimizer(&OptimizerConfig::Adam { lr: 0.01 });
        let mut rng = StdRng::seed_from_u64(1);
        let (x, t) = batch(4);
        cnn.train_step(&x, &t, &mut opt, &mut rng).unwrap();
        cnn.load_state(&snapshot).unwrap();
        cnn.train_step(&x, &t, &mut opt, &mut rng).unwrap();
        assert_eq!(opt.steps(), 2);
        assert_ne!(cnn.state(), snapshot);
    }

    #[test]
    fn load_state_rejects_other_architecture() {
        let small = Cnn::new(tiny(), 3);
        let mut wide = Cnn::new(CnnConfig { hidden: 16, ..tiny() }, 3);
        assert!(wide.load_state(&small.state()).is_err());
    }
}
