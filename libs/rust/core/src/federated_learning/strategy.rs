use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, info_span};

use crate::algorithm::{Algo, AveragedUpdate, LocalUpdate};
use crate::error::{PlatformError, Result};
use crate::federated_learning::coordinator::{AggregationMethod, ClientUpdate, FederatedLearningCoordinator, ModelVersion};
use crate::opener::Datasamples;
use crate::schemas::OrganizationId;

/// One organization's copy of the algorithm with its opened training samples.
pub struct LocalTrainer {
    pub organization_id: OrganizationId,
    pub algo: Box<dyn Algo>,
    pub samples: Datasamples,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalSummary {
    pub organization_id: OrganizationId,
    pub n_samples: u64,
    pub mean_loss: f32,
    /// The organization's own delta for this round.
    #[serde(skip)]
    pub parameters_update: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub averaged: AveragedUpdate,
    pub version: ModelVersion,
    pub local: Vec<LocalSummary>,
}

pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn aggregation_method(&self) -> AggregationMethod;
    /// Local training on every trainer, then one aggregation.
    fn perform_round(&self, coordinator: &FederatedLearningCoordinator, trainers: &mut [LocalTrainer], shared: Option<&AveragedUpdate>) -> Result<RoundOutcome>;
}

/// Federated averaging of parameter deltas.
#[derive(Debug, Clone, Copy)]
pub struct FedAvg { method: AggregationMethod }

impl Default for FedAvg {
    fn default() -> Self { Self { method: AggregationMethod::FedAvg } }
}

impl FedAvg {
    pub fn new() -> Self { Self::default() }
    pub fn uniform() -> Self { Self { method: AggregationMethod::Uniform } }
}

impl Strategy for FedAvg {
    fn name(&self) -> &'static str { "fed_avg" }

    fn aggregation_method(&self) -> AggregationMethod { self.method }

    fn perform_round(&self, coordinator: &FederatedLearningCoordinator, trainers: &mut [LocalTrainer], shared: Option<&AveragedUpdate>) -> Result<RoundOutcome> {
        let round = coordinator.current_round();
        let results: Vec<(OrganizationId, Result<LocalUpdate>)> = trainers
            .par_iter_mut()
            .map(|t| {
                let span = info_span!("local_train", organization = %t.organization_id, round);
                let _guard = span.enter();
                (t.organization_id.clone(), t.algo.train(&t.samples, shared))
            })
            .collect();

        if let Some((org, Err(e))) = results.iter().find(|(_, r)| r.is_err()) {
            let reason = format!("local training failed on `{org}`: {e}");
            coordinator.abort_round(&reason);
            return Err(PlatformError::RoundAborted { round, reason });
        }

        let mut local = Vec::with_capacity(results.len());
        let mut aggregated = None;
        for (org, res) in results {
            let update = res?;
            local.push(LocalSummary {
                organization_id: org.clone(),
                n_samples: update.n_samples,
                mean_loss: update.mean_loss,
                parameters_update: update.parameters_update.clone(),
            });
            let client_update = ClientUpdate { node_id: org, round, weights: update.parameters_update, sample_count: update.n_samples };
            match coordinator.submit_update(client_update) {
                Ok(Some(model)) => aggregated = Some(model),
                Ok(None) => {}
                Err(e) => {
                    coordinator.abort_round(&e.to_string());
                    return Err(PlatformError::RoundAborted { round, reason: e.to_string() });
                }
            }
        }
        let model = aggregated.ok_or_else(|| PlatformError::RoundAborted { round, reason: format!("only {} of the expected updates arrived", local.len()) })?;
        info!(round, version = model.version, participants = model.participants.len(), "round aggregated");
        Ok(RoundOutcome { averaged: AveragedUpdate { round, parameters_update: model.weights }, version: model.version, local })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::AlgoDescription;
    use crate::index_generator::IndexGeneratorConfig;
    use crate::nn::{ModelState, OptimizerConfig, TensorState};
    use ndarray::{Array2, Array3};

    /// Returns a fixed delta, or fails when asked to.
    struct FixedAlgo { delta: f32, fail: bool, weight: f32 }

    impl Algo for FixedAlgo {
        fn train(&mut self, samples: &Datasamples, shared: Option<&AveragedUpdate>) -> Result<LocalUpdate> {
            if let Some(s) = shared { self.apply_update(s)?; }
            if self.fail { return Err(PlatformError::invalid("samples", "corrupted")); }
            Ok(LocalUpdate { parameters_update: vec![self.delta], n_samples: samples.len() as u64, mean_loss: 0.0 })
        }
        fn apply_update(&mut self, shared: &AveragedUpdate) -> Result<()> { self.weight += shared.parameters_update[0]; Ok(()) }
        fn predict(&self, samples: &Datasamples) -> Result<Array2<f32>> { Ok(Array2::zeros((samples.len(), 10))) }
        fn model_state(&self) -> ModelState { ModelState { tensors: vec![TensorState { name: "w".into(), shape: vec![1], values: vec![self.weight] }] } }
        fn load_model_state(&mut self, state: &ModelState) -> Result<()> { self.weight = state.tensors[0].values[0]; Ok(()) }
        fn describe(&self) -> AlgoDescription {
            AlgoDescription { name: "fixed".into(), index_generator: IndexGeneratorConfig::default(), optimizer: OptimizerConfig::default(), seed: 0, num_parameters: 1 }
        }
        fn reseed(&mut self, _salt: u64) -> Result<()> { Ok(()) }
    }

    fn trainer(org: &str, n: usize, delta: f32, fail: bool) -> LocalTrainer {
        LocalTrainer {
            organization_id: org.into(),
            algo: Box::new(FixedAlgo { delta, fail, weight: 0.0 }),
            samples: Datasamples::new(Array3::zeros((n, 28, 28)), vec![0; n]).unwrap(),
        }
    }

    #[test]
    fn fedavg_weights_by_samples() {
        let coord = FederatedLearningCoordinator::new(2, AggregationMethod::FedAvg);
        let mut trainers = vec![trainer("a", 1, 1.0, false), trainer("b", 3, 5.0, false)];
        let out = FedAvg::new().perform_round(&coord, &mut trainers, None).unwrap();
        assert!((out.averaged.parameters_update[0] - 4.0).abs() < 1e-6);
        assert_eq!(out.averaged.round, 1);
        assert_eq!(out.local.len(), 2);
        assert_eq!(out.local[1].parameters_update, vec![5.0]);

        let next = FedAvg::new().perform_round(&coord, &mut trainers, Some(&out.averaged)).unwrap();
        assert_eq!(next.averaged.round, 2);
        assert_eq!(trainers[0].algo.model_state().tensors[0].values[0], 4.0);
    }

    #[test]
    fn failing_organization_aborts_round() {
        let coord = FederatedLearningCoordinator::new(2, AggregationMethod::FedAvg);
        let mut trainers = vec![trainer("a", 1, 1.0, false), trainer("b", 3, 5.0, true)];
        let err = FedAvg::new().perform_round(&coord, &mut trainers, None).unwrap_err();
        assert!(matches!(err, PlatformError::RoundAborted { round: 1, .. }));
        assert_eq!(coord.current_round(), 1);
        assert_eq!(coord.pending_updates(), 0);
    }

    #[test]
    fn uniform_strategy_ignores_sizes() {
        let coord = FederatedLearningCoordinator::new(2, FedAvg::uniform().aggregation_method());
        let mut trainers = vec![trainer("a", 1, 1.0, false), trainer("b", 3, 5.0, false)];
        let out = FedAvg::uniform().perform_round(&coord, &mut trainers, None).unwrap();
        assert!((out.averaged.parameters_update[0] - 3.0).abs() < 1e-6);
    }
}
