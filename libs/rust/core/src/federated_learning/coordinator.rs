use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PlatformError, Result};

pub type RoundId = u64;
pub type ModelVersion = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    /// Weighted by each organization's sample count.
    FedAvg,
    Uniform,
}

#[derive(Clone, Debug)]
pub struct ClientUpdate {
    pub node_id: String,
    pub round: RoundId,
    pub weights: Vec<f32>,
    pub sample_count: u64,
}

#[derive(Clone, Debug)]
pub struct AggregatedModel {
    pub version: ModelVersion,
    pub round: RoundId,
    pub weights: Vec<f32>,
    pub participants: Vec<String>,
    pub aggregated_at: Instant,
}

#[derive(Debug)]
struct RoundState { started_at: Instant, updates: Vec<ClientUpdate> }

impl RoundState {
    fn fresh() -> Self { Self { started_at: Instant::now(), updates: Vec::new() } }
}

struct FedMetrics {
    updates_total: Counter<u64>,
    rounds_completed: Counter<u64>,
    rounds_aborted: Counter<u64>,
    aggregation_latency_ms: Histogram<f64>,
}

static FED_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("federa_federation"));

impl FedMetrics {
    fn new() -> Self {
        Self {
            updates_total: FED_METER.u64_counter("fed_updates_total").with_description("Total federated learning updates received").build(),
            rounds_completed: FED_METER.u64_counter("fed_rounds_completed_total").with_description("Federated rounds completed").build(),
            rounds_aborted: FED_METER.u64_counter("fed_rounds_aborted_total").with_description("Federated rounds aborted before aggregation").build(),
            aggregation_latency_ms: FED_METER.f64_histogram("fed_aggregation_latency_ms").with_description("Aggregation latency ms").build(),
        }
    }
}

/// Collects one update per participant for the current round and averages
/// them once every expected participant has reported.
pub struct FederatedLearningCoordinator {
    method: AggregationMethod,
    participants: usize,
    inner: RwLock<Inner>,
    metrics: FedMetrics,
}

#[derive(Debug)]
struct Inner {
    current_round: RoundId,
    model_version: ModelVersion,
    dim: Option<usize>,
    round_state: RoundState,
}

impl FederatedLearningCoordinator {
    pub fn new(participants: usize, method: AggregationMethod) -> Self {
        Self {
            method,
            participants,
            inner: RwLock::new(Inner { current_round: 1, model_version: 1, dim: None, round_state: RoundState::fresh() }),
            metrics: FedMetrics::new(),
        }
    }

    pub fn method(&self) -> AggregationMethod { self.method }

    /// `Some` once the update completes the round.
    pub fn submit_update(&self, update: ClientUpdate) -> Result<Option<AggregatedModel>> {
        let mut inner = self.inner.write();
        if update.round != inner.current_round {
            return Err(PlatformError::invalid("update", format!("`{}` sent round {} while round {} is open", update.node_id, update.round, inner.current_round)));
        }
        if inner.round_state.updates.iter().any(|u| u.node_id == update.node_id) {
            return Err(PlatformError::AlreadyExists { kind: "update", detail: format!("`{}` in round {}", update.node_id, update.round) });
        }
        if let Some(dim) = inner.dim {
            if update.weights.len() != dim {
                return Err(PlatformError::DimensionMismatch { expected: dim, actual: update.weights.len() });
            }
        }
        inner.dim = Some(update.weights.len());
        self.metrics.updates_total.add(1, &[KeyValue::new("node", update.node_id.clone())]);
        debug!(node = %update.node_id, round = update.round, samples = update.sample_count, "update received");
        inner.round_state.updates.push(update);
        if inner.round_state.updates.len() < self.participants {
            return Ok(None);
        }

        let latency_start = Instant::now();
        let aggregated = self.aggregate_locked(&inner.round_state.updates)?;
        self.metrics.aggregation_latency_ms.record(latency_start.elapsed().as_secs_f64() * 1000.0, &[]);
        inner.model_version += 1;
        self.metrics.rounds_completed.add(1, &[]);
        let result = AggregatedModel {
            version: inner.model_version,
            round: inner.current_round,
            weights: aggregated,
            participants: inner.round_state.updates.iter().map(|u| u.node_id.clone()).collect(),
            aggregated_at: Instant::now(),
        };
        debug!(round = result.round, elapsed_ms = inner.round_state.started_at.elapsed().as_millis() as u64, "round aggregated");
        inner.current_round += 1;
        inner.round_state = RoundState::fresh();
        Ok(Some(result))
    }

    /// Drops the updates buffered for the open round; the round stays open.
    pub fn abort_round(&self, reason: &str) -> usize {
        let mut inner = self.inner.write();
        let dropped = inner.round_state.updates.len();
        warn!(round = inner.current_round, dropped, reason, "round aborted");
        self.metrics.rounds_aborted.add(1, &[]);
        inner.round_state = RoundState::fresh();
        dropped
    }

    fn aggregate_locked(&self, updates: &[ClientUpdate]) -> Result<Vec<f32>> {
        let dim = updates.first().map(|u| u.weights.len()).unwrap_or(0);
        let weight_of = |u: &ClientUpdate| match self.method {
            AggregationMethod::FedAvg => u.sample_count as f64,
            AggregationMethod::Uniform => 1.0,
        };
        let total: f64 = updates.iter().map(weight_of).sum();
        if total <= 0.0 {
            return Err(PlatformError::invalid("aggregation", "total sample count is zero"));
        }
        let mut acc = vec![0f64; dim];
        for u in updates {
            let w = weight_of(u) / total;
            for (a, v) in acc.iter_mut().zip(&u.weights) { *a += *v as f64 * w; }
        }
        Ok(acc.into_iter().map(|v| v as f32).collect())
    }

    pub fn current_round(&self) -> RoundId { self.inner.read().current_round }
    pub fn model_version(&self) -> ModelVersion { self.inner.read().model_version }
    pub fn pending_updates(&self) -> usize { self.inner.read().round_state.updates.len() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upd(node: &str, round: RoundId, weights: Vec<f32>, sample_count: u64) -> ClientUpdate {
        ClientUpdate { node_id: node.into(), round, weights, sample_count }
    }

    #[test]
    fn round_advances() {
        let fed = FederatedLearningCoordinator::new(2, AggregationMethod::FedAvg);
        let r = fed.current_round();
        assert!(fed.submit_update(upd("n1", r, vec![1.0, 2.0], 10)).unwrap().is_none());
        let agg = fed.submit_update(upd("n2", r, vec![3.0, 4.0], 10)).unwrap();
        assert!(agg.is_some());
        assert_eq!(fed.model_version(), 2);
        assert_eq!(fed.current_round(), r + 1);
    }

    #[test]
    fn weighted_by_sample_count() {
        let fed = FederatedLearningCoordinator::new(2, AggregationMethod::FedAvg);
        fed.submit_update(upd("n1", 1, vec![0.1, 0.2, 0.3], 10)).unwrap();
        let model = fed.submit_update(upd("n2", 1, vec![0.2, 0.4, 0.6], 30)).unwrap().expect("should aggregate");
        // (0.1*10 + 0.2*30)/40 = 0.175
        assert!((model.weights[0] - 0.175).abs() < 1e-6);
        assert_eq!(model.participants, vec!["n1".to_string(), "n2".to_string()]);
    }

    #[test]
    fn uniform_ignores_sample_count() {
        let fed = FederatedLearningCoordinator::new(2, AggregationMethod::Uniform);
        fed.submit_update(upd("n1", 1, vec![1.0], 1)).unwrap();
        let model = fed.submit_update(upd("n2", 1, vec![3.0], 99)).unwrap().unwrap();
        assert!((model.weights[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn rejects_stale_duplicate_and_mismatched_updates() {
        let fed = FederatedLearningCoordinator::new(3, AggregationMethod::FedAvg);
        assert!(fed.submit_update(upd("n1", 2, vec![1.0], 1)).is_err());
        fed.submit_update(upd("n1", 1, vec![1.0, 1.0], 1)).unwrap();
        assert!(matches!(fed.submit_update(upd("n1", 1, vec![1.0, 1.0], 1)), Err(PlatformError::AlreadyExists { .. })));
        assert!(matches!(fed.submit_update(upd("n2", 1, vec![1.0], 1)), Err(PlatformError::DimensionMismatch { .. })));
    }

    #[test]
    fn zero_samples_cannot_be_averaged() {
        let fed = FederatedLearningCoordinator::new(1, AggregationMethod::FedAvg);
        assert!(fed.submit_update(upd("n1", 1, vec![1.0], 0)).is_err());
    }

    #[test]
    fn abort_keeps_round_open() {
        let fed = FederatedLearningCoordinator::new(2, AggregationMethod::FedAvg);
        fed.submit_update(upd("n1", 1, vec![1.0], 1)).unwrap();
        assert_eq!(fed.abort_round("n2 failed"), 1);
        assert_eq!(fed.pending_updates(), 0);
        assert_eq!(fed.current_round(), 1);
        assert_eq!(fed.model_version(), 1);
    }
}
