//! Submits and runs a federated compute plan on the local backend.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, info_span, warn};

use crate::algorithm::{Algo, AlgoDescription, AveragedUpdate};
use crate::client::Client;
use crate::dependency::Dependency;
use crate::error::{PlatformError, Result};
use crate::evaluation::EvaluationStrategy;
use crate::federated_learning::{AggregationMethod, FederatedLearningCoordinator, LocalTrainer, Strategy};
use crate::metric::MetricFunction;
use crate::nodes::{AggregationNode, TestDataNode, TrainDataNode};
use crate::opener::Datasamples;
use crate::schemas::{new_key, AssetKey, ComputePlan, ComputePlanStatus, OrganizationId, Performance, TaskKind, TaskRecord};

/// Everything a compute plan needs besides the algorithm and the strategy.
#[derive(Debug, Clone)]
pub struct Experiment {
    pub name: Option<String>,
    pub train_data_nodes: Vec<TrainDataNode>,
    pub evaluation_strategy: Option<EvaluationStrategy>,
    pub aggregation_node: AggregationNode,
    pub num_rounds: u64,
    pub experiment_folder: PathBuf,
    pub dependencies: Dependency,
}

/// Written next to the experiment before the first round starts.
#[derive(Debug, Serialize)]
pub struct ExperimentSummary<'a> {
    pub compute_plan_key: &'a str,
    pub name: Option<&'a str>,
    pub owner: &'a str,
    pub strategy: &'static str,
    pub aggregation_method: AggregationMethod,
    pub num_rounds: u64,
    pub algo: AlgoDescription,
    pub train_data_nodes: &'a [TrainDataNode],
    pub evaluation_strategy: Option<&'a EvaluationStrategy>,
    pub aggregation_node: &'a AggregationNode,
    pub dependencies: &'a Dependency,
    pub submitted_at: DateTime<Utc>,
}

struct TestSet {
    node: TestDataNode,
    samples: Datasamples,
    metrics: Vec<(AssetKey, MetricFunction)>,
}

impl Experiment {
    fn validate(&self, client: &Client) -> Result<()> {
        if self.num_rounds == 0 {
            return Err(PlatformError::invalid("experiment", "num_rounds must be at least 1"));
        }
        if self.train_data_nodes.is_empty() {
            return Err(PlatformError::invalid("experiment", "no train data node"));
        }
        let mut orgs: Vec<&str> = Vec::with_capacity(self.train_data_nodes.len());
        for node in &self.train_data_nodes {
            if orgs.contains(&node.organization_id.as_str()) {
                return Err(PlatformError::invalid("experiment", format!("`{}` holds more than one train data node", node.organization_id)));
            }
            orgs.push(&node.organization_id);
            node.validate(client)?;
        }
        self.aggregation_node.validate(client)?;
        if let Some(eval) = &self.evaluation_strategy {
            for node in &eval.test_data_nodes {
                node.validate(client)?;
            }
        }
        Ok(())
    }

    fn train_organizations(&self) -> Vec<OrganizationId> {
        self.train_data_nodes.iter().map(|n| n.organization_id.clone()).collect()
    }
}

/// Writes `<folder>/<timestamp>_<key>.json` and returns its path.
pub fn write_summary(folder: &Path, summary: &ExperimentSummary<'_>) -> Result<PathBuf> {
    fs::create_dir_all(folder)?;
    let stamp = summary.submitted_at.format("%Y_%m_%d_%H_%M_%S");
    let path = folder.join(format!("{stamp}_{}.json", summary.compute_plan_key));
    fs::write(&path, serde_json::to_vec_pretty(summary)?)?;
    Ok(path)
}

/// Registers a compute plan owned by `client` and runs it to completion.
///
/// Every train node gets its own copy of `algo`, seeded from its position,
/// and trains in parallel each round. Each organization's model after its
/// local training is stored per round for that organization to download.
/// The averaged update is applied to a global copy which the test nodes
/// score. A failing round marks the plan `Failed` and the error is returned.
pub fn execute_experiment<A>(client: &Client, algo: &A, strategy: &dyn Strategy, experiment: &Experiment) -> Result<ComputePlan>
where
    A: Algo + Clone + 'static,
{
    experiment.validate(client)?;
    let owner = client.organization_id().to_string();
    let plan = ComputePlan {
        key: new_key(),
        owner: owner.clone(),
        status: ComputePlanStatus::Doing,
        num_rounds: experiment.num_rounds,
        train_organizations: experiment.train_organizations(),
        aggregation_organization: experiment.aggregation_node.organization_id.clone(),
        tasks: Vec::new(),
        failure: None,
        created_at: Utc::now(),
        ended_at: None,
    };
    let summary = ExperimentSummary {
        compute_plan_key: &plan.key,
        name: experiment.name.as_deref(),
        owner: &owner,
        strategy: strategy.name(),
        aggregation_method: strategy.aggregation_method(),
        num_rounds: experiment.num_rounds,
        algo: algo.describe(),
        train_data_nodes: &experiment.train_data_nodes,
        evaluation_strategy: experiment.evaluation_strategy.as_ref(),
        aggregation_node: &experiment.aggregation_node,
        dependencies: &experiment.dependencies,
        submitted_at: plan.created_at,
    };
    let summary_path = write_summary(&experiment.experiment_folder, &summary)?;
    let key = plan.key.clone();
    client.insert_compute_plan(plan);
    info!(compute_plan = %key, summary = %summary_path.display(), rounds = experiment.num_rounds, "compute plan submitted");

    let started = Instant::now();
    match run_rounds(client, &key, algo, strategy, experiment) {
        Ok(()) => {
            client.finish_compute_plan(&key, None);
            info!(compute_plan = %key, elapsed_ms = started.elapsed().as_millis() as u64, "compute plan done");
        }
        Err(e) => {
            error!(compute_plan = %key, error = %e, "compute plan failed");
            client.finish_compute_plan(&key, Some(e.to_string()));
            return Err(e);
        }
    }
    client.get_compute_plan(&key)
}

fn run_rounds<A>(client: &Client, plan_key: &str, algo: &A, strategy: &dyn Strategy, experiment: &Experiment) -> Result<()>
where
    A: Algo + Clone + 'static,
{
    let owner = client.organization_id();
    let mut trainers = Vec::with_capacity(experiment.train_data_nodes.len());
    for (i, node) in experiment.train_data_nodes.iter().enumerate() {
        let samples = client.open_samples(owner, &node.organization_id, &node.data_manager_key, &node.data_sample_keys, false)?;
        let mut copy = algo.clone();
        copy.reseed(i as u64 + 1)?;
        info!(organization = %node.organization_id, samples = samples.len(), "train data opened");
        trainers.push(LocalTrainer { organization_id: node.organization_id.clone(), algo: Box::new(copy), samples });
    }
    let test_sets = open_test_sets(client, owner, experiment.evaluation_strategy.as_ref())?;

    let mut global = algo.clone();
    let coordinator = FederatedLearningCoordinator::new(trainers.len(), strategy.aggregation_method());
    let aggregator = &experiment.aggregation_node.organization_id;
    let mut shared: Option<AveragedUpdate> = None;

    for round in 1..=experiment.num_rounds {
        let span = info_span!("round", compute_plan = %plan_key, round);
        let _guard = span.enter();

        let outcome = match strategy.perform_round(&coordinator, &mut trainers, shared.as_ref()) {
            Ok(o) => o,
            Err(e) => {
                for t in &trainers {
                    client.record_task(plan_key, TaskRecord { kind: TaskKind::Train, worker: t.organization_id.clone(), round_idx: round, succeeded: false });
                }
                return Err(e);
            }
        };
        for local in &outcome.local {
            info!(organization = %local.organization_id, n_samples = local.n_samples, mean_loss = local.mean_loss, "local round finished");
            client.record_task(plan_key, TaskRecord { kind: TaskKind::Train, worker: local.organization_id.clone(), round_idx: round, succeeded: true });
            let trainer = trainers
                .iter()
                .find(|t| t.organization_id == local.organization_id)
                .ok_or_else(|| PlatformError::not_found("train data node", local.organization_id.as_str()))?;
            // trainers hold their pre-training weights between rounds
            let trained = trainer.algo.model_state().apply_delta(&local.parameters_update)?;
            client.store_model(plan_key, round, &local.organization_id, trained);
        }
        client.record_task(plan_key, TaskRecord { kind: TaskKind::Aggregate, worker: aggregator.clone(), round_idx: round, succeeded: true });

        global.apply_update(&outcome.averaged)?;

        if experiment.evaluation_strategy.as_ref().is_some_and(|e| e.should_evaluate(round)) {
            evaluate(client, plan_key, round, &global, &test_sets)?;
        }
        shared = Some(outcome.averaged);
    }
    Ok(())
}

fn open_test_sets(client: &Client, owner: &str, evaluation: Option<&EvaluationStrategy>) -> Result<Vec<TestSet>> {
    let Some(eval) = evaluation else { return Ok(Vec::new()) };
    let mut sets = Vec::with_capacity(eval.test_data_nodes.len());
    for node in &eval.test_data_nodes {
        let samples = client.open_samples(owner, &node.organization_id, &node.data_manager_key, &node.test_data_sample_keys, true)?;
        let metrics = node
            .metric_keys
            .iter()
            .map(|k| client.metric_function(k, &node.organization_id).map(|f| (k.clone(), f)))
            .collect::<Result<Vec<_>>>()?;
        sets.push(TestSet { node: node.clone(), samples, metrics });
    }
    if sets.is_empty() {
        warn!("evaluation strategy has no test data node");
    }
    Ok(sets)
}

fn evaluate<A: Algo>(client: &Client, plan_key: &str, round: u64, global: &A, test_sets: &[TestSet]) -> Result<()> {
    for set in test_sets {
        let worker = &set.node.organization_id;
        let predictions = global.predict(&set.samples)?;
        client.record_task(plan_key, TaskRecord { kind: TaskKind::Predict, worker: worker.clone(), round_idx: round, succeeded: true });
        for (metric_key, function) in &set.metrics {
            let performance = function(&set.samples, &predictions)?;
            info!(organization = %worker, metric = %metric_key, performance, "test finished");
            client.record_task(plan_key, TaskRecord { kind: TaskKind::Test, worker: worker.clone(), round_idx: round, succeeded: true });
            client.record_performance(plan_key, Performance { worker: worker.clone(), round_idx: round, metric_key: metric_key.clone(), performance });
        }
    }
    Ok(())
}
