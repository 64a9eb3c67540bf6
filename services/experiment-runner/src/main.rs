mod plot;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use federa_core::client::MetricSpec;
use federa_core::metric::{accuracy, accuracy_metric};
use federa_core::mnist::{org_folder, raw_mnist_available, setup_mnist, setup_synthetic_mnist};
use federa_core::nn::{Cnn, Model};
use federa_core::schemas::{DataSampleSpec, DatasetSpec};
use federa_core::{
    download_algo_files, execute_experiment, init_tracing, load_algo, load_config, AggregationNode, Algo, Client, DataOpener, Dependency,
    EvaluationStrategy, Experiment, ExperimentConfig, FedAvg, FedAvgAlgo, MnistOpener, Network, Performance, Permissions, TestDataNode,
    TrainDataNode,
};

const PLOT_FILE: &str = "performance.svg";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("experiment-runner")?;
    let cfg = load_config().context("loading experiment config")?;
    info!(?cfg, "config_loaded");

    let plot_path = cfg.experiment_folder.join(PLOT_FILE);
    let performances = tokio::task::spawn_blocking(move || run(cfg)).await??;
    print_performances(&performances);
    match plot::plot_performances(&performances, &plot_path) {
        Ok(true) => info!(path = %plot_path.display(), "performance plot written"),
        Ok(false) => warn!("no performance to plot"),
        Err(e) => warn!(error = %e, "performance plot not written"),
    }
    info!("shutdown");
    Ok(())
}

fn prepare_data(cfg: &ExperimentConfig, n_data_orgs: usize) -> Result<()> {
    if raw_mnist_available(&cfg.raw_mnist_dir) {
        setup_mnist(&cfg.raw_mnist_dir, &cfg.data_path, n_data_orgs).context("splitting raw mnist")?;
    } else {
        warn!(raw_dir = %cfg.raw_mnist_dir.display(), "raw mnist not found, generating synthetic digits");
        setup_synthetic_mnist(&cfg.data_path, n_data_orgs, cfg.synthetic_train_samples, cfg.synthetic_test_samples, cfg.seed)
            .context("generating synthetic mnist")?;
    }
    Ok(())
}

fn run(cfg: ExperimentConfig) -> Result<Vec<Performance>> {
    let backend = cfg.backend_type()?;
    let network = Network::new();
    let clients = (0..cfg.n_organizations).map(|_| Client::new(&network, backend)).collect::<Result<Vec<_>, _>>()?;
    let (algo_client, data_clients) = clients.split_first().context("no organization configured")?;
    let algo_org = algo_client.organization_id().to_string();
    info!(algo_org = %algo_org, data_orgs = data_clients.len(), "organizations connected");

    prepare_data(&cfg, data_clients.len())?;

    let mut all_orgs = vec![algo_org.clone()];
    all_orgs.extend(data_clients.iter().map(|c| c.organization_id().to_string()));
    let metric_key = algo_client.add_metric(
        MetricSpec {
            name: "accuracy".into(),
            permissions: Permissions::restricted(all_orgs),
            dependencies: Dependency::new(["ndarray==0.15.6"])?,
        },
        accuracy_metric(),
    )?;

    let mut train_data_nodes = Vec::with_capacity(data_clients.len());
    let mut test_data_nodes = Vec::with_capacity(data_clients.len());
    for (i, client) in data_clients.iter().enumerate() {
        let permissions = Permissions::restricted(vec![algo_org.clone()]);
        let dataset_key = client.add_dataset(
            DatasetSpec {
                name: "MNIST".into(),
                data_type: "idx".into(),
                description: "handwritten digits, 28x28 grey levels".into(),
                permissions: permissions.clone(),
                logs_permission: permissions,
            },
            Arc::new(MnistOpener),
        )?;
        let train_key = client.add_data_sample(DataSampleSpec {
            data_manager_keys: vec![dataset_key.clone()],
            test_only: false,
            path: org_folder(&cfg.data_path, i + 1, "train"),
        })?;
        let test_key = client.add_data_sample(DataSampleSpec {
            data_manager_keys: vec![dataset_key.clone()],
            test_only: true,
            path: org_folder(&cfg.data_path, i + 1, "test"),
        })?;
        let org = client.organization_id();
        train_data_nodes.push(TrainDataNode::new(org, &dataset_key, vec![train_key]));
        test_data_nodes.push(TestDataNode::new(org, &dataset_key, vec![test_key], vec![metric_key.clone()]));
    }

    let algo = FedAvgAlgo::new(Cnn::new(cfg.cnn.clone(), cfg.seed), cfg.optimizer, cfg.index_generator(), cfg.seed)?;
    let experiment = Experiment {
        name: Some("mnist-fedavg".into()),
        train_data_nodes,
        evaluation_strategy: Some(EvaluationStrategy::every_round(test_data_nodes)),
        aggregation_node: AggregationNode::new(&algo_org),
        num_rounds: cfg.num_rounds,
        experiment_folder: cfg.experiment_folder.clone(),
        dependencies: Dependency::new(["ndarray==0.15.6", "rand==0.8.5"])?,
    };
    let plan = execute_experiment(algo_client, &algo, &FedAvg::new(), &experiment).context("running compute plan")?;
    info!(compute_plan = %plan.key, status = ?plan.status, tasks = plan.tasks.len(), "compute plan finished");

    // models live on the training organizations
    let downloader = data_clients.first().context("no data provider")?;
    let folder = download_algo_files(downloader, &plan.key, None, &cfg.algo_files_folder)?;
    let model = restore_model(&cfg, &folder)?;
    let restored = FedAvgAlgo::new(model, cfg.optimizer, cfg.index_generator(), cfg.seed)?;
    let local_accuracy = score_on_test_split(&restored, &org_folder(&cfg.data_path, 1, "test"))?;
    info!(folder = %folder.display(), organization = downloader.organization_id(), accuracy = local_accuracy, "last round model restored");
    println!("model of {} restored from {}: test accuracy {local_accuracy:.4}", downloader.organization_id(), folder.display());

    Ok(algo_client.get_performances(&plan.key)?)
}

/// Rebuilds the walkthrough CNN from downloaded algo files.
fn restore_model(cfg: &ExperimentConfig, folder: &Path) -> Result<Cnn> {
    let state = load_algo(folder).context("reading downloaded model")?;
    let mut model = Cnn::new(cfg.cnn.clone(), cfg.seed);
    model.load_state(&state).context("loading downloaded weights")?;
    Ok(model)
}

fn score_on_test_split(algo: &FedAvgAlgo<Cnn>, folder: &Path) -> Result<f64> {
    let samples = MnistOpener.open(&[folder.to_path_buf()])?;
    let predictions = algo.predict(&samples)?;
    Ok(accuracy(&samples, &predictions)?)
}

fn print_performances(performances: &[Performance]) {
    println!("{:<10} {:>6} {:>10}", "worker", "round", "accuracy");
    for p in performances {
        println!("{:<10} {:>6} {:>10.4}", p.worker, p.round_idx, p.performance);
    }
}
