//! Core library for federated learning experiments across simulated organizations.

use std::path::PathBuf;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

pub mod algorithm;
pub mod client;
pub mod dependency;
pub mod error;
pub mod evaluation;
pub mod experiment;
pub mod federated_learning;
pub mod index_generator;
pub mod metric;
pub mod mnist;
pub mod model_loading;
pub mod nn;
pub mod nodes;
pub mod opener;
pub mod schemas;

pub use algorithm::{Algo, AlgoDescription, AveragedUpdate, FedAvgAlgo, LocalUpdate};
pub use client::{Client, MetricSpec, Network};
pub use dependency::Dependency;
pub use error::{PlatformError, Result};
pub use evaluation::{EvalRounds, EvaluationStrategy};
pub use experiment::{execute_experiment, Experiment};
pub use federated_learning::{AggregationMethod, FedAvg, FederatedLearningCoordinator, Strategy};
pub use index_generator::{IndexGenerator, IndexGeneratorConfig};
pub use model_loading::{download_algo_files, load_algo};
pub use nodes::{AggregationNode, TestDataNode, TrainDataNode};
pub use opener::{DataOpener, Datasamples, MnistOpener};
pub use schemas::{BackendType, ComputePlan, ComputePlanStatus, OrganizationInfo, Performance, Permissions};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Installs the global subscriber once. `FEDERA_JSON_LOG=1` switches to JSON lines.
pub fn init_tracing(service: &str) -> anyhow::Result<()> {
    TRACING_INIT.get_or_try_init(|| -> anyhow::Result<()> {
        let json = std::env::var("FEDERA_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if json {
            tracing_subscriber::fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false).boxed()
        } else {
            tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true).boxed()
        };
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry().with(fmt_layer).with(env_filter).try_init()?;
        Ok(())
    })?;
    info!(target: "federa", service, "tracing initialized");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub backend: String,
    /// Organizations taking part, the algorithm provider included.
    pub n_organizations: usize,
    pub num_rounds: u64,
    pub num_updates: usize,
    pub batch_size: usize,
    pub optimizer: nn::OptimizerConfig,
    pub seed: u64,
    pub data_path: PathBuf,
    pub raw_mnist_dir: PathBuf,
    pub synthetic_train_samples: usize,
    pub synthetic_test_samples: usize,
    pub experiment_folder: PathBuf,
    pub algo_files_folder: PathBuf,
    pub cnn: nn::CnnConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            backend: "subprocess".into(),
            n_organizations: 3,
            num_rounds: 3,
            num_updates: 100,
            batch_size: 32,
            optimizer: nn::OptimizerConfig::default(),
            seed: 42,
            data_path: PathBuf::from("tmp/data_mnist"),
            raw_mnist_dir: PathBuf::from("tmp/raw_mnist"),
            synthetic_train_samples: 6000,
            synthetic_test_samples: 1000,
            experiment_folder: PathBuf::from("tmp/experiment_summaries"),
            algo_files_folder: PathBuf::from("tmp/algo_files"),
            cnn: nn::CnnConfig::default(),
        }
    }
}

impl ExperimentConfig {
    pub fn backend_type(&self) -> Result<BackendType> { self.backend.parse() }

    pub fn index_generator(&self) -> IndexGeneratorConfig {
        IndexGeneratorConfig { batch_size: self.batch_size, num_updates: self.num_updates, ..Default::default() }
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_organizations < 2 {
            return Err(PlatformError::invalid("config", "need an algorithm provider and at least one data provider"));
        }
        if self.num_rounds == 0 {
            return Err(PlatformError::invalid("config", "num_rounds must be at least 1"));
        }
        self.backend_type()?;
        Ok(())
    }
}

fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
    Ok(config::Config::builder().set_default("backend", "subprocess")?.set_default("seed", 42)?)
}

/// Defaults, then `FEDERA_CONFIG_FILE` when set, then `FEDERA_*` variables
/// (`__` separates nested keys, e.g. `FEDERA_CNN__HIDDEN`).
pub fn load_config() -> Result<ExperimentConfig> {
    let mut builder = builder()?;
    if let Ok(file) = std::env::var("FEDERA_CONFIG_FILE") {
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix("FEDERA").prefix_separator("_").separator("__").try_parsing(true));
    let cfg: ExperimentConfig = builder.build()?.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}

/// Same layering as [`load_config`] for an in-memory document, without the environment.
pub fn parse_config(text: &str, format: config::FileFormat) -> Result<ExperimentConfig> {
    let cfg: ExperimentConfig = builder()?.add_source(config::File::from_str(text, format)).build()?.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_walkthrough_defaults() {
        let cfg = parse_config("", config::FileFormat::Yaml).unwrap();
        assert_eq!(cfg, ExperimentConfig::default());
        assert_eq!(cfg.index_generator().num_updates, 100);
        assert_eq!(cfg.backend_type().unwrap(), BackendType::Subprocess);
    }

    #[test]
    fn nested_overrides_applied() {
        let text = "num_rounds: 5\noptimizer:\n  kind: sgd\n  lr: 0.1\ncnn:\n  hidden: 16\n";
        let cfg = parse_config(text, config::FileFormat::Yaml).unwrap();
        assert_eq!(cfg.num_rounds, 5);
        assert_eq!(cfg.cnn.hidden, 16);
        assert_eq!(cfg.cnn.channels, nn::CnnConfig::default().channels);
        assert!(matches!(cfg.optimizer, nn::OptimizerConfig::Sgd { .. }));
    }

    #[test]
    fn unknown_backend_and_zero_rounds_rejected() {
        assert!(matches!(parse_config("backend: cloud", config::FileFormat::Yaml), Err(PlatformError::UnknownBackend(_))));
        assert!(parse_config("num_rounds: 0", config::FileFormat::Yaml).is_err());
    }
}
