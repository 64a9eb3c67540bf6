//! In-process backend serving the platform client interface.
//!
//! Every [`Client`] is one organization. Clients created on the same
//! [`Network`] share a single asset ledger, which stands in for the
//! platform the organizations would otherwise talk to.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::dependency::Dependency;
use crate::error::{PlatformError, Result};
use crate::metric::MetricFunction;
use crate::nn::ModelState;
use crate::opener::{DataOpener, Datasamples};
use crate::schemas::{
    new_key, AssetKey, BackendType, ComputePlan, ComputePlanStatus, DataSample, DataSampleSpec, Dataset, DatasetSpec, MetricInfo,
    OrganizationId, OrganizationInfo, Performance, Permissions, TaskRecord,
};

struct DatasetRecord {
    info: Dataset,
    opener: Arc<dyn DataOpener>,
}

struct MetricRecord {
    info: MetricInfo,
    function: MetricFunction,
}

#[derive(Default)]
struct Ledger {
    organizations: Vec<OrganizationId>,
    datasets: HashMap<AssetKey, DatasetRecord>,
    data_samples: HashMap<AssetKey, DataSample>,
    metrics: HashMap<AssetKey, MetricRecord>,
    compute_plans: HashMap<AssetKey, ComputePlan>,
    performances: HashMap<AssetKey, Vec<Performance>>,
    /// Local model of each training organization, keyed by plan, round and organization.
    models: HashMap<(AssetKey, u64, OrganizationId), ModelState>,
}

/// The simulated set of organizations and their shared ledger.
#[derive(Clone, Default)]
pub struct Network {
    ledger: Arc<RwLock<Ledger>>,
}

impl Network {
    pub fn new() -> Self { Self::default() }

    pub fn organizations(&self) -> Vec<OrganizationId> { self.ledger.read().organizations.clone() }
}

#[derive(Debug, Clone)]
pub struct MetricSpec {
    pub name: String,
    pub permissions: Permissions,
    pub dependencies: Dependency,
}

#[derive(Clone)]
pub struct Client {
    network: Network,
    organization: OrganizationInfo,
    backend: BackendType,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("organization", &self.organization.organization_id).field("backend", &self.backend).finish()
    }
}

impl Client {
    /// Joins `network` as a new organization.
    pub fn new(network: &Network, backend: BackendType) -> Result<Self> {
        if backend != BackendType::Subprocess {
            return Err(PlatformError::Unsupported(backend.to_string()));
        }
        let organization_id = {
            let mut ledger = network.ledger.write();
            let id = format!("org-{}", ledger.organizations.len());
            ledger.organizations.push(id.clone());
            id
        };
        info!(organization = %organization_id, %backend, "client connected");
        Ok(Self { network: network.clone(), organization: OrganizationInfo { organization_id }, backend })
    }

    pub fn organization_info(&self) -> OrganizationInfo { self.organization.clone() }
    pub fn organization_id(&self) -> &str { &self.organization.organization_id }
    pub fn backend(&self) -> BackendType { self.backend }
    pub fn network(&self) -> &Network { &self.network }

    pub fn add_dataset(&self, spec: DatasetSpec, opener: Arc<dyn DataOpener>) -> Result<AssetKey> {
        if spec.name.trim().is_empty() {
            return Err(PlatformError::invalid("dataset", "name is empty"));
        }
        let key = new_key();
        let info = Dataset {
            key: key.clone(),
            owner: self.organization.organization_id.clone(),
            name: spec.name,
            data_type: spec.data_type,
            description: spec.description,
            permissions: spec.permissions,
            logs_permission: spec.logs_permission,
            train_data_sample_keys: Vec::new(),
            test_data_sample_keys: Vec::new(),
            creation_date: Utc::now(),
        };
        self.network.ledger.write().datasets.insert(key.clone(), DatasetRecord { info, opener });
        info!(organization = %self.organization.organization_id, dataset = %key, "dataset registered");
        Ok(key)
    }

    pub fn add_data_sample(&self, spec: DataSampleSpec) -> Result<AssetKey> {
        if spec.data_manager_keys.is_empty() {
            return Err(PlatformError::invalid("data sample", "no dataset key given"));
        }
        if !spec.path.is_dir() {
            return Err(PlatformError::invalid("data sample", format!("{} is not a directory", spec.path.display())));
        }
        let me = &self.organization.organization_id;
        let mut ledger = self.network.ledger.write();
        for dk in &spec.data_manager_keys {
            let ds = ledger.datasets.get(dk).ok_or_else(|| PlatformError::not_found("dataset", dk.as_str()))?;
            if &ds.info.owner != me {
                return Err(PlatformError::PermissionDenied { organization: me.clone(), action: format!("add samples to dataset `{dk}`") });
            }
            let duplicate = ds
                .info
                .train_data_sample_keys
                .iter()
                .chain(&ds.info.test_data_sample_keys)
                .filter_map(|k| ledger.data_samples.get(k))
                .any(|s| s.path == spec.path);
            if duplicate {
                return Err(PlatformError::AlreadyExists { kind: "data sample", detail: format!("{} in dataset `{dk}`", spec.path.display()) });
            }
        }
        let key = new_key();
        for dk in &spec.data_manager_keys {
            if let Some(ds) = ledger.datasets.get_mut(dk) {
                let list = if spec.test_only { &mut ds.info.test_data_sample_keys } else { &mut ds.info.train_data_sample_keys };
                list.push(key.clone());
            }
        }
        let sample = DataSample {
            key: key.clone(),
            owner: me.clone(),
            data_manager_keys: spec.data_manager_keys,
            test_only: spec.test_only,
            path: spec.path,
            creation_date: Utc::now(),
        };
        debug!(organization = %me, sample = %key, test_only = sample.test_only, path = %sample.path.display(), "data sample registered");
        ledger.data_samples.insert(key.clone(), sample);
        Ok(key)
    }

    pub fn add_metric(&self, spec: MetricSpec, function: MetricFunction) -> Result<AssetKey> {
        let key = new_key();
        let info = MetricInfo {
            key: key.clone(),
            owner: self.organization.organization_id.clone(),
            name: spec.name,
            permissions: spec.permissions,
            dependencies: spec.dependencies,
            creation_date: Utc::now(),
        };
        self.network.ledger.write().metrics.insert(key.clone(), MetricRecord { info, function });
        info!(organization = %self.organization.organization_id, metric = %key, "metric registered");
        Ok(key)
    }

    pub fn get_dataset(&self, key: &str) -> Result<Dataset> {
        self.network.ledger.read().datasets.get(key).map(|d| d.info.clone()).ok_or_else(|| PlatformError::not_found("dataset", key))
    }

    pub fn get_data_sample(&self, key: &str) -> Result<DataSample> {
        self.network.ledger.read().data_samples.get(key).cloned().ok_or_else(|| PlatformError::not_found("data sample", key))
    }

    pub fn get_metric(&self, key: &str) -> Result<MetricInfo> {
        self.network.ledger.read().metrics.get(key).map(|m| m.info.clone()).ok_or_else(|| PlatformError::not_found("metric", key))
    }

    pub fn get_compute_plan(&self, key: &str) -> Result<ComputePlan> {
        self.network.ledger.read().compute_plans.get(key).cloned().ok_or_else(|| PlatformError::not_found("compute plan", key))
    }

    pub fn list_compute_plans(&self) -> Vec<ComputePlan> {
        let mut plans: Vec<_> = self.network.ledger.read().compute_plans.values().cloned().collect();
        plans.sort_by_key(|p| p.created_at);
        plans
    }

    /// Performances of a compute plan, ordered by round then by the order
    /// in which the workers joined the network.
    pub fn get_performances(&self, compute_plan_key: &str) -> Result<Vec<Performance>> {
        let ledger = self.network.ledger.read();
        if !ledger.compute_plans.contains_key(compute_plan_key) {
            return Err(PlatformError::not_found("compute plan", compute_plan_key));
        }
        let joined = |worker: &str| ledger.organizations.iter().position(|o| o == worker).unwrap_or(usize::MAX);
        let mut perfs = ledger.performances.get(compute_plan_key).cloned().unwrap_or_default();
        perfs.sort_by_key(|p| (p.round_idx, joined(&p.worker)));
        Ok(perfs)
    }

    /// This organization's own model after local training in `round_idx`,
    /// the last stored round when `None`. Only training organizations of
    /// the plan hold one.
    pub fn download_model(&self, compute_plan_key: &str, round_idx: Option<u64>) -> Result<(u64, ModelState)> {
        let ledger = self.network.ledger.read();
        let plan = ledger.compute_plans.get(compute_plan_key).ok_or_else(|| PlatformError::not_found("compute plan", compute_plan_key))?;
        let me = &self.organization.organization_id;
        if !plan.train_organizations.contains(me) {
            return Err(PlatformError::PermissionDenied { organization: me.clone(), action: format!("download models of compute plan `{compute_plan_key}`") });
        }
        let round = match round_idx {
            Some(r) => r,
            None => ledger
                .models
                .keys()
                .filter(|(k, _, org)| k == compute_plan_key && org == me)
                .map(|(_, r, _)| *r)
                .max()
                .ok_or_else(|| PlatformError::not_found("model", format!("{compute_plan_key} (no round stored for `{me}`)")))?,
        };
        let model = ledger
            .models
            .get(&(compute_plan_key.to_string(), round, me.clone()))
            .cloned()
            .ok_or_else(|| PlatformError::not_found("model", format!("{compute_plan_key} round {round} of `{me}`")))?;
        Ok((round, model))
    }

    // --- operations used while executing a compute plan ---

    /// Opens samples of `dataset_key` on behalf of `worker` for a plan owned by `plan_owner`.
    pub(crate) fn open_samples(&self, plan_owner: &str, worker: &str, dataset_key: &str, sample_keys: &[AssetKey], test_only: bool) -> Result<Datasamples> {
        let (opener, folders) = {
            let ledger = self.network.ledger.read();
            let ds = ledger.datasets.get(dataset_key).ok_or_else(|| PlatformError::not_found("dataset", dataset_key))?;
            if ds.info.owner != worker {
                return Err(PlatformError::invalid("node", format!("dataset `{dataset_key}` is not held by `{worker}`")));
            }
            if !ds.info.permissions.allows(&ds.info.owner, plan_owner) {
                return Err(PlatformError::PermissionDenied { organization: plan_owner.to_string(), action: format!("process dataset `{dataset_key}`") });
            }
            if sample_keys.is_empty() {
                return Err(PlatformError::invalid("node", format!("no data sample given for dataset `{dataset_key}`")));
            }
            let mut folders: Vec<PathBuf> = Vec::with_capacity(sample_keys.len());
            for sk in sample_keys {
                let s = ledger.data_samples.get(sk).ok_or_else(|| PlatformError::not_found("data sample", sk.as_str()))?;
                if !s.data_manager_keys.iter().any(|k| k == dataset_key) {
                    return Err(PlatformError::invalid("node", format!("data sample `{sk}` does not belong to dataset `{dataset_key}`")));
                }
                if s.test_only != test_only {
                    let expected = if test_only { "test" } else { "train" };
                    return Err(PlatformError::invalid("node", format!("data sample `{sk}` is not a {expected} sample")));
                }
                folders.push(s.path.clone());
            }
            (ds.opener.clone(), folders)
        };
        opener.open(&folders)
    }

    pub(crate) fn metric_function(&self, metric_key: &str, worker: &str) -> Result<MetricFunction> {
        let ledger = self.network.ledger.read();
        let m = ledger.metrics.get(metric_key).ok_or_else(|| PlatformError::not_found("metric", metric_key))?;
        if !m.info.permissions.allows(&m.info.owner, worker) {
            return Err(PlatformError::PermissionDenied { organization: worker.to_string(), action: format!("use metric `{metric_key}`") });
        }
        Ok(m.function.clone())
    }

    pub(crate) fn has_organization(&self, organization: &str) -> bool {
        self.network.ledger.read().organizations.iter().any(|o| o == organization)
    }

    pub(crate) fn insert_compute_plan(&self, plan: ComputePlan) {
        self.network.ledger.write().compute_plans.insert(plan.key.clone(), plan);
    }

    pub(crate) fn record_task(&self, plan_key: &str, task: TaskRecord) {
        if let Some(plan) = self.network.ledger.write().compute_plans.get_mut(plan_key) {
            plan.tasks.push(task);
        }
    }

    pub(crate) fn record_performance(&self, plan_key: &str, perf: Performance) {
        self.network.ledger.write().performances.entry(plan_key.to_string()).or_default().push(perf);
    }

    pub(crate) fn store_model(&self, plan_key: &str, round: u64, organization: &str, state: ModelState) {
        self.network.ledger.write().models.insert((plan_key.to_string(), round, organization.to_string()), state);
    }

    pub(crate) fn finish_compute_plan(&self, plan_key: &str, failure: Option<String>) {
        if let Some(plan) = self.network.ledger.write().compute_plans.get_mut(plan_key) {
            plan.status = if failure.is_some() { ComputePlanStatus::Failed } else { ComputePlanStatus::Done };
            plan.failure = failure;
            plan.ended_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::accuracy_metric;
    use crate::opener::MnistOpener;
    use crate::schemas::TaskKind;

    fn dataset_spec(authorized: Vec<OrganizationId>) -> DatasetSpec {
        DatasetSpec {
            name: "MNIST".into(),
            data_type: "idx".into(),
            description: "digits".into(),
            permissions: Permissions::restricted(authorized.clone()),
            logs_permission: Permissions::restricted(authorized),
        }
    }

    fn sample_spec(dataset: &str, path: PathBuf, test_only: bool) -> DataSampleSpec {
        DataSampleSpec { data_manager_keys: vec![dataset.to_string()], test_only, path }
    }

    #[test]
    fn only_subprocess_backend_served() {
        let net = Network::new();
        assert!(matches!(Client::new(&net, BackendType::Remote), Err(PlatformError::Unsupported(_))));
        let a = Client::new(&net, BackendType::Subprocess).unwrap();
        let b = Client::new(&net, BackendType::Subprocess).unwrap();
        assert_ne!(a.organization_info(), b.organization_info());
        assert_eq!(net.organizations().len(), 2);
    }

    #[test]
    fn data_sample_must_reference_existing_owned_dataset() {
        let tmp = tempfile::tempdir().unwrap();
        let net = Network::new();
        let owner = Client::new(&net, BackendType::Subprocess).unwrap();
        let other = Client::new(&net, BackendType::Subprocess).unwrap();
        let ds = owner.add_dataset(dataset_spec(vec![]), Arc::new(MnistOpener)).unwrap();

        assert!(matches!(owner.add_data_sample(sample_spec("missing", tmp.path().into(), false)), Err(PlatformError::NotFound { .. })));
        assert!(matches!(other.add_data_sample(sample_spec(&ds, tmp.path().into(), false)), Err(PlatformError::PermissionDenied { .. })));
        assert!(owner.add_data_sample(sample_spec(&ds, tmp.path().join("nope"), false)).is_err());

        let key = owner.add_data_sample(sample_spec(&ds, tmp.path().into(), true)).unwrap();
        assert_eq!(owner.get_dataset(&ds).unwrap().test_data_sample_keys, vec![key.clone()]);
        assert!(owner.get_data_sample(&key).unwrap().test_only);
    }

    #[test]
    fn duplicate_sample_path_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let net = Network::new();
        let owner = Client::new(&net, BackendType::Subprocess).unwrap();
        let ds = owner.add_dataset(dataset_spec(vec![]), Arc::new(MnistOpener)).unwrap();
        owner.add_data_sample(sample_spec(&ds, tmp.path().into(), false)).unwrap();
        assert!(matches!(owner.add_data_sample(sample_spec(&ds, tmp.path().into(), true)), Err(PlatformError::AlreadyExists { .. })));
    }

    #[test]
    fn opening_samples_checks_permissions_and_split() {
        let tmp = tempfile::tempdir().unwrap();
        crate::mnist::setup_synthetic_mnist(tmp.path(), 1, 10, 10, 0).unwrap();
        let net = Network::new();
        let algo = Client::new(&net, BackendType::Subprocess).unwrap();
        let data = Client::new(&net, BackendType::Subprocess).unwrap();
        let stranger = Client::new(&net, BackendType::Subprocess).unwrap();
        let ds = data.add_dataset(dataset_spec(vec![algo.organization_id().to_string()]), Arc::new(MnistOpener)).unwrap();
        let train = data.add_data_sample(sample_spec(&ds, crate::mnist::org_folder(tmp.path(), 1, "train"), false)).unwrap();

        let me = data.organization_id();
        let samples = data.open_samples(algo.organization_id(), me, &ds, &[train.clone()], false).unwrap();
        assert_eq!(samples.len(), 10);
        assert!(data.open_samples(algo.organization_id(), me, &ds, &[train.clone()], true).is_err());
        assert!(matches!(
            data.open_samples(stranger.organization_id(), me, &ds, &[train], false),
            Err(PlatformError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn metric_permissions_enforced() {
        let net = Network::new();
        let owner = Client::new(&net, BackendType::Subprocess).unwrap();
        let spec = MetricSpec { name: "accuracy".into(), permissions: Permissions::restricted(vec![]), dependencies: Dependency::default() };
        let key = owner.add_metric(spec, accuracy_metric()).unwrap();
        assert!(owner.metric_function(&key, owner.organization_id()).is_ok());
        assert!(owner.metric_function(&key, "org-9").is_err());
        assert_eq!(owner.get_metric(&key).unwrap().name, "accuracy");
    }

    fn plan(key: &str, owner: &Client, train: &[&Client]) -> ComputePlan {
        ComputePlan {
            key: key.into(),
            owner: owner.organization_id().into(),
            status: ComputePlanStatus::Doing,
            num_rounds: 2,
            train_organizations: train.iter().map(|c| c.organization_id().to_string()).collect(),
            aggregation_organization: owner.organization_id().into(),
            tasks: vec![],
            failure: None,
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    fn single(value: f32) -> ModelState {
        ModelState { tensors: vec![crate::nn::TensorState { name: "w".into(), shape: vec![1], values: vec![value] }] }
    }

    #[test]
    fn download_restricted_to_training_organizations() {
        let net = Network::new();
        let algo = Client::new(&net, BackendType::Subprocess).unwrap();
        let data = Client::new(&net, BackendType::Subprocess).unwrap();
        algo.insert_compute_plan(plan("cp", &algo, &[&data]));
        algo.record_task("cp", TaskRecord { kind: TaskKind::Train, worker: data.organization_id().into(), round_idx: 1, succeeded: true });
        algo.store_model("cp", 1, data.organization_id(), single(1.0));
        algo.store_model("cp", 2, data.organization_id(), single(2.0));
        assert_eq!(data.download_model("cp", None).unwrap(), (2, single(2.0)));
        assert_eq!(data.download_model("cp", Some(1)).unwrap().0, 1);
        assert!(data.download_model("cp", Some(7)).is_err());
        assert!(matches!(algo.download_model("cp", None), Err(PlatformError::PermissionDenied { .. })));
        algo.finish_compute_plan("cp", None);
        assert_eq!(algo.get_compute_plan("cp").unwrap().status, ComputePlanStatus::Done);
        assert_eq!(algo.get_compute_plan("cp").unwrap().tasks.len(), 1);
    }

    #[test]
    fn each_organization_downloads_its_own_model() {
        let net = Network::new();
        let algo = Client::new(&net, BackendType::Subprocess).unwrap();
        let a = Client::new(&net, BackendType::Subprocess).unwrap();
        let b = Client::new(&net, BackendType::Subprocess).unwrap();
        algo.insert_compute_plan(plan("cp", &algo, &[&a, &b]));
        algo.store_model("cp", 1, a.organization_id(), single(1.0));
        algo.store_model("cp", 1, b.organization_id(), single(5.0));
        algo.store_model("cp", 2, a.organization_id(), single(3.0));
        assert_eq!(a.download_model("cp", None).unwrap(), (2, single(3.0)));
        assert_eq!(b.download_model("cp", None).unwrap(), (1, single(5.0)));
        assert!(matches!(b.download_model("cp", Some(2)), Err(PlatformError::NotFound { .. })));
    }

    #[test]
    fn performances_follow_joining_order() {
        let net = Network::new();
        let clients: Vec<Client> = (0..12).map(|_| Client::new(&net, BackendType::Subprocess).unwrap()).collect();
        let owner = &clients[0];
        owner.insert_compute_plan(plan("cp", owner, &[]));
        for round in [2, 1] {
            for c in clients.iter().rev() {
                owner.record_performance("cp", Performance { worker: c.organization_id().into(), round_idx: round, metric_key: "m".into(), performance: 0.5 });
            }
        }
        let perfs = owner.get_performances("cp").unwrap();
        assert_eq!(perfs.len(), 24);
        let first_round: Vec<&str> = perfs[..12].iter().map(|p| p.worker.as_str()).collect();
        let joined: Vec<&str> = clients.iter().map(|c| c.organization_id()).collect();
        assert_eq!(first_round, joined);
        assert_eq!(perfs[11].worker, "org-11");
        assert!(perfs[..12].iter().all(|p| p.round_idx == 1));
    }
}
