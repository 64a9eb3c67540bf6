//! Where each part of a compute plan runs.

use serde::{Deserialize, Serialize};

use crate::client::Client;
use crate::error::{PlatformError, Result};
use crate::schemas::{AssetKey, OrganizationId};

/// Training data held by one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainDataNode {
    pub organization_id: OrganizationId,
    pub data_manager_key: AssetKey,
    pub data_sample_keys: Vec<AssetKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDataNode {
    pub organization_id: OrganizationId,
    pub data_manager_key: AssetKey,
    pub test_data_sample_keys: Vec<AssetKey>,
    pub metric_keys: Vec<AssetKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationNode {
    pub organization_id: OrganizationId,
}

impl TrainDataNode {
    pub fn new(organization_id: impl Into<OrganizationId>, data_manager_key: impl Into<AssetKey>, data_sample_keys: Vec<AssetKey>) -> Self {
        Self { organization_id: organization_id.into(), data_manager_key: data_manager_key.into(), data_sample_keys }
    }

    /// Checks the node against the ledger.
    pub fn validate(&self, client: &Client) -> Result<()> {
        validate_samples(client, &self.organization_id, &self.data_manager_key, &self.data_sample_keys, false)
    }
}

impl TestDataNode {
    pub fn new(
        organization_id: impl Into<OrganizationId>,
        data_manager_key: impl Into<AssetKey>,
        test_data_sample_keys: Vec<AssetKey>,
        metric_keys: Vec<AssetKey>,
    ) -> Self {
        Self { organization_id: organization_id.into(), data_manager_key: data_manager_key.into(), test_data_sample_keys, metric_keys }
    }

    pub fn validate(&self, client: &Client) -> Result<()> {
        validate_samples(client, &self.organization_id, &self.data_manager_key, &self.test_data_sample_keys, true)?;
        if self.metric_keys.is_empty() {
            return Err(PlatformError::invalid("test node", format!("no metric for `{}`", self.organization_id)));
        }
        for key in &self.metric_keys {
            client.get_metric(key)?;
        }
        Ok(())
    }
}

impl AggregationNode {
    pub fn new(organization_id: impl Into<OrganizationId>) -> Self { Self { organization_id: organization_id.into() } }

    pub fn validate(&self, client: &Client) -> Result<()> {
        if client.has_organization(&self.organization_id) {
            Ok(())
        } else {
            Err(PlatformError::not_found("organization", self.organization_id.as_str()))
        }
    }
}

fn validate_samples(client: &Client, organization: &str, dataset_key: &str, sample_keys: &[AssetKey], test_only: bool) -> Result<()> {
    let dataset = client.get_dataset(dataset_key)?;
    if dataset.owner != organization {
        return Err(PlatformError::invalid("node", format!("dataset `{dataset_key}` belongs to `{}`, not `{organization}`", dataset.owner)));
    }
    if sample_keys.is_empty() {
        return Err(PlatformError::invalid("node", format!("no data sample for `{organization}`")));
    }
    let registered = if test_only { &dataset.test_data_sample_keys } else { &dataset.train_data_sample_keys };
    for key in sample_keys {
        if !registered.contains(key) {
            let split = if test_only { "test" } else { "train" };
            return Err(PlatformError::invalid("node", format!("`{key}` is not a {split} sample of dataset `{dataset_key}`")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::client::{MetricSpec, Network};
    use crate::dependency::Dependency;
    use crate::metric::accuracy_metric;
    use crate::opener::MnistOpener;
    use crate::schemas::{BackendType, DataSampleSpec, DatasetSpec, Permissions};

    #[test]
    fn nodes_checked_against_ledger() {
        let tmp = tempfile::tempdir().unwrap();
        let (train_dir, test_dir) = (tmp.path().join("train"), tmp.path().join("test"));
        std::fs::create_dir_all(&train_dir).unwrap();
        std::fs::create_dir_all(&test_dir).unwrap();

        let net = Network::new();
        let client = Client::new(&net, BackendType::Subprocess).unwrap();
        let org = client.organization_id().to_string();
        let spec = DatasetSpec {
            name: "d".into(),
            data_type: "idx".into(),
            description: String::new(),
            permissions: Permissions::public(),
            logs_permission: Permissions::public(),
        };
        let ds = client.add_dataset(spec, Arc::new(MnistOpener)).unwrap();
        let train = client.add_data_sample(DataSampleSpec { data_manager_keys: vec![ds.clone()], test_only: false, path: train_dir }).unwrap();
        let test = client.add_data_sample(DataSampleSpec { data_manager_keys: vec![ds.clone()], test_only: true, path: test_dir }).unwrap();
        let metric = client
            .add_metric(MetricSpec { name: "accuracy".into(), permissions: Permissions::public(), dependencies: Dependency::default() }, accuracy_metric())
            .unwrap();

        assert!(TrainDataNode::new(&org, &ds, vec![train.clone()]).validate(&client).is_ok());
        assert!(TrainDataNode::new(&org, &ds, vec![test.clone()]).validate(&client).is_err());
        assert!(TrainDataNode::new("org-7", &ds, vec![train.clone()]).validate(&client).is_err());
        assert!(TrainDataNode::new(&org, &ds, vec![]).validate(&client).is_err());

        assert!(TestDataNode::new(&org, &ds, vec![test.clone()], vec![metric.clone()]).validate(&client).is_ok());
        assert!(TestDataNode::new(&org, &ds, vec![train], vec![metric]).validate(&client).is_err());
        assert!(TestDataNode::new(&org, &ds, vec![test], vec!["missing".into()]).validate(&client).is_err());

        assert!(AggregationNode::new(&org).validate(&client).is_ok());
        assert!(AggregationNode::new("org-7").validate(&client).is_err());
    }
}
