//! Asset records exchanged with the local backend.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dependency::Dependency;
use crate::error::PlatformError;

pub type AssetKey = String;
pub type OrganizationId = String;

pub fn new_key() -> AssetKey { uuid::Uuid::new_v4().to_string() }

/// Where computations run. Only `Subprocess` is served in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType { Subprocess, Docker, Remote }

impl FromStr for BackendType {
    type Err = PlatformError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "subprocess" => Ok(Self::Subprocess),
            "docker" => Ok(Self::Docker),
            "remote" => Ok(Self::Remote),
            other => Err(PlatformError::UnknownBackend(other.to_string())),
        }
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self { Self::Subprocess => "subprocess", Self::Docker => "docker", Self::Remote => "remote" };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationInfo { pub organization_id: OrganizationId }

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub public: bool,
    pub authorized_ids: Vec<OrganizationId>,
}

impl Permissions {
    pub fn public() -> Self { Self { public: true, authorized_ids: Vec::new() } }
    pub fn restricted(authorized_ids: Vec<OrganizationId>) -> Self { Self { public: false, authorized_ids } }

    /// Owners are always allowed, whatever the list says.
    pub fn allows(&self, owner: &str, organization: &str) -> bool {
        self.public || owner == organization || self.authorized_ids.iter().any(|id| id == organization)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub name: String,
    pub data_type: String,
    pub description: String,
    pub permissions: Permissions,
    pub logs_permission: Permissions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub key: AssetKey,
    pub owner: OrganizationId,
    pub name: String,
    pub data_type: String,
    pub description: String,
    pub permissions: Permissions,
    pub logs_permission: Permissions,
    pub train_data_sample_keys: Vec<AssetKey>,
    pub test_data_sample_keys: Vec<AssetKey>,
    pub creation_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSampleSpec {
    pub data_manager_keys: Vec<AssetKey>,
    pub test_only: bool,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSample {
    pub key: AssetKey,
    pub owner: OrganizationId,
    pub data_manager_keys: Vec<AssetKey>,
    pub test_only: bool,
    pub path: PathBuf,
    pub creation_date: DateTime<Utc>,
}

/// Metric metadata. The scoring function itself stays in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricInfo {
    pub key: AssetKey,
    pub owner: OrganizationId,
    pub name: String,
    pub permissions: Permissions,
    pub dependencies: Dependency,
    pub creation_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputePlanStatus { Doing, Done, Failed }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind { Train, Aggregate, Predict, Test }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub kind: TaskKind,
    pub worker: OrganizationId,
    pub round_idx: u64,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputePlan {
    pub key: AssetKey,
    pub owner: OrganizationId,
    pub status: ComputePlanStatus,
    pub num_rounds: u64,
    pub train_organizations: Vec<OrganizationId>,
    pub aggregation_organization: OrganizationId,
    pub tasks: Vec<TaskRecord>,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    pub worker: OrganizationId,
    pub round_idx: u64,
    pub metric_key: AssetKey,
    pub performance: f64,
}
