//! Retrieving trained models from a finished compute plan.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::client::Client;
use crate::error::{PlatformError, Result};
use crate::nn::ModelState;
use crate::schemas::{AssetKey, OrganizationId};

pub const MODEL_FILE: &str = "model.json";
pub const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgoMetadata {
    pub compute_plan_key: AssetKey,
    pub round_idx: u64,
    pub downloaded_by: OrganizationId,
    pub num_parameters: usize,
    pub downloaded_at: DateTime<Utc>,
}

/// Writes this client's model of `round_idx` (the last round when `None`) into `dest`.
pub fn download_algo_files(client: &Client, compute_plan_key: &str, round_idx: Option<u64>, dest: &Path) -> Result<PathBuf> {
    let (round, state) = client.download_model(compute_plan_key, round_idx)?;
    write_algo_files(dest, compute_plan_key, round, client.organization_id(), &state)?;
    info!(compute_plan = compute_plan_key, round, dest = %dest.display(), "algo files downloaded");
    Ok(dest.to_path_buf())
}

/// `model.json` and `metadata.json` in the layout [`load_algo`] reads.
pub fn write_algo_files(dest: &Path, compute_plan_key: &str, round_idx: u64, owner: &str, state: &ModelState) -> Result<()> {
    fs::create_dir_all(dest)?;
    let metadata = AlgoMetadata {
        compute_plan_key: compute_plan_key.to_string(),
        round_idx,
        downloaded_by: owner.to_string(),
        num_parameters: state.num_parameters(),
        downloaded_at: Utc::now(),
    };
    fs::write(dest.join(MODEL_FILE), serde_json::to_vec(state)?)?;
    fs::write(dest.join(METADATA_FILE), serde_json::to_vec_pretty(&metadata)?)?;
    Ok(())
}

pub fn load_metadata(folder: &Path) -> Result<AlgoMetadata> {
    Ok(serde_json::from_slice(&fs::read(folder.join(METADATA_FILE))?)?)
}

/// Reads back a model written by [`download_algo_files`].
pub fn load_algo(folder: &Path) -> Result<ModelState> {
    let path = folder.join(MODEL_FILE);
    if !path.is_file() {
        return Err(PlatformError::not_found("model file", path.display().to_string()));
    }
    let state: ModelState = serde_json::from_slice(&fs::read(&path)?)?;
    let metadata = load_metadata(folder)?;
    if metadata.num_parameters != state.num_parameters() {
        return Err(PlatformError::DimensionMismatch { expected: metadata.num_parameters, actual: state.num_parameters() });
    }
    Ok(state)
}
