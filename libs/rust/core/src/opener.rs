//! Data openers turn registered sample folders into in-memory samples.

use std::path::PathBuf;

use ndarray::{concatenate, Array3, Axis};

use crate::error::{PlatformError, Result};
use crate::mnist::{read_idx_images, read_idx_labels, IMAGES_FILE, IMAGE_SIDE, LABELS_FILE};

/// Images (N x 28 x 28, raw grey levels) with their digit labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Datasamples {
    pub images: Array3<u8>,
    pub labels: Vec<u8>,
}

impl Datasamples {
    pub fn len(&self) -> usize { self.labels.len() }
    pub fn is_empty(&self) -> bool { self.labels.is_empty() }

    pub fn new(images: Array3<u8>, labels: Vec<u8>) -> Result<Self> {
        if images.len_of(Axis(0)) != labels.len() {
            return Err(PlatformError::DimensionMismatch { expected: images.len_of(Axis(0)), actual: labels.len() });
        }
        Ok(Self { images, labels })
    }
}

pub trait DataOpener: Send + Sync {
    fn open(&self, folders: &[PathBuf]) -> Result<Datasamples>;
}

/// Reads `images.idx` and `labels.idx` from every folder and stacks them.
#[derive(Debug, Default, Clone, Copy)]
pub struct MnistOpener;

impl DataOpener for MnistOpener {
    fn open(&self, folders: &[PathBuf]) -> Result<Datasamples> {
        if folders.is_empty() {
            return Err(PlatformError::invalid("data samples", "no folder to open"));
        }
        let mut images = Vec::with_capacity(folders.len());
        let mut labels = Vec::new();
        for folder in folders {
            let imgs = read_idx_images(&folder.join(IMAGES_FILE))?;
            let lbls = read_idx_labels(&folder.join(LABELS_FILE))?;
            let (_, rows, cols) = imgs.dim();
            if (rows, cols) != (IMAGE_SIDE, IMAGE_SIDE) {
                return Err(PlatformError::DataFormat {
                    path: folder.display().to_string(),
                    reason: format!("{rows}x{cols} images, expected {IMAGE_SIDE}x{IMAGE_SIDE}"),
                });
            }
            if imgs.len_of(Axis(0)) != lbls.len() {
                return Err(PlatformError::DataFormat {
                    path: folder.display().to_string(),
                    reason: format!("{} images but {} labels", imgs.len_of(Axis(0)), lbls.len()),
                });
            }
            images.push(imgs);
            labels.extend(lbls);
        }
        let views: Vec<_> = images.iter().map(|a| a.view()).collect();
        let images = concatenate(Axis(0), &views).map_err(|e| PlatformError::invalid("data samples", e.to_string()))?;
        tracing::debug!(folders = folders.len(), samples = labels.len(), "opened mnist samples");
        Datasamples::new(images, labels)
    }
}
