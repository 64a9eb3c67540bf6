//! MNIST preparation: IDX codec, per-organization partitioning and an
//! offline synthetic stand-in.

use std::fs;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use ndarray::{s, Array3, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::error::{PlatformError, Result};

pub const IMAGES_FILE: &str = "images.idx";
pub const LABELS_FILE: &str = "labels.idx";
pub const IMAGE_SIDE: usize = 28;
pub const NUM_CLASSES: usize = 10;

const IMAGES_MAGIC: u32 = 0x0000_0803;
const LABELS_MAGIC: u32 = 0x0000_0801;

const RAW_TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
const RAW_TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
const RAW_TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
const RAW_TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

fn format_err(path: &Path, reason: impl Into<String>) -> PlatformError {
    PlatformError::DataFormat { path: path.display().to_string(), reason: reason.into() }
}

fn read_header(bytes: &[u8], path: &Path, magic: u32, dims: usize) -> Result<Vec<usize>> {
    let need = 4 * (dims + 1);
    if bytes.len() < need { return Err(format_err(path, "truncated header")); }
    let word = |i: usize| u32::from_be_bytes([bytes[4 * i], bytes[4 * i + 1], bytes[4 * i + 2], bytes[4 * i + 3]]);
    if word(0) != magic { return Err(format_err(path, format!("bad magic {:#010x}", word(0)))); }
    Ok((1..=dims).map(|i| word(i) as usize).collect())
}

fn read_all(path: &Path) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    fs::File::open(path)?.read_to_end(&mut buf)?;
    Ok(buf)
}

pub fn read_idx_images(path: &Path) -> Result<Array3<u8>> {
    let bytes = read_all(path)?;
    let dims = read_header(&bytes, path, IMAGES_MAGIC, 3)?;
    let body = &bytes[16..];
    let expected = dims[0]
        .checked_mul(dims[1])
        .and_then(|n| n.checked_mul(dims[2]))
        .ok_or_else(|| format_err(path, format!("dimensions {dims:?} overflow")))?;
    if body.len() != expected { return Err(format_err(path, format!("expected {expected} pixels, found {}", body.len()))); }
    Array3::from_shape_vec((dims[0], dims[1], dims[2]), body.to_vec()).map_err(|e| format_err(path, e.to_string()))
}

pub fn read_idx_labels(path: &Path) -> Result<Vec<u8>> {
    let bytes = read_all(path)?;
    let dims = read_header(&bytes, path, LABELS_MAGIC, 1)?;
    let body = &bytes[8..];
    if body.len() != dims[0] { return Err(format_err(path, format!("expected {} labels, found {}", dims[0], body.len()))); }
    if let Some(bad) = body.iter().find(|l| **l as usize >= NUM_CLASSES) {
        return Err(format_err(path, format!("label {bad} out of range")));
    }
    Ok(body.to_vec())
}

pub fn write_idx_images(path: &Path, images: &Array3<u8>) -> Result<()> {
    let mut w = BufWriter::new(fs::File::create(path)?);
    w.write_all(&IMAGES_MAGIC.to_be_bytes())?;
    for d in images.shape() { w.write_all(&(*d as u32).to_be_bytes())?; }
    for px in images.iter() { w.write_all(&[*px])?; }
    w.flush()?;
    Ok(())
}

pub fn write_idx_labels(path: &Path, labels: &[u8]) -> Result<()> {
    let mut w = BufWriter::new(fs::File::create(path)?);
    w.write_all(&LABELS_MAGIC.to_be_bytes())?;
    w.write_all(&(labels.len() as u32).to_be_bytes())?;
    w.write_all(labels)?;
    w.flush()?;
    Ok(())
}

/// Folder holding organization `i` (1-based) data for one split.
pub fn org_folder(dest: &Path, org: usize, split: &str) -> PathBuf {
    dest.join(format!("org_{org}")).join(split)
}

/// Writes `org_1..=org_n` train/test folders from full train and test sets.
/// Shards are contiguous and equal-sized; the remainder is dropped.
pub fn partition(
    dest: &Path,
    train: (&Array3<u8>, &[u8]),
    test: (&Array3<u8>, &[u8]),
    n_orgs: usize,
) -> Result<()> {
    if n_orgs == 0 { return Err(PlatformError::invalid("partition", "at least one organization is required")); }
    for (split, (images, labels)) in [("train", train), ("test", test)] {
        let shard = labels.len() / n_orgs;
        if shard == 0 {
            return Err(PlatformError::invalid("partition", format!("{} {split} samples cannot feed {n_orgs} organizations", labels.len())));
        }
        for org in 0..n_orgs {
            let folder = org_folder(dest, org + 1, split);
            fs::create_dir_all(&folder)?;
            let range = org * shard..(org + 1) * shard;
            write_idx_images(&folder.join(IMAGES_FILE), &images.slice(s![range.clone(), .., ..]).to_owned())?;
            write_idx_labels(&folder.join(LABELS_FILE), &labels[range])?;
        }
    }
    info!(dest = %dest.display(), n_orgs, "mnist partitioned");
    Ok(())
}

fn already_prepared(dest: &Path, n_orgs: usize) -> bool {
    (1..=n_orgs).all(|org| {
        ["train", "test"].iter().all(|split| {
            let f = org_folder(dest, org, split);
            f.join(IMAGES_FILE).is_file() && f.join(LABELS_FILE).is_file()
        })
    })
}

/// Splits the raw MNIST files found in `raw_dir` across `n_orgs` organizations.
/// Does nothing when `dest` already holds every organization folder.
pub fn setup_mnist(raw_dir: &Path, dest: &Path, n_orgs: usize) -> Result<()> {
    if already_prepared(dest, n_orgs) {
        info!(dest = %dest.display(), "mnist folders already present");
        return Ok(());
    }
    let train_images = read_idx_images(&raw_dir.join(RAW_TRAIN_IMAGES))?;
    let train_labels = read_idx_labels(&raw_dir.join(RAW_TRAIN_LABELS))?;
    let test_images = read_idx_images(&raw_dir.join(RAW_TEST_IMAGES))?;
    let test_labels = read_idx_labels(&raw_dir.join(RAW_TEST_LABELS))?;
    partition(dest, (&train_images, &train_labels), (&test_images, &test_labels), n_orgs)
}

pub fn raw_mnist_available(raw_dir: &Path) -> bool {
    [RAW_TRAIN_IMAGES, RAW_TRAIN_LABELS, RAW_TEST_IMAGES, RAW_TEST_LABELS].iter().all(|f| raw_dir.join(f).is_file())
}

type Stroke = ((f32, f32), (f32, f32));

/// Deterministic digit-like images: each class draws its own three strokes,
/// every sample jitters the position and sprinkles noise.
pub fn synthetic_mnist(n: usize, seed: u64) -> (Array3<u8>, Vec<u8>) {
    let mut class_rng = StdRng::seed_from_u64(0x5eed_d161);
    let templates: Vec<Vec<Stroke>> = (0..NUM_CLASSES)
        .map(|_| {
            (0..3)
                .map(|_| {
                    let p = |rng: &mut StdRng| -> (f32, f32) { (rng.gen_range(6.0..22.0), rng.gen_range(6.0..22.0)) };
                    (p(&mut class_rng), p(&mut class_rng))
                })
                .collect()
        })
        .collect();

    let mut rng = StdRng::seed_from_u64(seed);
    let mut images = Array3::<u8>::zeros((n, IMAGE_SIDE, IMAGE_SIDE));
    let mut labels = Vec::with_capacity(n);
    for (i, mut img) in images.axis_iter_mut(Axis(0)).enumerate() {
        let label = (i % NUM_CLASSES) as u8;
        let (dx, dy): (f32, f32) = (rng.gen_range(-2.0..=2.0), rng.gen_range(-2.0..=2.0));
        for &((x0, y0), (x1, y1)) in &templates[label as usize] {
            for step in 0..=32 {
                let t = step as f32 / 32.0;
                let x = (x0 + (x1 - x0) * t + dx).round() as isize;
                let y = (y0 + (y1 - y0) * t + dy).round() as isize;
                for (ox, oy) in [(0, 0), (1, 0), (0, 1)] {
                    let (px, py) = (x + ox, y + oy);
                    if (0..IMAGE_SIDE as isize).contains(&px) && (0..IMAGE_SIDE as isize).contains(&py) {
                        img[[py as usize, px as usize]] = rng.gen_range(180..=255);
                    }
                }
            }
        }
        for _ in 0..12 {
            let (px, py) = (rng.gen_range(0..IMAGE_SIDE), rng.gen_range(0..IMAGE_SIDE));
            img[[py, px]] = img[[py, px]].saturating_add(rng.gen_range(0..80));
        }
        labels.push(label);
    }
    (images, labels)
}

/// Offline variant of [`setup_mnist`] built on [`synthetic_mnist`].
pub fn setup_synthetic_mnist(dest: &Path, n_orgs: usize, n_train: usize, n_test: usize, seed: u64) -> Result<()> {
    if already_prepared(dest, n_orgs) {
        info!(dest = %dest.display(), "mnist folders already present");
        return Ok(());
    }
    let (train_images, train_labels) = synthetic_mnist(n_train, seed);
    let (test_images, test_labels) = synthetic_mnist(n_test, seed.wrapping_add(1));
    partition(dest, (&train_images, &train_labels), (&test_images, &test_labels), n_orgs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idx_files_read_back() {
        let tmp = tempfile::tempdir().unwrap();
        let (images, labels) = synthetic_mnist(4, 1);
        write_idx_images(&tmp.path().join(IMAGES_FILE), &images).unwrap();
        write_idx_labels(&tmp.path().join(LABELS_FILE), &labels).unwrap();
        assert_eq!(read_idx_images(&tmp.path().join(IMAGES_FILE)).unwrap(), images);
        assert_eq!(read_idx_labels(&tmp.path().join(LABELS_FILE)).unwrap(), labels);
    }

    #[test]
    fn labels_file_with_wrong_magic_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(LABELS_FILE);
        write_idx_images(&path, &Array3::zeros((1, 2, 2))).unwrap();
        assert!(matches!(read_idx_labels(&path), Err(PlatformError::DataFormat { .. })));
    }

    #[test]
    fn oversized_header_rejected_without_panicking() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(IMAGES_FILE);
        let mut bytes = IMAGES_MAGIC.to_be_bytes().to_vec();
        for _ in 0..3 { bytes.extend_from_slice(&u32::MAX.to_be_bytes()); }
        bytes.extend_from_slice(&[0; 8]);
        fs::write(&path, bytes).unwrap();
        assert!(matches!(read_idx_images(&path), Err(PlatformError::DataFormat { .. })));
    }

    #[test]
    fn partition_drops_remainder() {
        let tmp = tempfile::tempdir().unwrap();
        setup_synthetic_mnist(tmp.path(), 2, 21, 5, 3).unwrap();
        let l1 = read_idx_labels(&org_folder(tmp.path(), 1, "train").join(LABELS_FILE)).unwrap();
        let l2 = read_idx_labels(&org_folder(tmp.path(), 2, "train").join(LABELS_FILE)).unwrap();
        let t2 = read_idx_labels(&org_folder(tmp.path(), 2, "test").join(LABELS_FILE)).unwrap();
        assert_eq!((l1.len(), l2.len(), t2.len()), (10, 10, 2));
        assert_eq!(l2[0], 0); // sample 10 -> class 0
    }

    #[test]
    fn synthetic_is_deterministic() {
        assert_eq!(synthetic_mnist(8, 9), synthetic_mnist(8, 9));
        assert_ne!(synthetic_mnist(8, 9).0, synthetic_mnist(8, 10).0);
    }

    #[test]
    fn too_few_samples_for_orgs() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(setup_synthetic_mnist(tmp.path(), 4, 3, 8, 0).is_err());
    }
}
