/// This module only defines the dataset logic for loading, grouping and sampling
/// the labeled images, reporting on them lives in `evaluation`.
use std::path::{Path, PathBuf};

use tracing::info;

use crate::{Error, Result};

pub mod classes;
pub mod data;
pub mod download;
pub mod folder;
pub mod records;
pub mod sampler;
pub mod stats;
pub mod tfrecord;

pub use classes::ClassNames;
pub use data::{ClassIndex, LabeledImages};
pub use records::{RecordDataset, ShardParams};
pub use sampler::{AnchorPositivePairs, PairBatch};

/// Builds the two splits of a dataset from its parameters.
pub trait DatasetBuilder {
    type Dataset: Dataset;
    fn build_train(&self) -> Result<Self::Dataset>;
    fn build_test(&self) -> Option<Result<Self::Dataset>>;
}

/// Batched access to an in-memory dataset.
pub trait Dataset {
    type DataPoint;
    fn next(&mut self) -> Option<Self::DataPoint>;
    fn reset(&mut self);
    fn shuffle(&mut self);
}

/// Pulls up to `num_batches` batches (all of them if `None`) and stacks them
/// into one set, the way the scripts materialize a split before training.
pub fn take_batches<D>(dataset: &mut D, num_batches: Option<usize>) -> Result<LabeledImages>
where
    D: Dataset<DataPoint = LabeledImages>,
{
    let mut batches = Vec::new();
    while num_batches.map_or(true, |n| batches.len() < n) {
        match dataset.next() {
            Some(batch) => batches.push(batch),
            None => break,
        }
    }
    LabeledImages::concat(&batches)
}

/// Files of `dir` with the given extension, sorted by name.
pub fn list_shards(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut shards = Vec::new();
    for entry in dir.read_dir()? {
        let path = entry?.path();
        if path.is_file() && path.extension().map_or(false, |e| e == extension) {
            shards.push(path);
        }
    }
    if shards.is_empty() {
        return Err(Error::NoShards {
            dir: dir.to_path_buf(),
            extension: extension.to_string(),
        });
    }
    shards.sort();
    Ok(shards)
}

/// Splits sorted shards into (training, validation), validation being the first
/// `floor(len * validation_split)` files.
pub fn split_shards(shards: &[PathBuf], validation_split: f64) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    if !(0.0..1.0).contains(&validation_split) {
        return Err(Error::invalid(
            "validation_split",
            validation_split,
            "must be in [0, 1)",
        ));
    }
    let split = (shards.len() as f64 * validation_split) as usize;
    let validation = shards[..split].to_vec();
    let training = shards[split..].to_vec();
    info!(
        "{} shards, {} for training and {} for validation",
        shards.len(),
        training.len(),
        validation.len()
    );
    Ok((training, validation))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    #[test]
    fn shards_are_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.tfrec", "a.tfrec", "c.txt", "d.tfrec"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let shards = list_shards(dir.path(), "tfrec").unwrap();
        let names: Vec<_> = shards
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.tfrec", "b.tfrec", "d.tfrec"]);
    }

    #[test]
    fn no_shards_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            list_shards(dir.path(), "tfrec"),
            Err(Error::NoShards { .. })
        ));
    }

    #[test]
    fn validation_takes_the_front() {
        let shards: Vec<PathBuf> = (0..10).map(|i| format!("{i:02}.tfrec").into()).collect();
        let (train, val) = split_shards(&shards, 0.25).unwrap();
        assert_eq!(val.len(), 2);
        assert_eq!(train.len(), 8);
        assert_eq!(val[0], PathBuf::from("00.tfrec"));
        assert_eq!(train[0], PathBuf::from("02.tfrec"));
        assert!(split_shards(&shards, 1.0).is_err());
    }
}
