use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use super::data::{rgb_to_array, LabeledImages};
use super::tfrecord::{Example, TfRecordReader};
use super::{list_shards, split_shards, Dataset, DatasetBuilder};
use crate::configs::DataConfig;
use crate::{Error, Result};

pub const IMAGE_KEY: &str = "image";
pub const CLASS_KEY: &str = "class";

/// Decodes one `tf.train.Example` holding an encoded `image` and its `class`.
pub fn decode_example(payload: &[u8], target_size: usize) -> std::result::Result<(ndarray::Array3<u8>, u32), String> {
    let example = Example::decode(payload)?;
    let encoded = example.bytes(IMAGE_KEY).ok_or("no image feature")?;
    let label = example.int64(CLASS_KEY).ok_or("no class feature")?;
    let label = u32::try_from(label).map_err(|_| format!("class {label} is not a valid id"))?;
    let img = image::load_from_memory(encoded).map_err(|e| e.to_string())?.to_rgb8();
    if img.width() as usize != target_size || img.height() as usize != target_size {
        return Err(format!(
            "image is {}x{}, expected {target_size}x{target_size}",
            img.width(),
            img.height()
        ));
    }
    Ok((rgb_to_array(&img), label))
}

/// Reads every record of one shard into memory.
pub fn load_shard(path: &Path, target_size: usize) -> Result<LabeledImages> {
    let reader = TfRecordReader::new(BufReader::new(File::open(path)?));
    let mut images = Vec::new();
    let mut labels = Vec::new();
    for record in reader {
        let record_err = |reason: String| Error::Record { path: path.to_path_buf(), reason };
        let payload = record.map_err(record_err)?;
        let (img, label) = decode_example(&payload, target_size).map_err(record_err)?;
        images.push(img);
        labels.push(label);
    }
    debug!("{} records in {}", labels.len(), path.display());
    if labels.is_empty() {
        return Ok(LabeledImages::empty(target_size));
    }
    LabeledImages::from_images(&images, labels)
}

pub fn load_shards(paths: &[PathBuf], target_size: usize) -> Result<LabeledImages> {
    let parts = paths
        .iter()
        .map(|p| load_shard(p, target_size))
        .collect::<Result<Vec<_>>>()?;
    let data = LabeledImages::concat(&parts)?;
    info!("loaded {} images from {} shards", data.len(), paths.len());
    Ok(data)
}

/// Main configuration parameters for the sharded record splits.
#[derive(Debug, Clone)]
pub struct ShardParams {
    pub training: Vec<PathBuf>,
    pub validation: Vec<PathBuf>,
    pub target_size: usize,
    pub batch_size: usize,
    pub shuffle_seed: Option<u64>,
}

impl ShardParams {
    pub fn from_config(config: &DataConfig) -> Result<Self> {
        let shards = list_shards(&config.data_path, &config.extension)?;
        let (training, validation) = split_shards(&shards, config.validation_split)?;
        Ok(ShardParams {
            training,
            validation,
            target_size: config.target_size,
            batch_size: config.batch_size,
            shuffle_seed: config.shuffle_seed,
        })
    }
}

impl DatasetBuilder for ShardParams {
    type Dataset = RecordDataset;

    fn build_train(&self) -> Result<Self::Dataset> {
        let data = load_shards(&self.training, self.target_size)?;
        RecordDataset::new(data, self.batch_size, self.shuffle_seed)
    }

    fn build_test(&self) -> Option<Result<Self::Dataset>> {
        if self.validation.is_empty() {
            return None;
        }
        Some(
            load_shards(&self.validation, self.target_size)
                .and_then(|data| RecordDataset::new(data, self.batch_size, self.shuffle_seed)),
        )
    }
}

/// All images of a split held in memory, served in batches of a fixed size.
/// The last incomplete batch is dropped.
pub struct RecordDataset {
    data: LabeledImages,
    order: Vec<usize>,
    idx: usize,
    batch_size: usize,
    rng: Option<StdRng>,
}

impl RecordDataset {
    /// With a seed the order is shuffled once up front and on every `shuffle`.
    pub fn new(data: LabeledImages, batch_size: usize, seed: Option<u64>) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::invalid("batch_size", 0, "batch size cannot be zero"));
        }
        let order = (0..data.len()).collect();
        let mut dataset = RecordDataset {
            data,
            order,
            idx: 0,
            batch_size,
            rng: seed.map(StdRng::seed_from_u64),
        };
        if dataset.rng.is_some() {
            dataset.shuffle();
        }
        Ok(dataset)
    }

    pub fn data(&self) -> &LabeledImages {
        &self.data
    }

    pub fn into_inner(self) -> LabeledImages {
        self.data
    }

    pub fn num_batches(&self) -> usize {
        self.order.len() / self.batch_size
    }
}

impl Dataset for RecordDataset {
    type DataPoint = LabeledImages;

    fn next(&mut self) -> Option<Self::DataPoint> {
        if self.idx + self.batch_size > self.order.len() {
            return None;
        }
        let batch = self.data.select(&self.order[self.idx..self.idx + self.batch_size]);
        self.idx += self.batch_size;
        Some(batch)
    }

    fn reset(&mut self) {
        self.idx = 0;
    }

    fn shuffle(&mut self) {
        match &mut self.rng {
            Some(rng) => self.order.shuffle(rng),
            None => self.order.shuffle(&mut rand::thread_rng()),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::datasets::take_batches;
    use crate::datasets::tfrecord::{write_record, Feature};
    use image::{ImageOutputFormat, RgbImage};
    use std::io::{Cursor, Write};

    pub(crate) fn encode_png(img: &RgbImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageOutputFormat::Png).unwrap();
        buf.into_inner()
    }

    pub(crate) fn write_shard(path: &Path, samples: &[(u8, u32)], side: u32) {
        let mut file = File::create(path).unwrap();
        for &(value, label) in samples {
            let img = RgbImage::from_pixel(side, side, image::Rgb([value, value / 2, 255 - value]));
            let mut example = Example::default();
            example.features.insert(IMAGE_KEY.into(), Feature::Bytes(vec![encode_png(&img)]));
            example.features.insert(CLASS_KEY.into(), Feature::Int64(vec![label as i64]));
            write_record(&mut file, &example.encode()).unwrap();
        }
        file.flush().unwrap();
    }

    #[test]
    fn reads_shards() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(&dir.path().join("a.tfrec"), &[(10, 0), (20, 1)], 4);
        write_shard(&dir.path().join("b.tfrec"), &[(30, 2)], 4);
        let shards = list_shards(dir.path(), "tfrec").unwrap();
        let data = load_shards(&shards, 4).unwrap();
        assert_eq!(data.labels, vec![0, 1, 2]);
        assert_eq!(data.size(), [4, 4]);
        assert_eq!(data.images[[1, 3, 3, 0]], 20);
        assert_eq!(data.images[[2, 0, 0, 2]], 225);
    }

    #[test]
    fn wrong_size_is_a_record_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tfrec");
        write_shard(&path, &[(10, 0)], 5);
        assert!(matches!(load_shard(&path, 4), Err(Error::Record { .. })));
    }

    #[test]
    fn batches_drop_the_remainder() {
        let images = ndarray::Array4::from_shape_fn((7, 1, 1, 3), |(i, ..)| i as u8);
        let data = LabeledImages::new(images, (0..7).collect()).unwrap();
        let mut ds = RecordDataset::new(data, 3, None).unwrap();
        assert_eq!(ds.num_batches(), 2);
        let first = ds.next().unwrap();
        assert_eq!(first.labels, vec![0, 1, 2]);
        assert!(ds.next().is_some());
        assert!(ds.next().is_none());
        ds.reset();
        let all = take_batches(&mut ds, None).unwrap();
        assert_eq!(all.len(), 6);
        ds.reset();
        assert_eq!(take_batches(&mut ds, Some(1)).unwrap().len(), 3);
    }

    #[test]
    fn seeded_shuffle_is_reproducible() {
        let images = ndarray::Array4::<u8>::zeros((20, 1, 1, 3));
        let make = || {
            let data = LabeledImages::new(images.clone(), (0..20).collect()).unwrap();
            RecordDataset::new(data, 5, Some(7)).unwrap()
        };
        let (mut a, mut b) = (make(), make());
        assert_eq!(a.next().unwrap().labels, b.next().unwrap().labels);
        let data = LabeledImages::new(images.clone(), (0..20).collect()).unwrap();
        assert!(RecordDataset::new(data, 0, None).is_err());
    }
}
