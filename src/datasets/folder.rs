use std::path::{Path, PathBuf};

use anyhow::Context;
use image::imageops::FilterType;
use image::io::Reader as ImageReader;
use ndarray::prelude::*;
use tracing::{info, warn};

use super::data::{rgb_to_array, LabeledImages};
use super::records::RecordDataset;
use super::DatasetBuilder;
use crate::{Error, Result};

/// Reads an image file, resized to `target_size` x `target_size` RGB.
pub fn load_image_file(path: &Path, target_size: usize) -> Result<Array3<u8>> {
    let img = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    let side = target_size as u32;
    let img = if img.width() != side || img.height() != side {
        img.resize_exact(side, side, FilterType::Triangle)
    } else {
        img
    };
    Ok(rgb_to_array(&img.to_rgb8()))
}

/// Image files directly under `dir` with one of the given extensions, sorted.
pub fn list_images(dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = dir
        .read_dir()?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .map_or(false, |e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// The class name a sample file was labeled with, `marsh_IMG_0001.jpg` -> `marsh`.
pub fn class_from_file_name(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    name.split("_IMG").next().filter(|_| name.contains("_IMG"))
}

/// `<root>/<class id>/<image>` folders, split into `training/` and `testing/`.
#[derive(Debug, Clone)]
pub struct FolderParams {
    pub path: PathBuf,
    pub target_size: usize,
    pub batch_size: usize,
    pub shuffle_seed: Option<u64>,
}

impl FolderParams {
    fn read_subdirs(dir: &Path) -> anyhow::Result<Vec<(u32, PathBuf)>> {
        let mut correct_paths = Vec::<(u32, PathBuf)>::new();
        for entry in dir.read_dir().with_context(|| format!("No dir {} exists", dir.display()))? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            let label = name
                .to_str()
                .and_then(|s| s.parse::<u32>().ok())
                .with_context(|| format!("Dir {} is not a numeral", entry.path().display()))?;
            for file in entry.path().read_dir()?.flatten() {
                correct_paths.push((label, file.path()));
            }
        }
        correct_paths.sort();
        Ok(correct_paths)
    }

    fn load(&self, split: &str) -> Result<LabeledImages> {
        let dir = self.path.join(split);
        let paths = Self::read_subdirs(&dir).map_err(|e| Error::Record {
            path: dir.clone(),
            reason: format!("{e:#}"),
        })?;
        let mut images = Vec::with_capacity(paths.len());
        let mut labels = Vec::with_capacity(paths.len());
        for (label, path) in paths {
            match load_image_file(&path, self.target_size) {
                Ok(img) => {
                    images.push(img);
                    labels.push(label);
                }
                Err(e) => warn!("skipping {}: {}", path.display(), e),
            }
        }
        info!("loaded {} images from {}", labels.len(), dir.display());
        if labels.is_empty() {
            return Ok(LabeledImages::empty(self.target_size));
        }
        LabeledImages::from_images(&images, labels)
    }
}

impl DatasetBuilder for FolderParams {
    type Dataset = RecordDataset;

    fn build_train(&self) -> Result<Self::Dataset> {
        RecordDataset::new(self.load("training")?, self.batch_size, self.shuffle_seed)
    }

    fn build_test(&self) -> Option<Result<Self::Dataset>> {
        if !self.path.join("testing").exists() {
            return None;
        }
        Some(
            self.load("testing")
                .and_then(|d| RecordDataset::new(d, self.batch_size, self.shuffle_seed)),
        )
    }
}
