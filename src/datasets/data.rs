/////////////////////////////////////////////////////////////////////////////////////////
/// The data types that the datasets output and the model and sampler consume.
use image::RgbImage;
use ndarray::prelude::*;

use crate::{Error, Result};

/// Images of shape NHWC with values in [0, 255] and the class id of each image.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledImages {
    pub images: Array4<u8>,
    pub labels: Vec<u32>,
}

impl LabeledImages {
    pub fn new(images: Array4<u8>, labels: Vec<u32>) -> Result<Self> {
        if images.len_of(Axis(0)) != labels.len() {
            return Err(Error::shape(
                format!("{} labels", images.len_of(Axis(0))),
                format!("{} labels", labels.len()),
            ));
        }
        if images.len_of(Axis(3)) != 3 {
            return Err(Error::shape("3 channels", images.dim()));
        }
        Ok(LabeledImages { images, labels })
    }

    pub fn empty(side: usize) -> Self {
        LabeledImages {
            images: Array4::zeros((0, side, side, 3)),
            labels: Vec::new(),
        }
    }

    /// Stacks equally sized HWC images along a new batch axis.
    pub fn from_images(images: &[Array3<u8>], labels: Vec<u32>) -> Result<Self> {
        let stacked = stack_images(images)?;
        Self::new(stacked, labels)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// (height, width) of every image
    pub fn size(&self) -> [usize; 2] {
        let shape = self.images.dim();
        [shape.1, shape.2]
    }

    pub fn select(&self, indices: &[usize]) -> LabeledImages {
        LabeledImages {
            images: self.images.select(Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }

    /// Keeps the first `n` samples.
    pub fn truncate(&mut self, n: usize) {
        if n >= self.len() {
            return;
        }
        self.images = self.images.slice(s![..n, .., .., ..]).to_owned();
        self.labels.truncate(n);
    }

    /// Keeps only samples whose label is listed, labels are left untouched.
    pub fn retain_classes(&self, classes: &[u32]) -> LabeledImages {
        let keep: Vec<usize> = self
            .labels
            .iter()
            .enumerate()
            .filter(|(_, l)| classes.contains(l))
            .map(|(i, _)| i)
            .collect();
        self.select(&keep)
    }

    pub fn concat(parts: &[LabeledImages]) -> Result<LabeledImages> {
        let first = match parts.first() {
            Some(p) => p,
            None => return Ok(LabeledImages::empty(0)),
        };
        let size = first.size();
        if let Some(bad) = parts.iter().find(|p| p.size() != size) {
            return Err(Error::shape(size, bad.size()));
        }
        let views: Vec<_> = parts.iter().map(|p| p.images.view()).collect();
        let images = ndarray::concatenate(Axis(0), &views)?;
        let labels = parts.iter().flat_map(|p| p.labels.iter().copied()).collect();
        Ok(LabeledImages { images, labels })
    }

    /// The selected images as f32, still in [0, 255].
    pub fn images_f32(&self, indices: &[usize]) -> Array4<f32> {
        self.images.select(Axis(0), indices).mapv(f32::from)
    }

    pub fn all_f32(&self) -> Array4<f32> {
        self.images.mapv(f32::from)
    }

    /// Number of samples per class id in `0..num_classes`.
    pub fn class_counts(&self, num_classes: usize) -> Vec<usize> {
        let mut counts = vec![0; num_classes];
        for &l in &self.labels {
            if let Some(c) = counts.get_mut(l as usize) {
                *c += 1;
            }
        }
        counts
    }
}

/// Immutable mapping from class id to the ordered sample indices with that label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassIndex {
    groups: Vec<Vec<usize>>,
}

impl ClassIndex {
    pub fn new(labels: &[u32], num_classes: usize) -> Result<Self> {
        let mut groups = vec![Vec::new(); num_classes];
        for (i, &label) in labels.iter().enumerate() {
            groups
                .get_mut(label as usize)
                .ok_or(Error::UnknownLabel { label, num_classes })?
                .push(i);
        }
        Ok(ClassIndex { groups })
    }

    pub fn num_classes(&self) -> usize {
        self.groups.len()
    }

    pub fn get(&self, class: u32) -> &[usize] {
        self.groups.get(class as usize).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn counts(&self) -> Vec<usize> {
        self.groups.iter().map(|g| g.len()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &[usize])> {
        self.groups
            .iter()
            .enumerate()
            .map(|(c, g)| (c as u32, g.as_slice()))
    }
}

pub fn rgb_to_array(img: &RgbImage) -> Array3<u8> {
    let (w, h) = img.dimensions();
    // the raw buffer of an RgbImage is row major HWC
    Array3::from_shape_vec((h as usize, w as usize, 3), img.as_raw().clone())
        .unwrap_or_else(|_| Array3::zeros((h as usize, w as usize, 3)))
}

/// Assumes that all the 3d arrays have the same size, this function
/// stacks all the images in the first dimension. [H, W, C] -> [B, H, W, C]
pub fn stack_images(imgs: &[Array3<u8>]) -> Result<Array4<u8>> {
    let hwc = match imgs.first() {
        Some(img) => img.dim(),
        None => return Ok(Array4::zeros((0, 0, 0, 3))),
    };
    let mut out = Array4::<u8>::zeros((imgs.len(), hwc.0, hwc.1, hwc.2));
    for (i, img) in imgs.iter().enumerate() {
        if img.dim() != hwc {
            return Err(Error::shape(hwc, img.dim()));
        }
        out.slice_mut(s![i, .., .., ..]).assign(img);
    }
    Ok(out)
}
