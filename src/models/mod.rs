use ndarray::prelude::*;

use crate::nn::ops::l2_normalize;
use crate::Result;

pub mod embedding;
pub mod loss;
pub mod trainer;

pub use embedding::EmbeddingModel;
pub use trainer::{fit_or_load, EarlyStopping, History, ModelCheckpoint, TrainRecv, Trainer};

/// Anything that maps NHWC images in [0, 255] to fixed length vectors.
pub trait Embed {
    fn embed_dim(&self) -> usize;

    /// One row per image.
    fn embed(&self, images: ArrayView4<u8>) -> Result<Array2<f32>>;

    /// Embeddings scaled to unit length, what the classifier compares.
    fn embed_normalized(&self, images: ArrayView4<u8>) -> Result<Array2<f32>> {
        let (normalized, _) = l2_normalize(&self.embed(images)?);
        Ok(normalized)
    }
}
