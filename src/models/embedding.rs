use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::Embed;
use crate::configs::EmbeddingConfig;
use crate::nn::ops::{avg_pool, relu};
use crate::nn::{Adam, Linear};
use crate::{Error, Result};

/// Images embedded per chunk at inference.
const EMBED_CHUNK: usize = 32;

/// average pool -> flatten -> Linear -> ReLU -> Linear
pub struct EmbeddingModel {
    config: EmbeddingConfig,
    image_size: usize,
    fc1: Linear<f32>,
    fc2: Linear<f32>,
}

/// What a weight file holds.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    config: EmbeddingConfig,
    image_size: usize,
    w1: Array2<f32>,
    b1: Array1<f32>,
    w2: Array2<f32>,
    b2: Array1<f32>,
}

impl EmbeddingModel {
    pub fn new(config: &EmbeddingConfig, image_size: usize, seed: u64) -> Result<Self> {
        if config.pool == 0 || config.pool > image_size {
            return Err(Error::invalid(
                "pool",
                config.pool,
                format!("must be in 1..={image_size}"),
            ));
        }
        if config.hidden_dim == 0 {
            return Err(Error::invalid("hidden_dim", 0, "must be positive"));
        }
        if config.embed_dim == 0 {
            return Err(Error::invalid("embed_dim", 0, "must be positive"));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let input_dim = Self::input_dim_for(config, image_size);
        Ok(EmbeddingModel {
            config: config.clone(),
            image_size,
            fc1: Linear::new(input_dim, config.hidden_dim, &mut rng),
            fc2: Linear::new(config.hidden_dim, config.embed_dim, &mut rng),
        })
    }

    fn input_dim_for(config: &EmbeddingConfig, image_size: usize) -> usize {
        let side = image_size / config.pool;
        side * side * 3
    }

    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn input_dim(&self) -> usize {
        self.fc1.in_dim()
    }

    /// Pooled and flattened images scaled to [0, 1], [B, input_dim].
    pub fn features(&self, images: ArrayView4<f32>) -> Result<Array2<f32>> {
        let (b, h, w, c) = images.dim();
        if h != self.image_size || w != self.image_size || c != 3 {
            return Err(Error::shape(
                (self.image_size, self.image_size, 3),
                (h, w, c),
            ));
        }
        let pooled = avg_pool(images, self.config.pool);
        let flat = pooled.into_shape((b, self.input_dim()))?;
        Ok(flat.mapv_into(|v| v / 255.0))
    }

    pub fn apply(&self, x: &Array2<f32>) -> Array2<f32> {
        let h = self.fc1.apply(x).mapv_into(|v| v.max(0.0));
        self.fc2.apply(&h)
    }

    /// expects x to be [B, input_dim], outputs [B, embed_dim]
    pub fn forward(&self, x: &Array2<f32>) -> (Array2<f32>, impl Fn(&mut Self, &Array2<f32>) -> Array2<f32>) {
        let (h, f1) = self.fc1.forward(x);
        let (h, f2) = relu(&h);
        let (y, f3) = self.fc2.forward(&h);
        let back_fn = move |s: &mut Self, grad: &Array2<f32>| {
            let dh = f3(&mut s.fc2, grad);
            let dh = f2(&dh);
            f1(&mut s.fc1, &dh)
        };
        (y, back_fn)
    }

    /// One optimizer step over the accumulated gradients, which are cleared.
    pub fn update(&mut self, adam: &mut Adam) {
        adam.tick();
        adam.apply(0, &mut self.fc1.w);
        adam.apply(1, &mut self.fc1.b);
        adam.apply(2, &mut self.fc2.w);
        adam.apply(3, &mut self.fc2.b);
    }

    pub fn zero_grad(&mut self) {
        self.fc1.zero_grad();
        self.fc2.zero_grad();
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let snapshot = Snapshot {
            config: self.config.clone(),
            image_size: self.image_size,
            w1: self.fc1.w.w.clone(),
            b1: self.fc1.b.w.clone(),
            w2: self.fc2.w.w.clone(),
            b2: self.fc2.b.w.clone(),
        };
        bincode::serialize_into(BufWriter::new(File::create(path)?), &snapshot)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let s: Snapshot = bincode::deserialize_from(BufReader::new(File::open(path)?))?;
        let input_dim = Self::input_dim_for(&s.config, s.image_size);
        let expected = [
            (input_dim, s.config.hidden_dim),
            (s.config.hidden_dim, s.config.embed_dim),
        ];
        let got = [s.w1.dim(), s.w2.dim()];
        if expected != got || s.b1.len() != s.config.hidden_dim || s.b2.len() != s.config.embed_dim {
            return Err(Error::shape(expected, got));
        }
        info!("loaded weights from {}", path.display());
        Ok(EmbeddingModel {
            config: s.config,
            image_size: s.image_size,
            fc1: Linear::from_weights(s.w1, s.b1),
            fc2: Linear::from_weights(s.w2, s.b2),
        })
    }

    /// Loads a weight file and checks it was trained for this configuration.
    pub fn load_for(path: &Path, config: &EmbeddingConfig, image_size: usize) -> Result<Self> {
        let model = Self::load(path)?;
        if model.config != *config || model.image_size != image_size {
            return Err(Error::shape(
                (config, image_size),
                (&model.config, model.image_size),
            ));
        }
        Ok(model)
    }
}

impl Embed for EmbeddingModel {
    fn embed_dim(&self) -> usize {
        self.config.embed_dim
    }

    fn embed(&self, images: ArrayView4<u8>) -> Result<Array2<f32>> {
        let mut out = Array2::zeros((images.len_of(Axis(0)), self.embed_dim()));
        let chunks = images.axis_chunks_iter(Axis(0), EMBED_CHUNK);
        let rows = out.axis_chunks_iter_mut(Axis(0), EMBED_CHUNK);
        for (chunk, mut rows) in chunks.zip(rows) {
            let x = self.features(chunk.mapv(f32::from).view())?;
            rows.assign(&self.apply(&x));
        }
        Ok(out)
    }
}
