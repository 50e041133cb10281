//! Embedding + k-nearest-neighbour classification of coastal imagery.
//!
//! The pipeline loads sharded labeled images into memory, trains a small
//! embedding network on anchor/positive pairs drawn per class, fits a k-NN
//! classifier on the normalized embeddings and reports scores and confusion
//! matrices.

use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{de::DeserializeOwned, Serialize};

pub mod configs;
pub mod datasets;
pub mod error;
pub mod evaluation;
pub mod knn;
pub mod models;
pub mod nn;
pub mod pipeline;

pub use error::{Error, Result};

/// Serialization of the configuration structs to and from RON.
pub trait Configure: Sized {
    fn config(&self) -> String;
    fn load_config(&mut self, config: &str) -> anyhow::Result<()>;

    fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self>
    where
        Self: Default,
    {
        let path = path.as_ref();
        let serialized = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut config = Self::default();
        config.load_config(&serialized)?;
        Ok(config)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, self.config())
            .with_context(|| format!("Failed to write config {}", path.display()))
    }
}

impl<T: Serialize + DeserializeOwned> Configure for T {
    fn config(&self) -> String {
        let pretty = ron::ser::PrettyConfig::new().struct_names(true);
        // serializing plain config structs into a String cannot fail
        ron::ser::to_string_pretty(self, pretty).unwrap_or_default()
    }

    fn load_config(&mut self, config: &str) -> anyhow::Result<()> {
        *self = ron::from_str(config).context(format!("Failed to load config {}", config))?;
        Ok(())
    }
}
