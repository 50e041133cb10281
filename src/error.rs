use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
    #[error(transparent)]
    Snapshot(#[from] bincode::Error),
    #[error(transparent)]
    ClassNames(#[from] serde_json::Error),
    #[error("malformed record in {path:?}: {reason}")]
    Record { path: PathBuf, reason: String },
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },
    #[error("invalid parameter {name} = {value} ({reason})")]
    InvalidParameter {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("class {class} has {count} samples, at least 2 are needed to draw anchor/positive pairs")]
    InsufficientSamples { class: u32, count: usize },
    #[error("label {label} is outside of the {num_classes} known classes")]
    UnknownLabel { label: u32, num_classes: usize },
    #[error("training diverged at epoch {epoch}: loss {loss}")]
    Divergence { epoch: usize, loss: f32 },
    #[error("no files with extension {extension:?} found in {dir:?}")]
    NoShards { dir: PathBuf, extension: String },
    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },
    #[error(transparent)]
    Archive(#[from] zip::result::ZipError),
}

impl Error {
    pub(crate) fn invalid(name: &'static str, value: impl ToString, reason: impl Into<String>) -> Self {
        Error::InvalidParameter {
            name,
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(expected: impl std::fmt::Debug, got: impl std::fmt::Debug) -> Self {
        Error::ShapeMismatch {
            expected: format!("{:?}", expected),
            got: format!("{:?}", got),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
