/// Scoring of a fitted classifier and the text reports of a run.
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::prelude::*;
use tracing::info;

use crate::datasets::ClassNames;
use crate::knn::argmax;
use crate::Result;

pub mod confusion;

pub use confusion::{conf_mat_filesamples, predict_files, ConfusionMatrix, SamplePrediction};

/// `pred:<class of the file name>, est:<predicted class>`
pub fn sample_line(prediction: &SamplePrediction, names: &ClassNames) -> String {
    format!("pred:{}, est:{}", prediction.observed, names.name(prediction.estimated))
}

/// Rows whose largest vote fraction is exactly one, with their predicted class.
pub fn high_confidence(proba: &Array2<f64>) -> (Vec<usize>, Vec<u32>) {
    let mut rows = Vec::new();
    let mut pred = Vec::new();
    for (i, row) in proba.outer_iter().enumerate() {
        let best = argmax(row);
        if row[best] == 1.0 {
            rows.push(i);
            pred.push(best as u32);
        }
    }
    (rows, pred)
}

/// Writes named report files below one directory, `<run>_<name>`.
pub struct ReportWriter {
    dir: PathBuf,
    run_name: String,
}

impl ReportWriter {
    pub fn new(dir: &Path, run_name: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(ReportWriter {
            dir: dir.to_path_buf(),
            run_name: run_name.to_string(),
        })
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}_{}", self.run_name, name))
    }

    pub fn write(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.path(name);
        fs::write(&path, contents)?;
        info!("wrote {}", path.display());
        Ok(path)
    }

    pub fn write_matrix(&self, name: &str, matrix: &Array2<f64>, names: &ClassNames) -> Result<PathBuf> {
        self.write(name, &confusion::to_csv(matrix, names))
    }
}
