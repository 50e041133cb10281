use std::fmt::Write;
use std::path::PathBuf;

use ndarray::prelude::*;
use tracing::warn;

use crate::datasets::folder::{class_from_file_name, load_image_file};
use crate::datasets::ClassNames;
use crate::knn::KnnClassifier;
use crate::models::Embed;
use crate::{Error, Result};

/// Counts indexed by (true class, predicted class).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionMatrix {
    counts: Array2<u64>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        ConfusionMatrix {
            counts: Array2::zeros((num_classes, num_classes)),
        }
    }

    pub fn from_predictions(truth: &[u32], pred: &[u32], num_classes: usize) -> Result<Self> {
        if truth.len() != pred.len() {
            return Err(Error::shape(
                format!("{} predictions", truth.len()),
                format!("{} predictions", pred.len()),
            ));
        }
        let mut cm = Self::new(num_classes);
        for (&t, &p) in truth.iter().zip(pred) {
            cm.add(t, p)?;
        }
        Ok(cm)
    }

    pub fn add(&mut self, truth: u32, pred: u32) -> Result<()> {
        let num_classes = self.num_classes();
        for label in [truth, pred] {
            if label as usize >= num_classes {
                return Err(Error::UnknownLabel { label, num_classes });
            }
        }
        self.counts[[truth as usize, pred as usize]] += 1;
        Ok(())
    }

    pub fn num_classes(&self) -> usize {
        self.counts.nrows()
    }

    pub fn counts(&self) -> &Array2<u64> {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.counts.sum()
    }

    /// Number of samples of every true class.
    pub fn row_sums(&self) -> Vec<u64> {
        self.counts.outer_iter().map(|r| r.sum()).collect()
    }

    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.counts.diag().sum() as f64 / total as f64
    }

    /// Every row divided by its sum, rows without samples stay zero.
    pub fn normalized(&self) -> Array2<f64> {
        let mut out = self.counts.mapv(|c| c as f64);
        for mut row in out.outer_iter_mut() {
            let sum = row.sum();
            if sum > 0.0 {
                row /= sum;
            }
        }
        out
    }

    /// Normalized fractions with everything below `thres` set to zero.
    pub fn thresholded(&self, thres: f64) -> Array2<f64> {
        threshold(&self.normalized(), thres)
    }
}

pub fn threshold(matrix: &Array2<f64>, thres: f64) -> Array2<f64> {
    matrix.mapv(|v| if v < thres { 0.0 } else { v })
}

fn label_width(names: &ClassNames, n: usize) -> usize {
    (0..n).map(|i| names.name(i as u32).len()).max().unwrap_or(0).max(5)
}

/// Text table of a matrix, rows are true classes and columns predictions.
pub fn render(matrix: &Array2<f64>, names: &ClassNames) -> String {
    let n = matrix.nrows();
    let width = label_width(names, n);
    let mut out = format!("{:>width$}", "");
    for j in 0..matrix.ncols() {
        let _ = write!(out, " {:>width$}", names.name(j as u32));
    }
    out.push('\n');
    for (i, row) in matrix.outer_iter().enumerate() {
        let _ = write!(out, "{:>width$}", names.name(i as u32));
        for v in row.iter() {
            let _ = write!(out, " {:>width$.2}", v);
        }
        out.push('\n');
    }
    out
}

pub fn to_csv(matrix: &Array2<f64>, names: &ClassNames) -> String {
    let header: Vec<String> = (0..matrix.ncols()).map(|j| names.name(j as u32)).collect();
    let mut out = format!("true\\pred,{}\n", header.join(","));
    for (i, row) in matrix.outer_iter().enumerate() {
        let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        let _ = writeln!(out, "{},{}", names.name(i as u32), cells.join(","));
    }
    out
}

/// The prediction for one loose image file.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplePrediction {
    pub path: PathBuf,
    /// Class named by the file name prefix.
    pub observed: String,
    pub estimated: u32,
}

/// Classifies every file on its own, see `class_from_file_name`.
pub fn predict_files<E: Embed>(
    model: &E,
    knn: &KnnClassifier,
    files: &[PathBuf],
    target_size: usize,
) -> Result<Vec<SamplePrediction>> {
    let mut out = Vec::with_capacity(files.len());
    for path in files {
        let observed = match class_from_file_name(path) {
            Some(name) => name.to_string(),
            None => {
                warn!("{} does not name its class, skipped", path.display());
                continue;
            }
        };
        let img = load_image_file(path, target_size)?.insert_axis(Axis(0));
        let emb = model.embed_normalized(img.view())?;
        let estimated = knn.predict(emb.view())?[0];
        out.push(SamplePrediction {
            path: path.to_path_buf(),
            observed,
            estimated,
        });
    }
    Ok(out)
}

/// Confusion matrix of file predictions whose observed class is a known name.
/// `num_classes` is raised to the number of names when smaller.
pub fn conf_mat_filesamples(
    predictions: &[SamplePrediction],
    names: &ClassNames,
    num_classes: usize,
) -> Result<ConfusionMatrix> {
    let mut cm = ConfusionMatrix::new(num_classes.max(names.len()));
    for p in predictions {
        match names.id(&p.observed) {
            Some(truth) => cm.add(truth, p.estimated)?,
            None => warn!("unknown class {:?} of {}", p.observed, p.path.display()),
        }
    }
    Ok(cm)
}

#[cfg(test)]
mod test {
    use super::*;

    fn names() -> ClassNames {
        ClassNames::new(vec!["marsh".into(), "dev".into(), "other".into()])
    }

    #[test]
    fn rows_sum_to_true_counts() {
        let truth = [0, 0, 1, 2, 2, 2, 1];
        let pred = [0, 1, 1, 2, 0, 2, 1];
        let cm = ConfusionMatrix::from_predictions(&truth, &pred, 3).unwrap();
        assert_eq!(cm.row_sums(), vec![2, 2, 3]);
        assert_eq!(cm.total(), 7);
        assert_eq!(cm.counts()[[2, 0]], 1);
        assert!((cm.accuracy() - 5.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn perfect_predictions_are_diagonal() {
        let truth = [0, 1, 2, 1];
        let cm = ConfusionMatrix::from_predictions(&truth, &truth, 4).unwrap();
        for ((i, j), &c) in cm.counts().indexed_iter() {
            if i != j {
                assert_eq!(c, 0);
            }
        }
        let norm = cm.normalized();
        assert_eq!(norm[[1, 1]], 1.0);
        // class 3 never occurs
        assert_eq!(norm.row(3).sum(), 0.0);
    }

    #[test]
    fn threshold_zeroes_small_fractions() {
        let truth = vec![0; 20];
        let mut pred = vec![0; 18];
        pred.extend([1, 2]);
        let cm = ConfusionMatrix::from_predictions(&truth, &pred, 3).unwrap();
        let t = cm.thresholded(0.1);
        assert_eq!(t[[0, 0]], 0.9);
        assert_eq!(t[[0, 1]], 0.0);
        let kept = cm.thresholded(0.05);
        assert_eq!(kept[[0, 2]], 0.05);
    }

    #[test]
    fn bad_inputs() {
        assert!(ConfusionMatrix::from_predictions(&[0, 1], &[0], 2).is_err());
        assert!(matches!(
            ConfusionMatrix::from_predictions(&[0, 3], &[0, 1], 2),
            Err(Error::UnknownLabel { label: 3, .. })
        ));
    }

    #[test]
    fn rendering() {
        let cm = ConfusionMatrix::from_predictions(&[0, 1, 2], &[0, 1, 1], 3).unwrap();
        let text = render(&cm.normalized(), &names());
        assert_eq!(text.lines().count(), 4);
        assert!(text.lines().next().unwrap().contains("marsh"));
        let csv = to_csv(&cm.normalized(), &names());
        assert!(csv.starts_with("true\\pred,marsh,dev,other\n"));
        assert!(csv.contains("other,0,1,0"));
    }

    #[test]
    fn file_predictions_by_name() {
        let preds = vec![
            SamplePrediction {
                path: "a/marsh_IMG_1.jpg".into(),
                observed: "marsh".into(),
                estimated: 0,
            },
            SamplePrediction {
                path: "a/dev_IMG_2.jpg".into(),
                observed: "dev".into(),
                estimated: 2,
            },
            SamplePrediction {
                path: "a/beach_IMG_3.jpg".into(),
                observed: "beach".into(),
                estimated: 2,
            },
        ];
        let cm = conf_mat_filesamples(&preds, &names(), 3).unwrap();
        assert_eq!(cm.total(), 2);
        assert_eq!(cm.counts()[[1, 2]], 1);
    }

    #[test]
    fn file_predictions_of_unnamed_classes() {
        let preds = vec![SamplePrediction {
            path: "a/marsh_IMG_1.jpg".into(),
            observed: "marsh".into(),
            estimated: 3,
        }];
        let cm = conf_mat_filesamples(&preds, &names(), 4).unwrap();
        assert_eq!(cm.num_classes(), 4);
        assert_eq!(cm.counts()[[0, 3]], 1);
        let csv = to_csv(&cm.normalized(), &names());
        assert!(csv.starts_with("true\\pred,marsh,dev,other,3\n"));

        // fewer classes than names still covers every name
        assert_eq!(conf_mat_filesamples(&[], &names(), 0).unwrap().num_classes(), 3);
    }
}
