/////////////////////////////////////////////////////////////////////////////////////////
/// Summary statistics of a labeled split: class counts, per-class mean and median
/// images, per-channel histograms of the mean image and the variance explained
/// by the leading principal components.
use std::fmt::Write;

use image::RgbImage;
use ndarray::prelude::*;
use tracing::{debug, warn};

use super::{ClassNames, LabeledImages};
use crate::configs::{Bins, StatsConfig};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    pub counts: Vec<usize>,
    /// `counts.len() + 1` bin edges, the last bin is closed on the right.
    pub edges: Vec<f64>,
}

impl Histogram {
    pub fn new(values: &[f64], bins: Bins) -> Result<Self> {
        if values.is_empty() {
            return Err(Error::invalid("values", 0, "histogram of no values"));
        }
        let (mut lo, mut hi) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let n = match bins {
            Bins::Count(0) => return Err(Error::invalid("bins", 0, "need at least one bin")),
            Bins::Count(n) => n,
            Bins::Auto => auto_bins(values, hi - lo),
        };
        if lo == hi {
            lo -= 0.5;
            hi += 0.5;
        }
        let width = (hi - lo) / n as f64;
        let edges: Vec<f64> = (0..=n).map(|i| lo + i as f64 * width).collect();
        let mut counts = vec![0; n];
        for &v in values {
            let bin = (((v - lo) / width) as usize).min(n - 1);
            counts[bin] += 1;
        }
        Ok(Histogram { counts, edges })
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// One `[lo, hi) count` line per bin.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, c) in self.counts.iter().enumerate() {
            let _ = writeln!(out, "[{:.3}, {:.3}) {}", self.edges[i], self.edges[i + 1], c);
        }
        out
    }
}

/// Linear interpolation between the closest ranks of sorted values.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// The larger bin count of the Sturges and Freedman-Diaconis rules.
fn auto_bins(values: &[f64], range: f64) -> usize {
    let n = values.len() as f64;
    let sturges = range / (n.log2() + 1.0);
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let iqr = percentile(&sorted, 0.75) - percentile(&sorted, 0.25);
    let fd = 2.0 * iqr * n.powf(-1.0 / 3.0);
    let width = if fd > 0.0 { fd.min(sturges) } else { sturges };
    if width <= 0.0 {
        return 1;
    }
    ((range / width).ceil() as usize).max(1)
}

/// Pixelwise mean of NHWC images, in [0, 1].
pub fn mean_image(images: ArrayView4<u8>) -> Result<Array3<f32>> {
    images
        .mapv(|x| x as f32 / 255.0)
        .mean_axis(Axis(0))
        .ok_or_else(|| Error::invalid("images", 0, "mean of an empty batch"))
}

/// Pixelwise median of NHWC images, in [0, 1].
pub fn median_image(images: ArrayView4<u8>) -> Result<Array3<f32>> {
    if images.len_of(Axis(0)) == 0 {
        return Err(Error::invalid("images", 0, "median of an empty batch"));
    }
    Ok(images.map_axis(Axis(0), |lane| {
        let mut v: Vec<u8> = lane.to_vec();
        v.sort_unstable();
        let mid = v.len() / 2;
        let m = if v.len() % 2 == 0 {
            (v[mid - 1] as f32 + v[mid] as f32) / 2.0
        } else {
            v[mid] as f32
        };
        m / 255.0
    }))
}

/// Converts an HWC image in [0, 1] back to 8 bit RGB.
pub fn to_rgb_image(img: ArrayView3<f32>) -> RgbImage {
    let (h, w, _) = img.dim();
    RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let px = |c: usize| (img[[y as usize, x as usize, c]].clamp(0.0, 1.0) * 255.0).round() as u8;
        image::Rgb([px(0), px(1), px(2)])
    })
}

/// Rows of the flattened images converted to f32 at a time.
const GRAM_CHUNK: usize = 64;
const JACOBI_SWEEPS: usize = 50;

/// `X X^T` of the flattened images centered on their mean. Its nonzero
/// eigenvalues are those of the scatter matrix `X^T X`.
fn centered_gram(images: ArrayView4<u8>) -> Result<Array2<f64>> {
    let n = images.len_of(Axis(0));
    let images = images.as_standard_layout();
    let d = images.len() / n.max(1);
    let flat = images.view().into_shape((n, d))?;

    let mut mean = Array1::<f64>::zeros(d);
    for row in flat.rows() {
        mean.zip_mut_with(&row, |m, &x| *m += x as f64);
    }
    let mean = mean.mapv(|m| (m / n as f64) as f32);
    let centered = |start: usize, end: usize| {
        let mut rows = flat.slice(s![start..end, ..]).mapv(|x| x as f32);
        rows -= &mean;
        rows
    };

    let mut gram = Array2::<f64>::zeros((n, n));
    for a in (0..n).step_by(GRAM_CHUNK) {
        let a_end = (a + GRAM_CHUNK).min(n);
        let xa = centered(a, a_end);
        for b in (a..n).step_by(GRAM_CHUNK) {
            let b_end = (b + GRAM_CHUNK).min(n);
            let xb = if b == a { None } else { Some(centered(b, b_end)) };
            let block = xa.dot(&xb.as_ref().unwrap_or(&xa).t()).mapv(f64::from);
            gram.slice_mut(s![a..a_end, b..b_end]).assign(&block);
            gram.slice_mut(s![b..b_end, a..a_end]).assign(&block.t());
        }
    }
    Ok(gram)
}

/// Eigenvalues of a symmetric matrix by cyclic Jacobi rotations, largest first.
fn symmetric_eigenvalues(mut a: Array2<f64>) -> Vec<f64> {
    let n = a.nrows();
    let frob = a.iter().map(|x| x * x).sum::<f64>();
    for sweep in 0..JACOBI_SWEEPS {
        let mut off = 0.0;
        for p in 0..n {
            for q in p + 1..n {
                off += a[[p, q]] * a[[p, q]];
            }
        }
        if off <= 1e-24 * frob {
            debug!("jacobi converged after {} sweeps", sweep);
            break;
        }
        for p in 0..n {
            for q in p + 1..n {
                let apq = a[[p, q]];
                if apq == 0.0 {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;
                for k in 0..n {
                    if k == p || k == q {
                        continue;
                    }
                    let (akp, akq) = (a[[k, p]], a[[k, q]]);
                    a[[k, p]] = c * akp - s * akq;
                    a[[p, k]] = a[[k, p]];
                    a[[k, q]] = s * akp + c * akq;
                    a[[q, k]] = a[[k, q]];
                }
                a[[p, p]] -= t * apq;
                a[[q, q]] += t * apq;
                a[[p, q]] = 0.0;
                a[[q, p]] = 0.0;
            }
        }
    }
    let mut eig = a.diag().to_vec();
    eig.sort_by(|x, y| y.total_cmp(x));
    eig
}

/// Fraction of the total variance of the flattened images captured by their
/// leading `components` principal components. `components` is clamped to the
/// number of images.
pub fn explained_variance(images: ArrayView4<u8>, components: usize) -> Result<f64> {
    let n = images.len_of(Axis(0));
    if n < 2 {
        return Err(Error::invalid("images", n, "principal components need at least two images"));
    }
    if components == 0 {
        return Err(Error::invalid("pca_components", 0, "need at least one component"));
    }
    let gram = centered_gram(images)?;
    let total = gram.diag().sum();
    if total <= 0.0 {
        return Ok(1.0);
    }
    let eig = symmetric_eigenvalues(gram);
    let captured: f64 = eig.iter().take(components).map(|e| e.max(0.0)).sum();
    Ok((captured / total).min(1.0))
}

#[derive(Debug, Clone)]
pub struct ClassStats {
    pub class: u32,
    pub name: String,
    pub count: usize,
    pub mean: Array3<f32>,
    pub median: Array3<f32>,
    /// Histograms of the red, green and blue channel of the mean image.
    pub histograms: [Histogram; 3],
}

#[derive(Debug, Clone)]
pub struct DatasetStats {
    pub names: ClassNames,
    pub counts: Vec<usize>,
    /// Classes with fewer than the configured minimum of images.
    pub insufficient: Vec<u32>,
    pub classes: Vec<ClassStats>,
    /// Components used and the variance ratio they explain.
    pub explained_variance: Option<(usize, f64)>,
}

impl DatasetStats {
    pub fn compute(data: &LabeledImages, names: &ClassNames, config: &StatsConfig) -> Result<Self> {
        let num_classes = names
            .len()
            .max(data.labels.iter().max().map_or(0, |&m| m as usize + 1));
        let counts = data.class_counts(num_classes);
        let insufficient: Vec<u32> = counts
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c < config.min_per_class)
            .map(|(i, _)| i as u32)
            .collect();

        let mut classes = Vec::new();
        for (class, &count) in counts.iter().enumerate() {
            let class = class as u32;
            if count == 0 || (config.filter_insufficient && insufficient.contains(&class)) {
                continue;
            }
            let subset = data.retain_classes(&[class]);
            let mean = mean_image(subset.images.view())?;
            let median = median_image(subset.images.view())?;
            let channel = |c: usize| -> Result<Histogram> {
                let values: Vec<f64> = mean.index_axis(Axis(2), c).iter().map(|&v| v as f64).collect();
                Histogram::new(&values, config.bins)
            };
            let histograms = [channel(0)?, channel(1)?, channel(2)?];
            classes.push(ClassStats {
                class,
                name: names.name(class),
                count,
                mean,
                median,
                histograms,
            });
        }
        let explained_variance = match config.pca_components {
            Some(components) => {
                let m = config.pca_samples.min(data.len());
                if m < 2 {
                    warn!("{} images, skipping the principal components", m);
                    None
                } else {
                    let images = data.images.slice(s![..m, .., .., ..]);
                    let ratio = explained_variance(images, components)?;
                    Some((components.min(m), ratio))
                }
            }
            None => None,
        };
        Ok(DatasetStats {
            names: names.clone(),
            counts,
            insufficient,
            classes,
            explained_variance,
        })
    }

    pub fn count_lines(&self) -> Vec<String> {
        self.counts
            .iter()
            .enumerate()
            .map(|(i, c)| format!("Total number of {} (s) in the dataset: {}", self.names.name(i as u32), c))
            .collect()
    }

    pub fn report(&self) -> String {
        let mut out = self.count_lines().join("\n");
        out.push('\n');
        if !self.insufficient.is_empty() {
            let names: Vec<String> = self.insufficient.iter().map(|&c| self.names.name(c)).collect();
            let _ = writeln!(out, "Insufficient classes: {}", names.join(", "));
        }
        if let Some((components, ratio)) = self.explained_variance {
            let _ = writeln!(
                out,
                "Cumulative variance explained by {} principal components: {}",
                components, ratio
            );
        }
        for stats in &self.classes {
            for (channel, hist) in ["red", "green", "blue"].iter().zip(&stats.histograms) {
                let _ = writeln!(out, "Histogram - Mean Pixel Value: {} ({})", stats.name, channel);
                out.push_str(&hist.render());
            }
        }
        out
    }
}
