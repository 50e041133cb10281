//! Brute force k-nearest-neighbour classification of embeddings.
use std::cmp::Ordering;

use ndarray::prelude::*;
use tracing::info;

use crate::configs::{KnnConfig, Weights};
use crate::models::Embed;
use crate::{Error, Result};

/// Fitted index over the leading `dims_used` columns of the training embeddings.
#[derive(Debug, Clone)]
pub struct KnnClassifier {
    k: usize,
    weights: Weights,
    points: Array2<f32>,
    labels: Vec<u32>,
    num_classes: usize,
}

fn by_distance(a: &(f32, usize), b: &(f32, usize)) -> Ordering {
    a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
}

impl KnnClassifier {
    /// `num_classes` is one more than the largest label.
    pub fn fit(config: &KnnConfig, embeddings: ArrayView2<f32>, labels: &[u32]) -> Result<Self> {
        let (n, d) = embeddings.dim();
        if n == 0 {
            return Err(Error::invalid("embeddings", 0, "cannot fit on an empty set"));
        }
        if n != labels.len() {
            return Err(Error::shape(format!("{n} labels"), format!("{} labels", labels.len())));
        }
        let dims_used = config.dims_used.unwrap_or(d);
        if dims_used == 0 || dims_used > d {
            return Err(Error::invalid("dims_used", dims_used, format!("must be in 1..={d}")));
        }
        if config.k == 0 || config.k > n {
            return Err(Error::invalid("k", config.k, format!("must be in 1..={n}")));
        }
        let num_classes = labels.iter().max().map_or(0, |&m| m as usize + 1);
        info!("fit {}-NN on {n} embeddings, {dims_used} of {d} dims", config.k);
        Ok(KnnClassifier {
            k: config.k,
            weights: config.weights,
            points: embeddings.slice(s![.., ..dims_used]).to_owned(),
            labels: labels.to_vec(),
            num_classes,
        })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn dims_used(&self) -> usize {
        self.points.ncols()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn leading<'b>(&self, x: ArrayView2<'b, f32>) -> Result<ArrayView2<'b, f32>> {
        if x.ncols() < self.dims_used() {
            return Err(Error::shape(
                format!("at least {} dims", self.dims_used()),
                format!("{} dims", x.ncols()),
            ));
        }
        Ok(x.slice_move(s![.., ..self.dims_used()]))
    }

    /// (distance, index) of the k closest points, nearest first, ties to the lower index.
    pub fn neighbors(&self, query: ArrayView1<f32>) -> Vec<(f32, usize)> {
        let mut dists: Vec<(f32, usize)> = self
            .points
            .outer_iter()
            .enumerate()
            .map(|(i, p)| {
                let sq: f32 = p.iter().zip(query.iter()).map(|(a, b)| (a - b) * (a - b)).sum();
                (sq.sqrt(), i)
            })
            .collect();
        if self.k < dists.len() {
            dists.select_nth_unstable_by(self.k - 1, by_distance);
            dists.truncate(self.k);
        }
        dists.sort_by(by_distance);
        dists
    }

    fn votes(&self, neighbors: &[(f32, usize)]) -> Array1<f64> {
        let mut votes = Array1::<f64>::zeros(self.num_classes);
        let exact = neighbors.iter().any(|&(d, _)| d == 0.0);
        for &(d, i) in neighbors {
            let w = match self.weights {
                Weights::Uniform => 1.0,
                // points at distance zero take all the weight
                Weights::Distance if exact => (d == 0.0) as u8 as f64,
                Weights::Distance => 1.0 / d as f64,
            };
            votes[self.labels[i] as usize] += w;
        }
        let total = votes.sum();
        if total > 0.0 {
            votes /= total;
        }
        votes
    }

    /// Per row the (weighted) vote fraction of every class.
    pub fn predict_proba(&self, x: ArrayView2<f32>) -> Result<Array2<f64>> {
        let x = self.leading(x)?;
        let mut proba = Array2::zeros((x.nrows(), self.num_classes));
        for (query, mut row) in x.outer_iter().zip(proba.outer_iter_mut()) {
            row.assign(&self.votes(&self.neighbors(query)));
        }
        Ok(proba)
    }

    /// Majority class of the k neighbours, ties to the lowest class id.
    pub fn predict(&self, x: ArrayView2<f32>) -> Result<Vec<u32>> {
        Ok(self.predict_proba(x)?.outer_iter().map(|row| argmax(row) as u32).collect())
    }

    /// Fraction of rows predicted as their label.
    pub fn score(&self, x: ArrayView2<f32>, labels: &[u32]) -> Result<f64> {
        if x.nrows() != labels.len() {
            return Err(Error::shape(
                format!("{} labels", x.nrows()),
                format!("{} labels", labels.len()),
            ));
        }
        if labels.is_empty() {
            return Err(Error::invalid("labels", 0, "cannot score an empty set"));
        }
        let pred = self.predict(x)?;
        let correct = pred.iter().zip(labels).filter(|(p, l)| p == l).count();
        Ok(correct as f64 / labels.len() as f64)
    }
}

/// Index of the first maximum.
pub fn argmax(row: ArrayView1<f64>) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best
}

/// Embeds and normalizes `images`, then fits a classifier on them.
pub fn fit_knn_to_embeddings<E: Embed>(
    model: &E,
    images: ArrayView4<u8>,
    labels: &[u32],
    config: &KnnConfig,
) -> Result<KnnClassifier> {
    let embeddings = model.embed_normalized(images)?;
    KnnClassifier::fit(config, embeddings.view(), labels)
}

#[cfg(test)]
mod test {
    use super::*;

    fn config(k: usize, weights: Weights) -> KnnConfig {
        KnnConfig {
            k,
            weights,
            dims_used: None,
        }
    }

    fn points() -> (Array2<f32>, Vec<u32>) {
        let x = arr2(&[
            [0.0, 0.0],
            [0.1, 0.0],
            [0.0, 0.1],
            [5.0, 5.0],
            [5.1, 5.0],
            [9.0, 0.0],
        ]);
        (x, vec![0, 0, 0, 1, 1, 2])
    }

    #[test]
    fn majority_vote() {
        let (x, y) = points();
        let knn = KnnClassifier::fit(&config(3, Weights::Uniform), x.view(), &y).unwrap();
        assert_eq!(knn.num_classes(), 3);
        let q = arr2(&[[0.05, 0.05], [4.9, 5.0], [8.0, 0.5]]);
        assert_eq!(knn.predict(q.view()).unwrap(), vec![0, 1, 1]);
        assert_eq!(knn.score(x.view(), &y).unwrap(), 5.0 / 6.0);
    }

    #[test]
    fn proba_argmax_is_the_prediction() {
        let (x, y) = points();
        for weights in [Weights::Uniform, Weights::Distance] {
            for k in 1..=6 {
                let knn = KnnClassifier::fit(&config(k, weights), x.view(), &y).unwrap();
                let q = Array2::from_shape_fn((25, 2), |(i, j)| ((i * 7 + j * 3) % 11) as f32 - 1.0);
                let proba = knn.predict_proba(q.view()).unwrap();
                let pred = knn.predict(q.view()).unwrap();
                for (row, p) in proba.outer_iter().zip(&pred) {
                    assert_eq!(argmax(row) as u32, *p);
                    assert!((row.sum() - 1.0).abs() < 1e-9);
                }
            }
        }
    }

    #[test]
    fn ties_go_to_the_lowest_class() {
        let x = arr2(&[[1.0f32], [-1.0]]);
        let knn = KnnClassifier::fit(&config(2, Weights::Uniform), x.view(), &[1, 0]).unwrap();
        assert_eq!(knn.predict(arr2(&[[0.0f32]]).view()).unwrap(), vec![0]);
        let proba = knn.predict_proba(arr2(&[[0.0f32]]).view()).unwrap();
        assert_eq!(proba, arr2(&[[0.5, 0.5]]));
    }

    #[test]
    fn distance_weights_and_exact_matches() {
        let x = arr2(&[[0.0f32], [1.0], [3.0]]);
        let knn = KnnClassifier::fit(&config(3, Weights::Distance), x.view(), &[0, 1, 1]).unwrap();
        // distances 0.5, 0.5, 2.5
        let p = knn.predict_proba(arr2(&[[0.5f32]]).view()).unwrap();
        assert!((p[[0, 0]] - 2.0 / 4.4).abs() < 1e-6);
        let p = knn.predict_proba(arr2(&[[3.0f32]]).view()).unwrap();
        assert_eq!(p, arr2(&[[0.0, 1.0]]));
    }

    #[test]
    fn uses_leading_dims_only() {
        let x = arr2(&[[0.0f32, 100.0], [1.0, 0.0]]);
        let mut c = config(1, Weights::Uniform);
        c.dims_used = Some(1);
        let knn = KnnClassifier::fit(&c, x.view(), &[0, 1]).unwrap();
        assert_eq!(knn.dims_used(), 1);
        assert_eq!(knn.predict(arr2(&[[0.1f32, 0.0]]).view()).unwrap(), vec![0]);
        assert!(knn.predict(arr2(&[[0.1f32]]).view()).is_ok());
        assert!(knn.predict(Array2::<f32>::zeros((1, 0)).view()).is_err());
    }

    #[test]
    fn invalid_fits() {
        let (x, y) = points();
        assert!(KnnClassifier::fit(&config(0, Weights::Uniform), x.view(), &y).is_err());
        assert!(KnnClassifier::fit(&config(7, Weights::Uniform), x.view(), &y).is_err());
        assert!(KnnClassifier::fit(&config(1, Weights::Uniform), x.view(), &y[..2]).is_err());
        let empty = Array2::<f32>::zeros((0, 2));
        assert!(KnnClassifier::fit(&config(1, Weights::Uniform), empty.view(), &[]).is_err());
        let mut c = config(1, Weights::Uniform);
        c.dims_used = Some(3);
        assert!(KnnClassifier::fit(&c, x.view(), &y).is_err());
        c.dims_used = Some(0);
        assert!(KnnClassifier::fit(&c, x.view(), &y).is_err());
        let knn = KnnClassifier::fit(&config(1, Weights::Uniform), x.view(), &y).unwrap();
        assert!(knn.score(x.view(), &y[..3]).is_err());
    }
}
