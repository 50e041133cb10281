use ndarray::prelude::*;

use crate::nn::ops::{argmax_rows, dmatmul, l2_normalize, softmax_cross_entropy};
use crate::nn::Float;

/// Metric learning objective over one anchor/positive batch.
///
/// Row i of `anchors` and `positives` hold the same class. Both are scaled to
/// unit length, their similarity matrix divided by `temperature` is treated as
/// logits whose target for row i is column i. Returns the mean cross entropy,
/// the fraction of rows whose largest logit is on the diagonal and a closure
/// mapping the loss gradient to the gradients of anchors and positives.
pub fn pair_loss<T: Float>(
    anchors: &Array2<T>,
    positives: &Array2<T>,
    temperature: T,
) -> (T, T, impl Fn(T) -> (Array2<T>, Array2<T>)) {
    let (na, dfa) = l2_normalize(anchors);
    let (np, dfp) = l2_normalize(positives);
    let npt = np.t().to_owned();
    let logits = na.dot(&npt).mapv_into(|v| v / temperature);

    let targets: Vec<usize> = (0..logits.nrows()).collect();
    let (loss, dfs) = softmax_cross_entropy(&logits, &targets);
    let hits = argmax_rows(&logits)
        .iter()
        .enumerate()
        .filter(|&(i, &j)| i == j)
        .count();
    let rows = T::from_usize(targets.len().max(1)).unwrap_or_else(T::one);
    let accuracy = T::from_usize(hits).unwrap_or_else(T::zero) / rows;

    let back_fn = move |grad: T| {
        let ds = dfs(grad).mapv_into(|v| v / temperature);
        let (dna, dnpt) = dmatmul(&ds, &na, &npt);
        (dfa(&dna), dfp(&dnpt.reversed_axes()))
    };
    (loss, accuracy, back_fn)
}
