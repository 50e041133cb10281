use ndarray::prelude::*;
use ndarray::Zip;

use super::Float;

/// Gradients of y = a.dot(b) with respect to a and b.
pub fn dmatmul<T: Float>(grad: &Array2<T>, a: &Array2<T>, b: &Array2<T>) -> (Array2<T>, Array2<T>) {
    let db = a.t().dot(grad);
    let da = grad.dot(&b.t());
    (da, db)
}

pub fn relu<T: Float>(x: &Array2<T>) -> (Array2<T>, impl Fn(&Array2<T>) -> Array2<T>) {
    let y = x.mapv(|v| v.max(T::zero()));
    let gate = x.mapv(|v| if v > T::zero() { T::one() } else { T::zero() });
    let back_fn = move |grad: &Array2<T>| grad * &gate;
    (y, back_fn)
}

/// Squared norms below this are clamped, as `tf.math.l2_normalize` does.
const NORM_EPS: f64 = 1e-12;

/// Scales every row of x to unit euclidean length.
pub fn l2_normalize<T: Float>(x: &Array2<T>) -> (Array2<T>, impl Fn(&Array2<T>) -> Array2<T>) {
    let eps = T::from_f64(NORM_EPS).unwrap_or_else(T::zero);
    // per row 1 / max(|x|, sqrt(eps)) and whether the clamp was hit
    let scale: Vec<(T, bool)> = x
        .outer_iter()
        .map(|row| {
            let sq = row.dot(&row);
            if sq > eps {
                (T::one() / sq.sqrt(), false)
            } else {
                (T::one() / eps.sqrt(), true)
            }
        })
        .collect();
    let mut y = x.clone();
    for (mut row, &(inv, _)) in y.outer_iter_mut().zip(&scale) {
        row.mapv_inplace(|v| v * inv);
    }
    let n = y.clone();
    let back_fn = move |grad: &Array2<T>| {
        let mut dx = grad.clone();
        for (((mut dx, n), g), &(inv, clamped)) in dx
            .outer_iter_mut()
            .zip(n.outer_iter())
            .zip(grad.outer_iter())
            .zip(&scale)
        {
            if clamped {
                dx.mapv_inplace(|v| v * inv);
            } else {
                // (g - n (n . g)) / |x|
                let proj = n.dot(&g);
                Zip::from(&mut dx)
                    .and(&n)
                    .and(&g)
                    .for_each(|d, &n, &g| *d = (g - n * proj) * inv);
            }
        }
        dx
    };
    (y, back_fn)
}

/// Row wise softmax, shifted by the row maximum.
pub fn softmax<T: Float>(x: &Array2<T>) -> Array2<T> {
    let mut y = x.clone();
    for mut row in y.outer_iter_mut() {
        let max = row.fold(T::neg_infinity(), |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    y
}

/// Mean over rows of `-log softmax(logits)[row, target]`.
///
/// The backward closure takes the gradient of the scalar loss.
pub fn softmax_cross_entropy<T: Float>(
    logits: &Array2<T>,
    targets: &[usize],
) -> (T, impl Fn(T) -> Array2<T>) {
    let probs = softmax(logits);
    let n = T::from_usize(logits.nrows().max(1)).unwrap_or_else(T::one);
    let loss = targets
        .iter()
        .enumerate()
        .map(|(i, &t)| -probs[[i, t]].ln())
        .fold(T::zero(), |a, b| a + b)
        / n;
    let targets = targets.to_vec();
    let back_fn = move |grad: T| {
        let mut d = probs.clone();
        for (i, &t) in targets.iter().enumerate() {
            d[[i, t]] = d[[i, t]] - T::one();
        }
        d.mapv_inplace(|v| v * grad / n);
        d
    };
    (loss, back_fn)
}

/// Index of the largest entry of every row, the first one on ties.
pub fn argmax_rows<T: Float>(x: &Array2<T>) -> Vec<usize> {
    x.outer_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, T::neg_infinity()), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
                .0
        })
        .collect()
}

/// Non overlapping `pool` x `pool` average pooling of NHWC images, trailing
/// rows and columns that do not fill a window are dropped.
pub fn avg_pool<T: Float>(x: ArrayView4<T>, pool: usize) -> Array4<T> {
    let (b, h, w, c) = x.dim();
    let pool = pool.max(1);
    let (oh, ow) = (h / pool, w / pool);
    let area = T::from_usize(pool * pool).unwrap_or_else(T::one);
    let mut out = Array4::<T>::zeros((b, oh, ow, c));
    for i in 0..oh {
        for j in 0..ow {
            let window = x.slice(s![.., i * pool..(i + 1) * pool, j * pool..(j + 1) * pool, ..]);
            let mut cell = out.slice_mut(s![.., i, j, ..]);
            for row in window.axis_iter(Axis(1)) {
                for px in row.axis_iter(Axis(1)) {
                    cell += &px;
                }
            }
            cell.mapv_inplace(|v| v / area);
        }
    }
    out
}
