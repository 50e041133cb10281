use anyhow::{Error, Result};
use ndarray::prelude::*;
use ndarray::ShapeBuilder;
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;

use super::Float;

/// |a - b| <= atol + rtol * |b|
pub fn isclose<T: Float>(a: T, b: T, atol: T, rtol: T) -> bool {
    (a - b).abs() <= atol + rtol * b.abs()
}

/// computes the jacobian with finite-difference approximation
/// where f: R^n -> R^m, the jacobian is R^nxm, out_len is m
fn compute_jacobian(
    mut input: Array1<f64>,
    f: impl Fn(&Array1<f64>) -> Array1<f64>,
    epsilon: f64,
    out_len: usize,
) -> Array2<f64> {
    // dy/dx = lim h->0 (f(x + h) - f(x - h)) / (2h)
    let d_eps = 2.0 * epsilon;
    let n = input.len();
    let mut jac = Array2::<f64>::zeros((n, out_len));
    for i in 0..n {
        let old = input[i];
        input[i] = old + epsilon;
        let diff1 = f(&input);
        input[i] = old - epsilon;
        let diff2 = f(&input);

        jac.index_axis_mut(Axis(0), i)
            .iter_mut()
            .zip(diff1.iter())
            .zip(diff2.iter())
            .for_each(|((x, d1), d2)| {
                *x = (*d1 - *d2) / d_eps;
            });
        input[i] = old;
    }
    jac
}

/// Expect that both f and df are pure functions
/// f: R^n -> R^m
/// df: R^m -> R^n, where the first argument is the gradient w.r.t. the image of f
/// grads are considered equal if the analytical gradient x, and pertubed gradient y
/// satisfies |x - y| <= atol + rtol * |y|,
/// epsilon is defaulted to 1e-6, atol is defaulted to 1e-5, rtol is defauled to 0.001
pub fn grad_check(
    input: Array1<f64>,
    f: impl Fn(&Array1<f64>) -> Array1<f64>,
    df: impl Fn(&Array1<f64>) -> Array1<f64>,
    epsilon: Option<f64>,
    atol: Option<f64>,
    rtol: Option<f64>,
) -> Result<()> {
    let epsilon = epsilon.unwrap_or(1e-6);
    let atol = atol.unwrap_or(1e-5);
    let rtol = rtol.unwrap_or(0.001);

    let n = input.len();
    let m = f(&input).len();
    let mut dy_dx = Array1::<f64>::zeros(m);
    let test_grad = df(&dy_dx);
    if test_grad.len() != n {
        return Err(Error::msg(format!(
            "f maps R{n} to R{m}, but df maps R{m} to R{}",
            test_grad.len()
        )));
    }
    let jacobian = compute_jacobian(input, f, epsilon, m);

    for i in 0..m {
        dy_dx[i] = 1.0;
        let grad = df(&dy_dx);
        let diff = jacobian.index_axis(Axis(1), i);
        for (x, y) in grad.iter().zip(diff.iter()) {
            if !isclose(*x, *y, atol, rtol) {
                return Err(Error::msg(format!(
                    "jacobian mismatch on column {i} \n jacobian computed: \n {diff} \n analytical computed: \n {grad}"
                )));
            }
        }
        dy_dx[i] = 0.0;
    }
    Ok(())
}

pub fn randn<D: Dimension, Sh: ShapeBuilder<Dim = D>>(shape: Sh) -> Array<f32, D> {
    Array::random(shape, StandardNormal)
}

pub fn randn64<D: Dimension, Sh: ShapeBuilder<Dim = D>>(shape: Sh) -> Array<f64, D> {
    Array::random(shape, StandardNormal)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn catches_a_wrong_gradient() {
        let x = randn64(4);
        let f = |x: &Array1<f64>| x.mapv(|v| v * v);
        let good = |x0: Array1<f64>| move |g: &Array1<f64>| g * &x0.mapv(|v| 2.0 * v);
        let bad = |x0: Array1<f64>| move |g: &Array1<f64>| g * &x0;
        assert!(grad_check(x.clone(), f, good(x.clone()), None, None, None).is_ok());
        assert!(grad_check(x.clone(), f, bad(x.clone()), None, None, None).is_err());
        assert!(grad_check(x.clone(), f, |_: &Array1<f64>| Array1::zeros(3), None, None, None).is_err());
    }

    #[test]
    fn isclose_is_relative_to_b() {
        assert!(isclose(1.0f32, 1.0005, 0.0, 1e-3));
        assert!(!isclose(1.0f64, 1.1, 1e-5, 1e-3));
    }
}
