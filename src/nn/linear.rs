use ndarray::prelude::*;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use super::{ops::dmatmul, Float, Param};

/// y = x W + b over rows of x.
pub struct Linear<T: Float> {
    pub w: Param<T, Ix2>,
    pub b: Param<T, Ix1>,
}

impl<T: Float> Linear<T> {
    /// He normal weights, zero bias.
    pub fn new<R: Rng>(in_dim: usize, out_dim: usize, rng: &mut R) -> Self
    where
        StandardNormal: Distribution<T>,
    {
        let std = T::from_f64((2.0 / in_dim.max(1) as f64).sqrt()).unwrap_or_else(T::one);
        Linear {
            w: Param::randn_using((in_dim, out_dim), std, rng),
            b: Param::zeros(out_dim),
        }
    }

    pub fn from_weights(w: Array2<T>, b: Array1<T>) -> Self {
        Linear {
            w: Param::new(w),
            b: Param::new(b),
        }
    }

    pub fn in_dim(&self) -> usize {
        self.w.w.nrows()
    }

    pub fn out_dim(&self) -> usize {
        self.w.w.ncols()
    }

    pub fn apply(&self, x: &Array2<T>) -> Array2<T> {
        x.dot(&self.w.w) + &self.b.w
    }

    /// expects x to be [B, in_dim], outputs [B, out_dim]
    pub fn forward(&self, x: &Array2<T>) -> (Array2<T>, impl Fn(&mut Self, &Array2<T>) -> Array2<T>) {
        let y = self.apply(x);
        let x1 = x.clone();
        let back_fn = move |s: &mut Self, grad: &Array2<T>| {
            let (dx, dw) = dmatmul(grad, &x1, &s.w.w);
            s.w.g += &dw;
            s.b.g += &grad.sum_axis(Axis(0));
            dx
        };
        (y, back_fn)
    }

    pub fn zero_grad(&mut self) {
        self.w.zero_grad();
        self.b.zero_grad();
    }
}
