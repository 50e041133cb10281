//! Minimal ndarray layers with hand written backward passes.
//!
//! Every forward function returns its output together with a closure that maps
//! the gradient of the output to the gradient of the input, accumulating the
//! parameter gradients on the way.
use std::fmt::Debug;

use ndarray::prelude::*;
use ndarray::{IntoDimension, LinalgScalar, ScalarOperand};
use ndarray_rand::RandomExt;
use num::traits::NumAssignOps;
use num::FromPrimitive;
use rand::Rng;
use rand_distr::{Distribution, Normal, StandardNormal};

pub mod linear;
pub mod ops;
pub mod optim;
pub mod utils;

pub use linear::Linear;
pub use optim::Adam;

pub trait Float:
    num::Float + NumAssignOps + LinalgScalar + ScalarOperand + FromPrimitive + Debug + Send + Sync + 'static
{
}

impl Float for f32 {}
impl Float for f64 {}

pub struct Param<T, D> {
    pub w: Array<T, D>,
    pub g: Array<T, D>,
}

impl<T: Float, D: Dimension> Param<T, D> {
    pub fn new(w: Array<T, D>) -> Self {
        let g = Array::zeros(w.raw_dim());
        Param { w, g }
    }

    pub fn zeros<Sh: IntoDimension<Dim = D> + Clone>(dim: Sh) -> Self {
        Param {
            w: Array::zeros(dim.clone()),
            g: Array::zeros(dim),
        }
    }

    /// Normal(0, std) weights drawn from `rng`.
    pub fn randn_using<Sh, R>(dim: Sh, std: T, rng: &mut R) -> Self
    where
        Sh: IntoDimension<Dim = D> + Clone,
        R: Rng,
        StandardNormal: Distribution<T>,
    {
        let w = match Normal::new(T::zero(), std) {
            Ok(dist) => Array::random_using(dim.clone(), dist, rng),
            Err(_) => Array::zeros(dim.clone()),
        };
        Param {
            w,
            g: Array::zeros(dim),
        }
    }

    pub fn zero_grad(&mut self) {
        self.g.fill(T::zero());
    }
}
