use ndarray::Dimension;

use super::Param;
use crate::configs::AdamConfig;

/// Adam with bias correction folded into the step size.
///
/// Moment buffers are kept per slot, every parameter has to be applied with
/// the same slot on every step.
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: i32,
    mt: Vec<Vec<f32>>,
    vt: Vec<Vec<f32>>,
}

impl Adam {
    pub fn new(config: &AdamConfig) -> Self {
        Adam {
            lr: config.lr,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            t: 0,
            mt: Vec::new(),
            vt: Vec::new(),
        }
    }

    pub fn steps(&self) -> i32 {
        self.t
    }

    /// Advances the step counter, called once before the parameters of a step are applied.
    pub fn tick(&mut self) {
        self.t += 1;
    }

    /// Moves `param` against its gradient and clears the gradient.
    pub fn apply<D: Dimension>(&mut self, slot: usize, param: &mut Param<f32, D>) {
        let len = param.w.len();
        if self.mt.len() <= slot {
            self.mt.resize(slot + 1, Vec::new());
            self.vt.resize(slot + 1, Vec::new());
        }
        if self.mt[slot].len() != len {
            self.mt[slot] = vec![0.0; len];
            self.vt[slot] = vec![0.0; len];
        }
        let t = self.t.max(1);
        let alpha = self.lr * (1.0 - self.beta2.powi(t)).sqrt() / (1.0 - self.beta1.powi(t));
        let (b1, b2, eps) = (self.beta1, self.beta2, self.eps);
        self.mt[slot]
            .iter_mut()
            .zip(self.vt[slot].iter_mut())
            .zip(param.g.iter_mut())
            .zip(param.w.iter_mut())
            .for_each(|(((m, v), g), x)| {
                *m = b1 * *m + (1.0 - b1) * *g;
                *v = b2 * *v + (1.0 - b2) * (*g).powi(2);
                *x -= alpha * *m / (v.sqrt() + eps);
                *g = 0.0;
            });
    }
}
