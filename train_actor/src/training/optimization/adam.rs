use super::{Optimizer, OptimizerState, Result, SizeMismatchErr};

#[derive(Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    step: u64,
    v: Box<[f32]>,
    s: Box<[f32]>,
    epsilon: f32,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    ///
    /// # Returns
    /// A new `Adam` instance.
    pub fn new(len: usize, learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            step: 0,
            v: vec![0.; len].into_boxed_slice(),
            s: vec![0.; len].into_boxed_slice(),
            epsilon,
        }
    }
}

impl Optimizer for Adam {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        if grad.len() != params.len() || grad.len() != self.v.len() {
            return Err(SizeMismatchErr);
        }

        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.step += 1;
        let t = self.step.min(i32::MAX as u64) as i32;

        let bc1 = 1. - b1.powi(t);
        let bc2 = 1. - b2.powi(t);
        let step_size = lr * (bc2.sqrt() / bc1);

        params
            .iter_mut()
            .zip(grad)
            .zip(self.v.iter_mut())
            .zip(self.s.iter_mut())
            .for_each(|(((p, g), v), s)| {
                *v = b1 * *v + (1. - b1) * g;
                *s = b2 * *s + (1. - b2) * g.powi(2);
                *p -= step_size * *v / (s.sqrt() + eps);
            });

        Ok(())
    }

    fn state(&self) -> OptimizerState {
        OptimizerState {
            step: self.step,
            buffers: vec![self.v.to_vec(), self.s.to_vec()],
        }
    }

    fn load_state(&mut self, state: OptimizerState) -> Result<()> {
        let [v, s]: [Vec<f32>; 2] = state.buffers.try_into().map_err(|_| SizeMismatchErr)?;
        if v.len() != self.v.len() || s.len() != self.s.len() {
            return Err(SizeMismatchErr);
        }

        self.step = state.step;
        self.v = v.into_boxed_slice();
        self.s = s.into_boxed_slice();
        Ok(())
    }
}
