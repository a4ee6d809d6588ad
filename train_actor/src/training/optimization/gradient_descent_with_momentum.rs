use super::{Optimizer, OptimizerState, Result, SizeMismatchErr};

#[derive(Debug)]
pub struct GradientDescentWithMomentum {
    learning_rate: f32,
    momentum: f32,
    step: u64,
    velocity: Box<[f32]>,
}

impl GradientDescentWithMomentum {
    /// Creates a new `GradientDescentWithMomentum` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - Hyperparameter to the optimization algorithm.
    ///
    /// # Returns
    /// A new `GradientDescentWithMomentum` instance.
    pub fn new(len: usize, learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            step: 0,
            velocity: vec![0.; len].into_boxed_slice(),
        }
    }
}

impl Optimizer for GradientDescentWithMomentum {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        if grad.len() != params.len() || grad.len() != self.velocity.len() {
            return Err(SizeMismatchErr);
        }

        let lr = self.learning_rate;
        let mu = self.momentum;

        params
            .iter_mut()
            .zip(grad)
            .zip(self.velocity.iter_mut())
            .for_each(|((p, g), v)| {
                *v = (mu * *v) + g;
                *p -= lr * *v;
            });

        self.step += 1;
        Ok(())
    }

    fn state(&self) -> OptimizerState {
        OptimizerState {
            step: self.step,
            buffers: vec![self.velocity.to_vec()],
        }
    }

    fn load_state(&mut self, state: OptimizerState) -> Result<()> {
        let [velocity]: [Vec<f32>; 1] = state.buffers.try_into().map_err(|_| SizeMismatchErr)?;
        if velocity.len() != self.velocity.len() {
            return Err(SizeMismatchErr);
        }

        self.step = state.step;
        self.velocity = velocity.into_boxed_slice();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn velocity_accumulates() {
        let mut opt = GradientDescentWithMomentum::new(1, 1., 0.5);
        let mut params = [0.];

        opt.update_params(&[1.], &mut params).unwrap();
        opt.update_params(&[1.], &mut params).unwrap();

        assert_eq!(params, [-2.5]);
        assert_eq!(opt.state().buffers, vec![vec![1.5]]);
    }
}
