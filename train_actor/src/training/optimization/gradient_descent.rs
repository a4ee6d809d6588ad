use super::{Optimizer, OptimizerState, Result, SizeMismatchErr};

#[derive(Debug)]
pub struct GradientDescent {
    learning_rate: f32,
    step: u64,
}

impl GradientDescent {
    /// Creates a new `GradientDescent` optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    ///
    /// # Returns
    /// A new `GradientDescent` instance.
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            step: 0,
        }
    }
}

impl Optimizer for GradientDescent {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        if grad.len() != params.len() {
            return Err(SizeMismatchErr);
        }

        let lr = self.learning_rate;

        for (p, g) in params.iter_mut().zip(grad) {
            *p -= lr * g;
        }

        self.step += 1;
        Ok(())
    }

    fn state(&self) -> OptimizerState {
        OptimizerState {
            step: self.step,
            buffers: Vec::new(),
        }
    }

    fn load_state(&mut self, state: OptimizerState) -> Result<()> {
        if !state.buffers.is_empty() {
            return Err(SizeMismatchErr);
        }

        self.step = state.step;
        Ok(())
    }
}
