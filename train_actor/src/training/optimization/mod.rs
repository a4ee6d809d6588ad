mod adam;
mod error;
mod gradient_descent;
mod gradient_descent_with_momentum;
mod group;
mod optimizer;

pub use adam::Adam;
pub use error::{Result, SizeMismatchErr};
pub use gradient_descent::GradientDescent;
pub use gradient_descent_with_momentum::GradientDescentWithMomentum;
pub use group::{ModelOptimizerState, OptimizerGroup};
pub use optimizer::{Optimizer, OptimizerSpec, OptimizerState};
