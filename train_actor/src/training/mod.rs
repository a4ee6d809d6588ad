pub mod advantages;
pub mod loss;
pub mod optimization;
pub mod policy;

pub use advantages::AdvantageEstimator;
pub use loss::{LossConfig, LossTerms, policy_loss};
pub use policy::{BigramPolicy, PolicyModel};
