mod role;
mod store;
mod tensor;

pub use role::Role;
pub use store::{ParameterStore, WeightSnapshot};
pub use tensor::{DType, Location, ParameterSet, Schema, TensorDesc};
