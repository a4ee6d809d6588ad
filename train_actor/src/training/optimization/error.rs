use std::{
    error::Error,
    fmt::{self, Display},
};

/// The specific result type for size mismatch checks inside the optimization module.
pub type Result<T> = std::result::Result<T, SizeMismatchErr>;

/// Error returned by optimizers whenever the gradient, the parameters or a
/// restored state don't have the same length.
#[derive(Debug)]
pub struct SizeMismatchErr;

impl Display for SizeMismatchErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Optimizer error: the provided buffer length doesn't match the optimizer size")
    }
}

impl Error for SizeMismatchErr {}
