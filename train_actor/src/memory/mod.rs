mod allocator;
mod lifecycle;

pub use allocator::{DeviceAllocator, MODEL_TAG, OPTIMIZER_TAG, OffloadTags, tags};
pub use lifecycle::DeviceMemoryLifecycle;
