//! Conversion of trainer tensors into the layout and precision rollout engines serve.

use comms::specs::{DType, EngineSpec, TensorSpec, codec};

use super::WireTensor;
use crate::params::{ParameterSet, TensorDesc};

/// Extracts the part of a tensor an engine keeps, encoded with its precision.
///
/// Tensors whose leading dimension splits evenly across the engine's
/// tensor-parallel size are sliced, every other tensor is replicated whole.
///
/// # Arguments
/// * `desc` - The tensor's full description.
/// * `values` - The tensor's full values.
/// * `engine` - The target engine's layout.
///
/// # Returns
/// The tensor as the engine expects it.
pub fn shard(desc: &TensorDesc, values: &[f32], engine: &EngineSpec) -> WireTensor {
    let tp_size = engine.tp_size.get();
    let mut shape = desc.shape.clone();

    let part = match shape.first_mut() {
        Some(rows) if tp_size > 1 && engine.tp_rank < tp_size && *rows % tp_size == 0 => {
            *rows /= tp_size;
            let len = values.len() / tp_size;
            let start = engine.tp_rank * len;
            &values[start..start + len]
        }
        _ => values,
    };

    WireTensor {
        spec: TensorSpec {
            name: desc.name.clone(),
            shape,
            dtype: engine.dtype,
        },
        bytes: codec::encode(part, engine.dtype),
    }
}

/// Encodes the full tensor at full precision.
pub fn full(desc: &TensorDesc, values: &[f32]) -> WireTensor {
    WireTensor {
        spec: desc.to_spec(DType::F32),
        bytes: codec::encode(values, DType::F32),
    }
}

/// Converts every tensor of `params` for `engine` and groups them into buckets.
pub fn for_engine(params: &ParameterSet, engine: &EngineSpec, max_bytes: usize) -> Vec<Vec<WireTensor>> {
    bucket(
        params
            .iter()
            .map(|(desc, values)| shard(desc, values, engine)),
        max_bytes,
    )
}

/// Groups tensors into buckets of at most `max_bytes` each.
///
/// A tensor larger than `max_bytes` travels alone in its own bucket.
pub fn bucket<I>(tensors: I, max_bytes: usize) -> Vec<Vec<WireTensor>>
where
    I: IntoIterator<Item = WireTensor>,
{
    let mut buckets = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0;

    for tensor in tensors {
        let len = tensor.bytes.len();
        if !current.is_empty() && current_bytes + len > max_bytes {
            buckets.push(std::mem::take(&mut current));
            current_bytes = 0;
        }

        current_bytes += len;
        current.push(tensor);
    }

    if !current.is_empty() {
        buckets.push(current);
    }

    buckets
}
