//! Encoding of `f32` values into the little endian wire representation of a `DType`.

use std::io;

use half::{bf16, f16};

use super::DType;

/// Encodes `values` with the precision of `dtype`.
///
/// # Arguments
/// * `values` - The full precision values.
/// * `dtype` - The target precision.
///
/// # Returns
/// The encoded little endian bytes.
pub fn encode(values: &[f32], dtype: DType) -> Vec<u8> {
    match dtype {
        DType::F32 => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        DType::F16 => {
            let halves: Vec<u16> = values.iter().map(|&v| f16::from_f32(v).to_bits().to_le()).collect();
            bytemuck::cast_slice(&halves).to_vec()
        }
        DType::Bf16 => {
            let halves: Vec<u16> = values.iter().map(|&v| bf16::from_f32(v).to_bits().to_le()).collect();
            bytemuck::cast_slice(&halves).to_vec()
        }
    }
}

/// Decodes bytes produced by `encode` back into `f32` values.
///
/// # Arguments
/// * `bytes` - The encoded little endian bytes.
/// * `dtype` - The precision they were encoded with.
///
/// # Returns
/// The decoded values or an error if `bytes` isn't a whole amount of elements.
pub fn decode(bytes: &[u8], dtype: DType) -> io::Result<Vec<f32>> {
    if bytes.len() % dtype.size() != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} bytes is not a whole amount of {dtype:?} elements", bytes.len()),
        ));
    }

    let values = match dtype {
        DType::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        DType::F16 => bytes
            .chunks_exact(2)
            .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
            .collect(),
        DType::Bf16 => bytes
            .chunks_exact(2)
            .map(|c| bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
            .collect(),
    };

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_is_exact() {
        let values = [0.1_f32, -3.5, 1e-8, f32::MAX];
        let bytes = encode(&values, DType::F32);
        assert_eq!(bytes.len(), 16);
        assert_eq!(decode(&bytes, DType::F32).unwrap(), values);
    }

    #[test]
    fn half_precisions_round_to_nearest() {
        let values = [1.0_f32, 0.333_333_34, -2.0];

        let f16_back = decode(&encode(&values, DType::F16), DType::F16).unwrap();
        let bf16_back = decode(&encode(&values, DType::Bf16), DType::Bf16).unwrap();

        assert_eq!(f16_back[0], 1.0);
        assert_eq!(bf16_back[2], -2.0);
        assert!((f16_back[1] - values[1]).abs() < 1e-3);
        assert!((bf16_back[1] - values[1]).abs() < 1e-2);
    }

    #[test]
    fn rejects_ragged_bytes() {
        assert!(decode(&[0, 0, 0], DType::F32).is_err());
        assert!(decode(&[0], DType::Bf16).is_err());
    }
}
