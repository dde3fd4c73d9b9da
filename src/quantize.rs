/* ------------------------------------------------------------------ */
/* Frozen-weight quantization (4 / 8 bit, symmetric absmax per row)  */
/* ------------------------------------------------------------------ */
//
// Frozen projections are stored quantize-dequantized: values snap to the
// signed integer grid of the chosen width, scaled per output row. LoRA
// deltas, the adapter and the tied embedding table are never quantized.

use candle_core::{D, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quantization {
    None,
    Q4,
    Q8,
}

impl Quantization {
    pub fn from_flags(q4: bool, q8: bool) -> Result<Self> {
        match (q4, q8) {
            (true, true)   => Err(Error::config("only one of q4 or q8 may be enabled")),
            (true, false)  => Ok(Self::Q4),
            (false, true)  => Ok(Self::Q8),
            (false, false) => Ok(Self::None),
        }
    }

    pub fn bits(self) -> Option<u8> {
        match self {
            Self::None => None,
            Self::Q4   => Some(4),
            Self::Q8   => Some(8),
        }
    }
}

/// Largest positive level of a signed `bits`-wide grid.
fn max_level(bits: u8) -> f32 {
    ((1i32 << (bits - 1)) - 1) as f32
}

/// Quantize-dequantize a `[rows, cols]` weight with one scale per row.
pub fn fake_quantize(weight: &Tensor, mode: Quantization) -> Result<Tensor> {
    let Some(bits) = mode.bits() else {
        return Ok(weight.clone());
    };
    if weight.rank() != 2 {
        return Err(Error::config(format!(
            "quantization expects a matrix, got shape {:?}", weight.dims()
        )));
    }
    let levels = max_level(bits) as f64;
    let scale = (weight.abs()?.max_keepdim(D::Minus1)? / levels)?
        .clamp(1e-12f32, f32::MAX)?;
    let q = weight
        .broadcast_div(&scale)?
        .round()?
        .clamp(-(levels as f32) - 1.0, levels as f32)?;
    Ok(q.broadcast_mul(&scale)?)
}
