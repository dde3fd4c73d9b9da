/* ------------------------------------------------------------------ */
/* Tensor primitives: norms, activations, masks, loss                */
/* ------------------------------------------------------------------ */
//
// Softmax and RMSNorm are written out from elementwise ops so their
// backward passes are plain autograd over basic kernels.

use candle_core::{D, DType, Device, Tensor};

use crate::error::{Error, Result};

// Large finite negative: fully masked rows (left padding) stay finite.
const MASK_NEG: f32 = -1e9;

// RMSNorm without gain: x / rms(x)
pub fn rms_norm(x: &Tensor) -> Result<Tensor> {
    let ms = x.sqr()?.mean_keepdim(D::Minus1)?;
    Ok(x.broadcast_div(&(ms + 1e-5)?.sqrt()?)?)
}

pub fn softmax_last_dim(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?.detach();
    let e = x.broadcast_sub(&max)?.exp()?;
    Ok(e.broadcast_div(&e.sum_keepdim(D::Minus1)?)?)
}

// Squared ReLU: relu(x)²
pub fn squared_relu(x: &Tensor) -> Result<Tensor> {
    Ok(x.relu()?.sqr()?)
}

pub fn dropout(x: &Tensor, rate: f32, training: bool) -> Result<Tensor> {
    if !training || rate <= 0.0 {
        return Ok(x.clone());
    }
    Ok(candle_nn::ops::dropout(x, rate)?)
}

/// Additive attention bias `[b, 1, s, s]`: 0 where query i may attend key j
/// (j <= i and key j is not padding), a large negative value elsewhere.
pub fn attention_bias(mask: &[Vec<u32>], device: &Device) -> Result<Tensor> {
    let b = mask.len();
    let s = mask.first().map_or(0, |r| r.len());
    let mut bias = vec![MASK_NEG; b * s * s];
    for (bi, row) in mask.iter().enumerate() {
        for i in 0..s {
            for j in 0..=i {
                if row[j] != 0 {
                    bias[(bi * s + i) * s + j] = 0.0;
                }
            }
        }
    }
    Ok(Tensor::from_vec(bias, (b, 1, s, s), device)?)
}

/// Positions counted from the first real token; padding sits at 0.
pub fn position_ids(mask: &[Vec<u32>], device: &Device) -> Result<Tensor> {
    let b = mask.len();
    let s = mask.first().map_or(0, |r| r.len());
    let mut pos = Vec::with_capacity(b * s);
    for row in mask {
        let mut next = 0u32;
        for &m in row {
            if m != 0 {
                pos.push(next);
                next += 1;
            } else {
                pos.push(0);
            }
        }
    }
    Ok(Tensor::from_vec(pos, (b, s), device)?)
}

/// Elementwise binary cross-entropy with logits, stable form:
/// max(x, 0) - x·t + ln(1 + e^{-|x|})
pub fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let softplus = (logits.abs()?.neg()?.exp()? + 1.0)?.log()?;
    Ok(((logits.relu()? - (logits * targets)?)? + softplus)?)
}

/// Multi-label loss over a (possibly extended) vocabulary.
///
/// `logits` is `[b, l, v]`, `targets` and `mask` are `[b, l]` (u32). Each
/// valid position's target is one-hot over all `v` classes; the BCE is
/// averaged over unmasked elements. Masked positions contribute exactly 0.
pub fn masked_one_hot_bce(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (b, l, v) = logits.dims3()?;
    if targets.dims() != [b, l] || mask.dims() != [b, l] {
        return Err(Error::config(format!(
            "loss shapes disagree: logits {:?}, targets {:?}, mask {:?}",
            logits.dims(), targets.dims(), mask.dims()
        )));
    }
    let logits = logits.to_dtype(DType::F32)?;
    let one_hot = candle_nn::encoding::one_hot::<f32>(targets.clone(), v, 1.0, 0.0)?;
    let mask_f = mask.to_dtype(DType::F32)?;
    let valid = mask_f.sum_all()?.to_scalar::<f32>()?;
    let per_elem = bce_with_logits(&logits, &one_hot)?;
    let masked = per_elem.broadcast_mul(&mask_f.unsqueeze(D::Minus1)?)?;
    let denom = (valid as f64 * v as f64).max(1.0);
    Ok((masked.sum_all()? / denom)?)
}

/// Greedy pick over the last dimension of `[b, v]` logits.
pub fn argmax_last(logits: &Tensor) -> Result<Vec<u32>> {
    Ok(logits.argmax(D::Minus1)?.to_vec1::<u32>()?)
}
