/* ------------------------------------------------------------------ */
/* LoRA: trainable low-rank overlay on a frozen projection           */
/* ------------------------------------------------------------------ */
//
//   y = x·Wᵀ + (α/r) · dropout(x)·Aᵀ·Bᵀ
//
// W is frozen (a detached tensor, never seen by the optimizer). A starts
// Gaussian and B starts at zero, so a fresh overlay leaves the base output
// unchanged.

use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};

use crate::config::LoraConfig;
use crate::error::Result;
use crate::ops;

#[derive(Debug, Clone)]
pub struct LoraLinear {
    weight: Tensor,   // [out, in], frozen
    lora_a: Tensor,   // [r, in]
    lora_b: Tensor,   // [out, r]
    scaling: f64,
    dropout: f32,
}

impl LoraLinear {
    pub fn new(weight: Tensor, cfg: &LoraConfig, vb: VarBuilder) -> Result<Self> {
        let (out_dim, in_dim) = weight.dims2()?;
        let lora_a = vb.get_with_hints(
            (cfg.rank, in_dim),
            "lora_a",
            Init::Randn { mean: 0.0, stdev: 1.0 / cfg.rank as f64 },
        )?;
        let lora_b = vb.get_with_hints((out_dim, cfg.rank), "lora_b", Init::Const(0.0))?;
        Ok(Self {
            weight: weight.detach(),
            lora_a,
            lora_b,
            scaling: cfg.scaling(),
            dropout: cfg.dropout,
        })
    }

    pub fn forward(&self, x: &Tensor, training: bool) -> Result<Tensor> {
        let base = x.broadcast_matmul(&self.weight.t()?)?;
        let xd = ops::dropout(x, self.dropout, training)?;
        let delta = xd
            .broadcast_matmul(&self.lora_a.t()?)?
            .broadcast_matmul(&self.lora_b.t()?)?;
        Ok((base + (delta * self.scaling)?)?)
    }

    /// Effective weight W + (α/r)·B·A, for inspection and tests.
    pub fn merged_weight(&self) -> Result<Tensor> {
        let delta = (self.lora_b.matmul(&self.lora_a)? * self.scaling)?;
        Ok((&self.weight + delta)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn fresh_overlay_is_identity_on_base() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let w = Tensor::randn(0f32, 1.0, (6, 4), &dev)?;
        let cfg = LoraConfig { rank: 2, alpha: 4.0, dropout: 0.0 };
        let lora = LoraLinear::new(w.clone(), &cfg, vb.pp("q_proj"))?;

        let x = Tensor::randn(0f32, 1.0, (3, 4), &dev)?;
        let y = lora.forward(&x, false)?.to_vec2::<f32>()?;
        let want = x.matmul(&w.t()?)?.to_vec2::<f32>()?;
        for (a, b) in y.iter().flatten().zip(want.iter().flatten()) {
            assert!((a - b).abs() < 1e-5);
        }
        assert_eq!(varmap.all_vars().len(), 2);
        Ok(())
    }

    #[test]
    fn only_low_rank_factors_receive_gradients() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let w = candle_core::Var::randn(0f32, 1.0, (5, 3), &dev)?;
        let cfg = LoraConfig { rank: 2, alpha: 2.0, dropout: 0.0 };
        let lora = LoraLinear::new(w.as_tensor().clone(), &cfg, vb)?;

        let x = Tensor::randn(0f32, 1.0, (2, 3), &dev)?;
        let grads = lora.forward(&x, true)?.sum_all()?.backward()?;
        assert!(grads.get(w.as_tensor()).is_none());
        // B started at zero, so A's gradient is zero but B's is not
        assert!(grads.get(&lora.lora_b).is_some());
        Ok(())
    }
}
