/* ------------------------------------------------------------------ */
/* Embedding adapter: region-embedding space → token-embedding space */
/* ------------------------------------------------------------------ */

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};

use crate::error::{Error, Result};

/// One affine map (weight + bias) owning its own parameter store, so the
/// optimizer can give it a separate learning-rate group.
pub struct SegAdapter {
    proj: Linear,
    varmap: VarMap,
    in_dim: usize,
    out_dim: usize,
}

impl SegAdapter {
    pub fn new(in_dim: usize, out_dim: usize, device: &Device) -> Result<Self> {
        if in_dim == 0 || out_dim == 0 {
            return Err(Error::config(format!("adapter dims must be positive, got {in_dim}→{out_dim}")));
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let proj = linear(in_dim, out_dim, vb.pp("proj"))?;
        Ok(Self { proj, varmap, in_dim, out_dim })
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// `[regions, in_dim]` → `[regions, out_dim]`, keeping the autograd graph.
    pub fn forward(&self, regions: &Tensor) -> Result<Tensor> {
        let (n, d) = regions.dims2()?;
        if d != self.in_dim {
            return Err(Error::config(format!(
                "region embedding dim {d} does not match adapter input dim {}", self.in_dim
            )));
        }
        if n == 0 {
            return Ok(Tensor::zeros((0, self.out_dim), DType::F32, regions.device())?);
        }
        Ok(self.proj.forward(&regions.to_dtype(DType::F32)?)?)
    }

    /// Adapter backward seeded with an explicit upstream gradient:
    /// d/dθ Σ(output ⊙ grad_output). `output` must be the graph-carrying
    /// result of `forward`; `grad_output` is treated as a constant.
    pub fn propagate(&self, output: &Tensor, grad_output: &Tensor) -> Result<GradStore> {
        if output.dims() != grad_output.dims() {
            return Err(Error::config(format!(
                "adapter output {:?} and incoming gradient {:?} disagree",
                output.dims(), grad_output.dims()
            )));
        }
        let surrogate = (output * grad_output.detach())?.sum_all()?;
        Ok(surrogate.backward()?)
    }

    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn var_map(&self) -> &VarMap {
        &self.varmap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_region_dim() -> Result<()> {
        let adapter = SegAdapter::new(4, 8, &Device::Cpu)?;
        let x = Tensor::zeros((2, 5), DType::F32, &Device::Cpu)?;
        assert!(adapter.forward(&x).unwrap_err().is_fatal());
        let empty = adapter.forward(&Tensor::zeros((0, 4), DType::F32, &Device::Cpu)?)?;
        assert_eq!(empty.dims(), &[0, 8]);
        Ok(())
    }

    #[test]
    fn propagate_applies_the_seed_gradient() -> Result<()> {
        let dev = Device::Cpu;
        let adapter = SegAdapter::new(3, 2, &dev)?;
        let x = Tensor::new(&[[1.0f32, 2.0, 3.0], [0.5, -1.0, 0.0]], &dev)?;
        let out = adapter.forward(&x)?;
        let seed = Tensor::ones((2, 2), DType::F32, &dev)?;
        let grads = adapter.propagate(&out, &seed)?;

        let vars = adapter.vars();
        assert_eq!(vars.len(), 2);
        for var in &vars {
            let g = grads.get(var.as_tensor()).expect("adapter var has a gradient");
            match var.dims() {
                // dL/dW[j, k] = Σ_n x[n, k]
                [2, 3] => assert_eq!(g.to_vec2::<f32>()?, vec![vec![1.5, 1.0, 3.0]; 2]),
                // dL/db[j] = number of rows
                [2] => assert_eq!(g.to_vec1::<f32>()?, vec![2.0, 2.0]),
                other => panic!("unexpected adapter var shape {other:?}"),
            }
        }
        Ok(())
    }

    #[test]
    fn propagate_checks_shapes() -> Result<()> {
        let dev = Device::Cpu;
        let adapter = SegAdapter::new(3, 2, &dev)?;
        let out = adapter.forward(&Tensor::ones((1, 3), DType::F32, &dev)?)?;
        assert!(adapter.propagate(&out, &Tensor::ones((2, 2), DType::F32, &dev)?).is_err());
        Ok(())
    }
}
