/* ------------------------------------------------------------------ */
/* Joint optimizer: adapter group + LoRA group                       */
/* ------------------------------------------------------------------ */
//
// Two Adam parameter groups with independent learning rates, stepped from
// one gradient store. Weight decay is 0 in both (plain Adam).

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use crate::config::OptimizerConfig;
use crate::error::{Error, Result};

fn adam(lr: f64) -> ParamsAdamW {
    ParamsAdamW { lr, weight_decay: 0.0, ..Default::default() }
}

pub struct JointOptimizer {
    adapter: AdamW,
    lora: AdamW,
    step: usize,
}

impl JointOptimizer {
    pub fn new(adapter_vars: Vec<Var>, lora_vars: Vec<Var>, cfg: &OptimizerConfig) -> Result<Self> {
        if adapter_vars.is_empty() {
            return Err(Error::config("adapter parameter group is empty"));
        }
        tracing::info!(
            adapter_params = adapter_vars.iter().map(|v| v.elem_count()).sum::<usize>(),
            lora_params = lora_vars.iter().map(|v| v.elem_count()).sum::<usize>(),
            adapter_lr = cfg.adapter_lr,
            lora_lr = cfg.lora_lr,
            "optimizer groups"
        );
        Ok(Self {
            adapter: AdamW::new(adapter_vars, adam(cfg.adapter_lr))?,
            lora: AdamW::new(lora_vars, adam(cfg.lora_lr))?,
            step: 0,
        })
    }

    /// Applies one update to both groups. Vars without a gradient in
    /// `grads` are left untouched.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.adapter.step(grads)?;
        self.lora.step(grads)?;
        self.step += 1;
        Ok(())
    }

    pub fn set_learning_rates(&mut self, adapter_lr: f64, lora_lr: f64) {
        self.adapter.set_learning_rate(adapter_lr);
        self.lora.set_learning_rate(lora_lr);
    }

    pub fn learning_rates(&self) -> (f64, f64) {
        (self.adapter.learning_rate(), self.lora.learning_rate())
    }

    pub fn steps(&self) -> usize {
        self.step
    }
}
