/* ------------------------------------------------------------------ */
/* Hyperparameters, defaults and typed experiment configuration      */
/* ------------------------------------------------------------------ */
//
// Constants are the defaults; the structs below carry per-experiment
// overrides. Nothing here reads files: callers (the CLI, tests) build the
// structs directly or deserialize them from whatever source they own.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::quantize::Quantization;

// ── Mask-reference vocabulary ─────────────────────────────────────────────

pub const NUM_MASK_TOKENS: usize   = 499;               // <SEG_MASK_1> … <SEG_MASK_499>
pub const MASK_TOKEN_PREFIX: &str  = "<SEG_MASK_";
pub const DEFAULT_END_TURN: &str   = "<end_of_turn>\n";
pub const IMAGE_TOKEN: &str        = "<image>";

// ── Base model (TinyVlm) ──────────────────────────────────────────────────

pub const N_EMBD:       usize = 64;
pub const N_HEAD:       usize = 4;
pub const N_LAYER:      usize = 2;
pub const MLP_DIM:      usize = 4 * N_EMBD;
pub const BLOCK_SIZE:   usize = 256;
pub const IMAGE_DIM:    usize = 32;
pub const IMAGE_TOKENS: usize = 4;   // <image> placeholders per prompt (one per patch)
// Rows the base table carries above the tokenizer boundary (padded vocab,
// as in LLaVA checkpoints). Must be >= 1: row B is the insertion anchor.
pub const TABLE_PADDING: usize = 8;

// ── LoRA ──────────────────────────────────────────────────────────────────

pub const LORA_RANK:    usize = 16;
pub const LORA_ALPHA:   f64   = 32.0;
pub const LORA_DROPOUT: f32   = 0.05;

// ── Training ──────────────────────────────────────────────────────────────

pub const ADAPTER_LR:     f64   = 1e-4;
pub const LORA_LR:        f64   = 2e-4;
pub const EPOCHS:         usize = 10;
pub const LOG_INTERVAL:   usize = 10;
pub const VAL_EVERY:      usize = 10;
pub const MAX_NEW_TOKENS: usize = 48;
pub const BATCH_SIZE:     usize = 2;

// ── Device ────────────────────────────────────────────────────────────────

pub const USE_GPU: bool = true;

// ── Typed configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    pub rank: usize,
    pub alpha: f64,
    pub dropout: f32,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self { rank: LORA_RANK, alpha: LORA_ALPHA, dropout: LORA_DROPOUT }
    }
}

impl LoraConfig {
    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }

    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            return Err(Error::config("LoRA rank must be positive"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::config(format!("LoRA dropout {} outside [0, 1)", self.dropout)));
        }
        Ok(())
    }
}

/// Shape of the in-crate base model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VlmConfig {
    /// Rows of the tied embedding / output table (>= tokenizer boundary + 1).
    pub vocab_size: usize,
    pub hidden: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    pub mlp_dim: usize,
    pub max_seq_len: usize,
    pub image_dim: usize,
    pub image_token_id: u32,
}

impl VlmConfig {
    pub fn tiny(vocab_size: usize, image_token_id: u32) -> Self {
        Self {
            vocab_size,
            hidden: N_EMBD,
            n_heads: N_HEAD,
            n_layers: N_LAYER,
            mlp_dim: MLP_DIM,
            max_seq_len: BLOCK_SIZE,
            image_dim: IMAGE_DIM,
            image_token_id,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden / self.n_heads
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_heads == 0 || self.hidden % self.n_heads != 0 {
            return Err(Error::config(format!(
                "hidden size {} not divisible into {} heads", self.hidden, self.n_heads
            )));
        }
        if self.vocab_size == 0 || self.max_seq_len == 0 {
            return Err(Error::config("vocab_size and max_seq_len must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub end_turn_token: String,
    pub q4: bool,
    pub q8: bool,
    pub lora: LoraConfig,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            end_turn_token: DEFAULT_END_TURN.to_string(),
            q4: true,
            q8: false,
            lora: LoraConfig::default(),
        }
    }
}

impl ModelParams {
    /// Resolves the two quantization flags; both set is a fatal error.
    pub fn quantization(&self) -> Result<Quantization> {
        Quantization::from_flags(self.q4, self.q8)
    }

    pub fn validate(&self) -> Result<()> {
        self.quantization()?;
        self.lora.validate()?;
        if self.end_turn_token.trim().is_empty() {
            return Err(Error::config("end-of-turn token must not be blank"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub adapter_lr: f64,
    pub lora_lr: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { adapter_lr: ADAPTER_LR, lora_lr: LORA_LR }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub epochs: usize,
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    #[serde(default = "default_val_every")]
    pub val_every: usize,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub model_params: ModelParams,
}

fn default_log_interval() -> usize { LOG_INTERVAL }
fn default_val_every() -> usize { VAL_EVERY }
fn default_max_new_tokens() -> usize { MAX_NEW_TOKENS }

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            epochs: EPOCHS,
            log_interval: LOG_INTERVAL,
            val_every: VAL_EVERY,
            max_new_tokens: MAX_NEW_TOKENS,
            optimizer: OptimizerConfig::default(),
            model_params: ModelParams::default(),
        }
    }
}

impl ExperimentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.log_interval == 0 || self.val_every == 0 {
            return Err(Error::config("log_interval and val_every must be positive"));
        }
        if !(self.optimizer.adapter_lr > 0.0 && self.optimizer.lora_lr > 0.0) {
            return Err(Error::config("learning rates must be positive"));
        }
        self.model_params.validate()
    }

    /// Validation runs every `val_every` epochs and always on the last one.
    pub fn is_validation_epoch(&self, epoch: usize) -> bool {
        (epoch + 1) % self.val_every == 0 || epoch + 1 == self.epochs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicting_quantization_is_fatal() {
        let params = ModelParams { q4: true, q8: true, ..Default::default() };
        let err = params.validate().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn experiment_defaults_fill_missing_fields() {
        let cfg: ExperimentConfig = serde_json::from_str(r#"{"epochs": 3}"#).unwrap();
        assert_eq!(cfg.epochs, 3);
        assert_eq!(cfg.val_every, VAL_EVERY);
        assert_eq!(cfg.model_params.end_turn_token, DEFAULT_END_TURN);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validation_epochs_include_last() {
        let cfg = ExperimentConfig { epochs: 5, val_every: 2, ..Default::default() };
        let epochs: Vec<usize> = (0..5).filter(|&e| cfg.is_validation_epoch(e)).collect();
        assert_eq!(epochs, vec![1, 3, 4]);
    }

    #[test]
    fn vlm_config_rejects_uneven_heads() {
        let mut cfg = VlmConfig::tiny(100, 5);
        cfg.n_heads = 5;
        assert!(cfg.validate().is_err());
    }
}
