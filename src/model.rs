/* ------------------------------------------------------------------ */
/* Base vision-language model: provider seam + in-crate TinyVlm      */
/* ------------------------------------------------------------------ */
//
// TinyVlm layout (pre-norm, tied table):
//
//   tokens ──wte──┐
//                 ├─ <image> run replaced by vision(patches) ─ + wpe
//   patches ──────┘
//     └─ N_LAYER × [ x + attn(rms(x)),  x + mlp(rms(x)) ]
//          └─ rms ─ last n positions ─ · wteᵀ ─ logits
//
// Every base weight is frozen: it is a detached view of a var in the base
// VarMap, so loading a checkpoint with `Var::set` updates the model in
// place. Only the LoRA factors on q_proj / v_proj carry gradients, plus
// whatever table the dynamic vocabulary installs while it is extended.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Init, VarBuilder, VarMap};

use crate::config::{LoraConfig, VlmConfig};
use crate::error::{Error, Result};
use crate::lora::LoraLinear;
use crate::ops;
use crate::quantize::{fake_quantize, Quantization};
use crate::tokenizer::Encoding;

// ── Provider seam ─────────────────────────────────────────────────────────

/// What the dynamic-vocabulary wrapper and the training model need from a
/// base model. The embedding table is tied: the same `[rows, hidden]`
/// tensor is the input embedding and the output head.
pub trait VisionLanguageModel {
    fn hidden_size(&self) -> usize;

    fn embedding_table(&self) -> &Tensor;

    /// Installs `table` as both input embedding and output head.
    fn set_embedding_table(&mut self, table: Tensor) -> Result<()>;

    /// Logits `[b, n, rows]` for the last `num_logits_to_keep` positions.
    /// `images` is `[b, patches, image_dim]` when the prompts carry an
    /// `<image>` run.
    fn forward(
        &self,
        inputs: &Encoding,
        images: Option<&Tensor>,
        num_logits_to_keep: usize,
    ) -> Result<Tensor>;

    fn set_training(&mut self, training: bool);

    fn lora_vars(&self) -> Vec<Var>;

    /// Named parameter stores, for checkpointing.
    fn var_maps(&self) -> Vec<(&'static str, &VarMap)>;

    fn device(&self) -> &Device;
}

// ── Frozen projection ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct FrozenLinear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl FrozenLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = x.broadcast_matmul(&self.weight.t()?)?;
        match &self.bias {
            Some(b) => Ok(y.broadcast_add(b)?),
            None => Ok(y),
        }
    }
}

/// Creates (or fetches) a base var, optionally snaps it to the quantization
/// grid in place, and hands back a detached view sharing its storage.
fn frozen_param(
    base: &VarMap,
    vb: &VarBuilder,
    name: &str,
    shape: (usize, usize),
    stdev: f64,
    quant: Quantization,
) -> Result<Tensor> {
    let w = vb.get_with_hints(shape, name, Init::Randn { mean: 0.0, stdev })?;
    if quant != Quantization::None {
        let q = fake_quantize(&w, quant)?;
        let data = base
            .data()
            .lock()
            .map_err(|_| Error::config("base parameter store lock poisoned"))?;
        match data.get(name) {
            Some(var) => var.set(&q)?,
            None => return Err(Error::config(format!("base parameter {name} missing"))),
        }
    }
    Ok(w.detach())
}

// ── Transformer block ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Block {
    q_proj: LoraLinear,
    k_proj: FrozenLinear,
    v_proj: LoraLinear,
    o_proj: FrozenLinear,
    fc1: FrozenLinear,
    fc2: FrozenLinear,
}

impl Block {
    fn attention(&self, x: &Tensor, bias: &Tensor, n_heads: usize, training: bool) -> Result<Tensor> {
        let (b, s, h) = x.dims3()?;
        let hd = h / n_heads;
        let heads = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((b, s, n_heads, hd))?.transpose(1, 2)?.contiguous()?)
        };
        let q = heads(self.q_proj.forward(x, training)?)?;
        let k = heads(self.k_proj.forward(x)?)?;
        let v = heads(self.v_proj.forward(x, training)?)?;

        let scores = (q.matmul(&k.t()?.contiguous()?)? / (hd as f64).sqrt())?;
        let att = ops::softmax_last_dim(&scores.broadcast_add(bias)?)?;
        let out = att
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, s, h))?;
        self.o_proj.forward(&out)
    }

    fn forward(&self, x: &Tensor, bias: &Tensor, n_heads: usize, training: bool) -> Result<Tensor> {
        let x = (x + self.attention(&ops::rms_norm(x)?, bias, n_heads, training)?)?;
        let mlp = self.fc2.forward(&ops::squared_relu(&self.fc1.forward(&ops::rms_norm(&x)?)?)?)?;
        Ok((x + mlp)?)
    }
}

// ── TinyVlm ───────────────────────────────────────────────────────────────

pub struct TinyVlm {
    cfg: VlmConfig,
    table: Tensor,
    wpe: Tensor,
    vision: FrozenLinear,
    blocks: Vec<Block>,
    base: VarMap,
    lora: VarMap,
    training: bool,
    device: Device,
}

impl TinyVlm {
    pub fn new(
        cfg: VlmConfig,
        lora_cfg: &LoraConfig,
        quant: Quantization,
        device: &Device,
    ) -> Result<Self> {
        cfg.validate()?;
        lora_cfg.validate()?;
        let base = VarMap::new();
        let lora = VarMap::new();
        let vb = VarBuilder::from_varmap(&base, DType::F32, device);
        let lvb = VarBuilder::from_varmap(&lora, DType::F32, device);
        let (h, m) = (cfg.hidden, cfg.mlp_dim);
        // GPT-2 style: residual outputs scaled down by 1/sqrt(2·layers)
        let std_in = 0.02;
        let std_out = 0.02 / (2.0 * cfg.n_layers as f64).sqrt();

        // Table, positions and vision projector are never quantized.
        let table = frozen_param(&base, &vb, "wte", (cfg.vocab_size, h), std_in, Quantization::None)?;
        let wpe = frozen_param(&base, &vb, "wpe", (cfg.max_seq_len, h), 0.01, Quantization::None)?;
        let vision = FrozenLinear {
            weight: frozen_param(&base, &vb, "vision.weight", (h, cfg.image_dim), std_in, Quantization::None)?,
            bias: Some(vb.get_with_hints(h, "vision.bias", Init::Const(0.0))?.detach()),
        };

        let mut blocks = Vec::with_capacity(cfg.n_layers);
        for li in 0..cfg.n_layers {
            let p = |n: &str| format!("layers.{li}.{n}");
            let frozen = |n: &str, shape: (usize, usize), std: f64| -> Result<FrozenLinear> {
                Ok(FrozenLinear { weight: frozen_param(&base, &vb, &p(n), shape, std, quant)?, bias: None })
            };
            let wq = frozen_param(&base, &vb, &p("q_proj"), (h, h), std_in, quant)?;
            let wv = frozen_param(&base, &vb, &p("v_proj"), (h, h), std_in, quant)?;
            blocks.push(Block {
                q_proj: LoraLinear::new(wq, lora_cfg, lvb.pp(p("q_proj")))?,
                k_proj: frozen("k_proj", (h, h), std_in)?,
                v_proj: LoraLinear::new(wv, lora_cfg, lvb.pp(p("v_proj")))?,
                o_proj: frozen("o_proj", (h, h), std_out)?,
                fc1: frozen("fc1", (m, h), std_in)?,
                fc2: frozen("fc2", (h, m), std_out)?,
            });
        }

        tracing::info!(
            rows = cfg.vocab_size,
            hidden = h,
            layers = cfg.n_layers,
            heads = cfg.n_heads,
            quantization = ?quant,
            lora_rank = lora_cfg.rank,
            "built TinyVlm"
        );

        Ok(Self { cfg, table, wpe, vision, blocks, base, lora, training: false, device: device.clone() })
    }

    pub fn config(&self) -> &VlmConfig {
        &self.cfg
    }

    /// Token embeddings with each row's `<image>` run replaced by the
    /// projected patches of that row's image.
    fn embed(&self, inputs: &Encoding, images: Option<&Tensor>) -> Result<Tensor> {
        let (b, s) = (inputs.batch_size(), inputs.seq_len());
        let flat = inputs.input_ids.flatten_all()?;
        let embeds = self
            .table
            .index_select(&flat, 0)?
            .reshape((b, s, self.cfg.hidden))?;

        let has_placeholders = inputs.ids.iter().flatten().any(|&id| id == self.cfg.image_token_id);
        let Some(images) = images else {
            return Ok(embeds);
        };
        if !has_placeholders {
            return Ok(embeds);
        }
        let (ib, patches, idim) = images.dims3()?;
        if ib != b || idim != self.cfg.image_dim {
            return Err(Error::config(format!(
                "images {:?} do not match batch {b} × image_dim {}", images.dims(), self.cfg.image_dim
            )));
        }
        let projected = self.vision.forward(images)?;

        let mut rows = Vec::with_capacity(b);
        for (bi, ids) in inputs.ids.iter().enumerate() {
            let row = embeds.get(bi)?;
            let Some(start) = ids.iter().position(|&id| id == self.cfg.image_token_id) else {
                rows.push(row);
                continue;
            };
            let run = ids[start..].iter().take_while(|&&id| id == self.cfg.image_token_id).count();
            let total = ids.iter().filter(|&&id| id == self.cfg.image_token_id).count();
            if run != patches || total != patches {
                return Err(Error::config(format!(
                    "row {bi} has {total} image placeholders (run of {run}), image has {patches} patches"
                )));
            }
            let mut parts = Vec::with_capacity(3);
            if start > 0 {
                parts.push(row.narrow(0, 0, start)?);
            }
            parts.push(projected.get(bi)?);
            if start + run < s {
                parts.push(row.narrow(0, start + run, s - start - run)?);
            }
            rows.push(Tensor::cat(&parts, 0)?);
        }
        Ok(Tensor::stack(&rows, 0)?)
    }
}

impl VisionLanguageModel for TinyVlm {
    fn hidden_size(&self) -> usize {
        self.cfg.hidden
    }

    fn embedding_table(&self) -> &Tensor {
        &self.table
    }

    fn set_embedding_table(&mut self, table: Tensor) -> Result<()> {
        let (rows, hidden) = table.dims2()?;
        if hidden != self.cfg.hidden || rows == 0 {
            return Err(Error::config(format!(
                "embedding table {:?} incompatible with hidden size {}", table.dims(), self.cfg.hidden
            )));
        }
        self.table = table;
        Ok(())
    }

    fn forward(
        &self,
        inputs: &Encoding,
        images: Option<&Tensor>,
        num_logits_to_keep: usize,
    ) -> Result<Tensor> {
        let s = inputs.seq_len();
        if s > self.cfg.max_seq_len {
            return Err(Error::config(format!(
                "sequence length {s} exceeds max_seq_len {}", self.cfg.max_seq_len
            )));
        }
        if num_logits_to_keep == 0 || num_logits_to_keep > s {
            return Err(Error::config(format!(
                "cannot keep {num_logits_to_keep} logits from a sequence of {s}"
            )));
        }

        let pos = ops::position_ids(&inputs.mask, &self.device)?.flatten_all()?;
        let pos_emb = self
            .wpe
            .index_select(&pos, 0)?
            .reshape((inputs.batch_size(), s, self.cfg.hidden))?;
        let mut x = (self.embed(inputs, images)? + pos_emb)?;

        let bias = ops::attention_bias(&inputs.mask, &self.device)?;
        for block in &self.blocks {
            x = block.forward(&x, &bias, self.cfg.n_heads, self.training)?;
        }

        let tail = ops::rms_norm(&x.narrow(1, s - num_logits_to_keep, num_logits_to_keep)?)?;
        Ok(tail.broadcast_matmul(&self.table.t()?)?)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn lora_vars(&self) -> Vec<Var> {
        self.lora.all_vars()
    }

    fn var_maps(&self) -> Vec<(&'static str, &VarMap)> {
        vec![("base", &self.base), ("lora", &self.lora)]
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Snapshot of every named parameter, keyed by the var's name.
pub fn named_tensors(maps: &[(&str, &VarMap)]) -> Result<HashMap<String, Tensor>> {
    let mut out = HashMap::new();
    for (prefix, map) in maps {
        let data = map
            .data()
            .lock()
            .map_err(|_| Error::Checkpoint(format!("{prefix} parameter store lock poisoned")))?;
        for (name, var) in data.iter() {
            out.insert(format!("{prefix}/{name}"), var.as_tensor().detach());
        }
    }
    Ok(out)
}

/// Small CPU model over `tok`'s vocabulary (4 padding rows, hidden 16).
#[cfg(test)]
pub(crate) fn test_model(
    tok: &crate::tokenizer::Tokenizer,
    quant: Quantization,
    image_dim: usize,
) -> Result<TinyVlm> {
    let mut cfg = VlmConfig::tiny(tok.vocab_size() + 4, tok.image_id);
    cfg.hidden = 16;
    cfg.n_heads = 2;
    cfg.mlp_dim = 32;
    cfg.image_dim = image_dim;
    cfg.max_seq_len = 96;
    let lora = LoraConfig { rank: 2, alpha: 4.0, dropout: 0.0 };
    TinyVlm::new(cfg, &lora, quant, &Device::Cpu)
}
