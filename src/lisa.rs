/* ------------------------------------------------------------------ */
/* Training model: adapter + dynamic vocabulary + base VLM           */
/* ------------------------------------------------------------------ */
//
// One optimisation step:
//
//   gt_embs ─adapter─┐                       (refs 1..P, batch-global)
//   sam_embs ─adapter┴─ new tokens ─detach─ inject ─ forward ─ loss
//                 ▲                                              │
//                 └──── propagate(rows B+1..B+1+N of ∂L/∂table) ◄┘
//
// Prompts and labels are left-padded separately. The prompt ends with the
// label tokens, so dropping its last token and keeping the last L logits
// lines position j of the tail up with label token j.

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::VarMap;

use crate::adapter::SegAdapter;
use crate::config::{ModelParams, IMAGE_TOKEN};
use crate::data::Batch;
use crate::dynamic_vocab::DynamicVocabModel;
use crate::error::{Error, Result};
use crate::metrics::MaskIndexLayout;
use crate::model::VisionLanguageModel;
use crate::ops;
use crate::optimizer::JointOptimizer;
use crate::tokenizer::{mask_token, ChatTurn, Tokenizer};

pub struct StepOutput {
    /// `[b, L, rows + N]`, detached.
    pub logits: Tensor,
    /// Scalar loss, detached.
    pub loss: Tensor,
    pub loss_value: f32,
    pub injected: usize,
}

pub struct Generation {
    pub texts: Vec<String>,
    pub tokens: Vec<Vec<u32>>,
    pub layout: MaskIndexLayout,
}

/// Per-batch prompt material shared by training and generation.
pub(crate) struct Prepared {
    pub prompts: Vec<String>,
    pub labels: Vec<String>,
    /// Adapter outputs, positives then negatives, still on the graph.
    pub new_tokens: Tensor,
    pub images: Tensor,
    pub layout: MaskIndexLayout,
}

pub struct LisaModel<M: VisionLanguageModel> {
    vocab: DynamicVocabModel<M>,
    tokenizer: Tokenizer,
    adapter: SegAdapter,
    params: ModelParams,
}

impl<M: VisionLanguageModel> LisaModel<M> {
    pub fn new(base: M, tokenizer: Tokenizer, region_dim: usize, params: ModelParams) -> Result<Self> {
        params.validate()?;
        let quantization = params.quantization()?;
        if tokenizer.end_turn() != params.end_turn_token {
            return Err(Error::config(format!(
                "tokenizer end-of-turn {:?} differs from model params {:?}",
                tokenizer.end_turn(), params.end_turn_token
            )));
        }
        let adapter = SegAdapter::new(region_dim, base.hidden_size(), base.device())?;
        let vocab = DynamicVocabModel::new(base, tokenizer.vocab_size())?;
        tracing::info!(
            region_dim,
            hidden = vocab.hidden_size(),
            boundary = vocab.boundary(),
            table_rows = vocab.original_vocab_size(),
            ?quantization,
            "LISA model ready"
        );
        Ok(Self { vocab, tokenizer, adapter, params })
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn adapter(&self) -> &SegAdapter {
        &self.adapter
    }

    pub fn vocab(&self) -> &DynamicVocabModel<M> {
        &self.vocab
    }

    pub fn vocab_mut(&mut self) -> &mut DynamicVocabModel<M> {
        &mut self.vocab
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    pub fn boundary(&self) -> usize {
        self.vocab.boundary()
    }

    pub fn set_training(&mut self, training: bool) {
        self.vocab.model_mut().set_training(training);
    }

    /// (adapter vars, LoRA vars): the two optimizer groups.
    pub fn trainable_groups(&self) -> (Vec<Var>, Vec<Var>) {
        (self.adapter.vars(), self.vocab.model().lora_vars())
    }

    /// Every parameter store, base and LoRA first, then the adapter.
    pub fn var_maps(&self) -> Vec<(&'static str, &VarMap)> {
        let mut maps = self.vocab.model().var_maps();
        maps.push(("adapter", self.adapter.var_map()));
        maps
    }

    // ── prompt construction ─────────────────────────────────────────────

    pub(crate) fn prepare(&self, batch: &Batch, with_answers: bool) -> Result<Prepared> {
        let layout = MaskIndexLayout::new(&batch.region_counts());
        if layout.total() > self.tokenizer.max_mask_tokens() {
            return Err(Error::config(format!(
                "batch needs {} mask references, tokenizer has {}",
                layout.total(), self.tokenizer.max_mask_tokens()
            )));
        }

        let mut pieces = Vec::with_capacity(2 * batch.len());
        let mut prompts = Vec::with_capacity(batch.len());
        let mut labels = Vec::with_capacity(batch.len());
        for (i, ex) in batch.examples.iter().enumerate() {
            pieces.push(self.adapter.forward(&ex.gt_embs)?);
            let mut content = ex.answer.clone();
            for k in layout.positive_range(i) {
                content.push(' ');
                content.push_str(&mask_token(k));
            }
            let user = ChatTurn::user(format!("{IMAGE_TOKEN}\n{}", ex.query));
            let prompt = if with_answers {
                self.tokenizer.apply_chat_template(&[user, ChatTurn::assistant(content.clone())], false)
            } else {
                self.tokenizer.apply_chat_template(&[user], true)
            };
            prompts.push(prompt);
            labels.push(format!("{content}{}", self.tokenizer.end_turn()));
        }
        for ex in &batch.examples {
            pieces.push(self.adapter.forward(&ex.sam_embs)?);
        }

        let new_tokens = Tensor::cat(&pieces, 0)?;
        let images: Vec<Tensor> = batch.examples.iter().map(|e| e.image.clone()).collect();
        let images = Tensor::stack(&images, 0)?.to_dtype(DType::F32)?;
        Ok(Prepared { prompts, labels, new_tokens, images, layout })
    }

    // ── training ─────────────────────────────────────────────────────────

    pub fn optim_step(&mut self, batch: &Batch, optimizer: &mut JointOptimizer) -> Result<StepOutput> {
        let device = self.vocab.model().device().clone();
        if batch.is_empty() {
            let zero = Tensor::zeros((), DType::F32, &device)?;
            return Ok(StepOutput {
                logits: Tensor::zeros((0, 0, 0), DType::F32, &device)?,
                loss: zero,
                loss_value: 0.0,
                injected: 0,
            });
        }

        let prep = self.prepare(batch, true)?;
        let prompt_enc = self.tokenizer.encode_batch(&prep.prompts, &device)?;
        let label_enc = self.tokenizer.encode_batch(&prep.labels, &device)?;
        let inputs = prompt_enc.truncate_tail(1, &device)?;
        let num_generate = label_enc.seq_len();

        let (ext, logits) =
            self.vocab.generate_step(&inputs, Some(&prep.images), &prep.new_tokens, num_generate)?;
        let loss = ops::masked_one_hot_bce(&logits, &label_enc.input_ids, &label_enc.attention_mask)?;

        // Adapter outputs were detached on injection, so this store holds
        // LoRA gradients and the table gradient only.
        let mut grads = loss.backward()?;
        if let Some(row_grad) = ext.injected_row_grad(&grads)? {
            let adapter_grads = self.adapter.propagate(&prep.new_tokens, &row_grad)?;
            merge_grads(&mut grads, &adapter_grads, &self.adapter.vars())?;
        }
        optimizer.step(&grads)?;
        let injected = ext.injected();
        ext.release()?;

        let loss_value = loss.to_scalar::<f32>()?;
        Ok(StepOutput { logits: logits.detach(), loss: loss.detach(), loss_value, injected })
    }

    // ── inference ────────────────────────────────────────────────────────

    /// Greedy decoding with the batch's regions injected. Each row stops
    /// at the end-of-turn token (kept in `tokens`).
    pub fn generate(&mut self, batch: &Batch, max_new_tokens: usize) -> Result<Generation> {
        if batch.is_empty() {
            return Ok(Generation { texts: Vec::new(), tokens: Vec::new(), layout: MaskIndexLayout::new(&[]) });
        }
        let device = self.vocab.model().device().clone();
        let prep = self.prepare(batch, false)?;
        let new_tokens = prep.new_tokens.detach();
        let mut enc = self.tokenizer.encode_batch(&prep.prompts, &device)?;

        let stop = self.tokenizer.end_turn_id;
        let pad = self.tokenizer.pad_id;
        let mut tokens: Vec<Vec<u32>> = vec![Vec::new(); batch.len()];
        let mut done = vec![false; batch.len()];

        let ext = self.vocab.inject(&new_tokens)?;
        for step in 0..max_new_tokens {
            let logits = ext.forward(&enc, Some(&prep.images), 1)?.squeeze(1)?.detach();
            let next = ops::argmax_last(&logits)?;
            for (i, &id) in next.iter().enumerate() {
                if !done[i] {
                    tokens[i].push(id);
                    done[i] = id == stop;
                }
            }
            if done.iter().all(|&d| d) || step + 1 == max_new_tokens {
                break;
            }
            let column: Vec<u32> = next.iter().zip(&done).map(|(&id, &d)| if d { pad } else { id }).collect();
            enc = enc.push_column(&column, &device)?;
        }
        ext.release()?;

        let texts: Vec<String> = tokens.iter().map(|t| self.tokenizer.decode(t, true)).collect();
        for (i, text) in texts.iter().enumerate() {
            tracing::debug!(example = i, generated = %text, "generation");
        }
        Ok(Generation { texts, tokens, layout: prep.layout })
    }
}

/// Adds `extra`'s gradients for `vars` into `grads`.
fn merge_grads(grads: &mut GradStore, extra: &GradStore, vars: &[Var]) -> Result<()> {
    for var in vars {
        let Some(g) = extra.get(var.as_tensor()) else { continue };
        let merged = match grads.remove(var.as_tensor()) {
            Some(existing) => (existing + g)?,
            None => g.clone(),
        };
        grads.insert(var.as_tensor(), merged);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizerConfig;
    use crate::data::{synthetic_corpus, Example};
    use crate::model::{test_model, TinyVlm};
    use crate::quantize::Quantization;
    use candle_core::Device;

    const REGION_DIM: usize = 6;
    const IMAGE_DIM: usize = 4;
    const PATCHES: usize = 2;

    fn model() -> Result<LisaModel<TinyVlm>> {
        let tok = Tokenizer::from_text(&synthetic_corpus(), crate::config::DEFAULT_END_TURN, PATCHES)?;
        let vlm = test_model(&tok, Quantization::Q4, IMAGE_DIM)?;
        LisaModel::new(vlm, tok, REGION_DIM, ModelParams::default())
    }

    fn example(query: &str, answer: &str, n_pos: usize, n_neg: usize, seed: u64) -> Result<Example> {
        let dev = Device::Cpu;
        let r = |n: usize, s: u64| Tensor::randn(0f32, 1.0, (n, REGION_DIM), &dev).map(|t| (t * (s as f64 + 1.0)).unwrap());
        Ok(Example {
            query: query.into(),
            answer: answer.into(),
            image: Tensor::randn(0f32, 1.0, (PATCHES, IMAGE_DIM), &dev)?,
            gt_embs: r(n_pos, seed)?,
            sam_embs: r(n_neg, seed + 1)?,
        })
    }

    fn two_by_one_one() -> Result<Batch> {
        Ok(Batch {
            examples: vec![
                example("segment the red car", "the red car", 1, 1, 0)?,
                example("segment the blue dog", "the blue dog", 1, 1, 2)?,
            ],
        })
    }

    #[test]
    fn labels_carry_one_reference_before_end_marker() -> Result<()> {
        let lisa = model()?;
        let prep = lisa.prepare(&two_by_one_one()?, true)?;
        let tok = lisa.tokenizer();
        assert_eq!(prep.new_tokens.dims(), &[4, 16]);
        for (i, label) in prep.labels.iter().enumerate() {
            let ids = tok.encode(label);
            let refs: Vec<usize> = ids.iter().filter_map(|&id| tok.mask_index(id)).collect();
            assert_eq!(refs, vec![i + 1]);
            let end = ids.iter().position(|&id| id == tok.end_turn_id).unwrap();
            assert_eq!(tok.mask_index(ids[end - 1]), Some(i + 1));
            // the prompt ends with exactly the label tokens
            assert!(tok.encode(&prep.prompts[i]).ends_with(&ids));
        }
        assert_eq!(prep.layout.negative_range(0), 3..4);
        assert_eq!(prep.layout.negative_range(1), 4..5);
        Ok(())
    }

    #[test]
    fn optim_step_injects_routes_and_restores() -> Result<()> {
        let mut lisa = model()?;
        lisa.set_training(true);
        let (adapter_vars, lora_vars) = lisa.trainable_groups();
        let before: Vec<Vec<f32>> = adapter_vars
            .iter()
            .map(|v| v.as_tensor().flatten_all().and_then(|t| t.to_vec1::<f32>()).unwrap())
            .collect();
        let rows = lisa.vocab().vocab_size();
        let mut opt = JointOptimizer::new(
            adapter_vars.clone(),
            lora_vars,
            &OptimizerConfig { adapter_lr: 1e-2, lora_lr: 1e-2 },
        )?;

        let out = lisa.optim_step(&two_by_one_one()?, &mut opt)?;
        assert_eq!(out.injected, 4);
        assert_eq!(out.logits.dims()[2], rows + 4);
        assert!(out.loss_value.is_finite() && out.loss_value > 0.0);
        assert_eq!(lisa.vocab().vocab_size(), rows);
        assert!(!lisa.vocab().is_extended());

        // the adapter learned through the injected rows
        let moved = adapter_vars.iter().zip(&before).any(|(v, b)| {
            let now = v.as_tensor().flatten_all().and_then(|t| t.to_vec1::<f32>()).unwrap();
            now.iter().zip(b).any(|(x, y)| x != y)
        });
        assert!(moved);
        Ok(())
    }

    #[test]
    fn generate_restores_vocab_and_reports_layout() -> Result<()> {
        let mut lisa = model()?;
        let rows = lisa.vocab().vocab_size();
        let gen = lisa.generate(&two_by_one_one()?, 5)?;
        assert_eq!(gen.tokens.len(), 2);
        assert!(gen.tokens.iter().all(|t| !t.is_empty() && t.len() <= 5));
        assert_eq!(gen.layout.total(), 4);
        assert_eq!(lisa.vocab().vocab_size(), rows);
        Ok(())
    }

    #[test]
    fn mask_budget_and_region_dim_are_enforced() -> Result<()> {
        let mut lisa = model()?;
        let dev = Device::Cpu;
        let mut huge = example("segment the car", "the car", 1, 0, 0)?;
        huge.gt_embs = Tensor::zeros((500, REGION_DIM), DType::F32, &dev)?;
        let batch = Batch { examples: vec![huge] };
        assert!(matches!(lisa.generate(&batch, 2), Err(Error::Config(_))));

        let mut wrong = example("segment the car", "the car", 1, 0, 0)?;
        wrong.gt_embs = Tensor::zeros((1, REGION_DIM + 1), DType::F32, &dev)?;
        let batch = Batch { examples: vec![wrong] };
        assert!(matches!(lisa.generate(&batch, 2), Err(Error::Config(_))));
        assert!(!lisa.vocab().is_extended());
        Ok(())
    }

    #[test]
    fn conflicting_quantization_rejected_at_construction() -> Result<()> {
        let tok = Tokenizer::from_text(&synthetic_corpus(), crate::config::DEFAULT_END_TURN, PATCHES)?;
        let vlm = test_model(&tok, Quantization::None, IMAGE_DIM)?;
        let params = ModelParams { q4: true, q8: true, ..Default::default() };
        assert!(LisaModel::new(vlm, tok, REGION_DIM, params).is_err());
        Ok(())
    }

    #[test]
    fn empty_batch_is_a_no_op() -> Result<()> {
        let mut lisa = model()?;
        let (a, l) = lisa.trainable_groups();
        let mut opt = JointOptimizer::new(a, l, &OptimizerConfig::default())?;
        let out = lisa.optim_step(&Batch::default(), &mut opt)?;
        assert_eq!((out.injected, out.loss_value), (0, 0.0));
        assert!(lisa.generate(&Batch::default(), 3)?.tokens.is_empty());
        Ok(())
    }
}
