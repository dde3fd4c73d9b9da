/* ------------------------------------------------------------------ */
/* Dynamic vocabulary: per-step injection of embedding-valued tokens */
/* ------------------------------------------------------------------ */
//
// With boundary B and N new embeddings the installed table is
//
//   rows[0 ..= B]  ++  new[0 .. N]  ++  rows[B+1 ..]
//
// so `<SEG_MASK_k>` (id B+k) looks up the k-th injected row, and every base
// row above B moves up by N. The table is tied, so the same rows also
// appear as N extra logit columns.
//
// `inject` hands out a `VocabExtension` that mutably borrows the wrapper;
// dropping it restores the frozen snapshot. At most one extension exists
// at a time and every step starts from the same baseline.

use std::ops::Range;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

use crate::error::{Error, Result};
use crate::model::VisionLanguageModel;
use crate::tokenizer::Encoding;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VocabState {
    Baseline,
    Extended { injected: usize },
}

pub struct DynamicVocabModel<M: VisionLanguageModel> {
    model: M,
    boundary: usize,
    original: Tensor,
    original_rows: usize,
    state: VocabState,
    poisoned: bool,
}

impl<M: VisionLanguageModel> DynamicVocabModel<M> {
    /// `boundary` is the tokenizer's base vocabulary size; the table needs a
    /// row at that index to anchor the insertion window.
    pub fn new(model: M, boundary: usize) -> Result<Self> {
        let original = model.embedding_table().clone();
        let (rows, _) = original.dims2()?;
        if boundary >= rows {
            return Err(Error::config(format!(
                "vocabulary boundary {boundary} needs a table with more than {boundary} rows, got {rows}"
            )));
        }
        Ok(Self {
            model,
            boundary,
            original,
            original_rows: rows,
            state: VocabState::Baseline,
            poisoned: false,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn boundary(&self) -> usize {
        self.boundary
    }

    /// Rows of the frozen table.
    pub fn original_vocab_size(&self) -> usize {
        self.original_rows
    }

    /// Rows of the table currently installed in the model.
    pub fn vocab_size(&self) -> usize {
        self.model.embedding_table().dims().first().copied().unwrap_or(0)
    }

    pub fn state(&self) -> VocabState {
        self.state
    }

    pub fn is_extended(&self) -> bool {
        matches!(self.state, VocabState::Extended { .. })
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn hidden_size(&self) -> usize {
        self.model.hidden_size()
    }

    /// Installs `new_embeddings` (`[N, hidden]`) above the boundary. The
    /// rows are detached: gradient reaches them only through the returned
    /// extension's table var.
    pub fn inject(&mut self, new_embeddings: &Tensor) -> Result<VocabExtension<'_, M>> {
        if self.poisoned {
            return Err(Error::corrupted("wrapper poisoned by an earlier failed reset"));
        }
        if let VocabState::Extended { injected } = self.state {
            return Err(Error::corrupted(format!(
                "inject while {injected} tokens from a previous step are still injected"
            )));
        }
        let (n, dim) = new_embeddings.dims2()?;
        let (rows, hidden) = self.original.dims2()?;
        if dim != hidden {
            return Err(Error::config(format!(
                "injected embedding dim {dim} does not match table hidden size {hidden}"
            )));
        }

        let split = self.boundary + 1;
        let mut parts = vec![self.original.narrow(0, 0, split)?];
        if n > 0 {
            parts.push(new_embeddings.detach().to_dtype(self.original.dtype())?);
        }
        if rows > split {
            parts.push(self.original.narrow(0, split, rows - split)?);
        }
        // Var::from_tensor copies: the snapshot never aliases a trainable table.
        let table = Var::from_tensor(&Tensor::cat(&parts, 0)?)?;
        self.model.set_embedding_table(table.as_tensor().clone())?;
        self.state = VocabState::Extended { injected: n };
        tracing::debug!(injected = n, rows = rows + n, "vocabulary extended");

        Ok(VocabExtension { owner: self, table, injected: n, released: false })
    }

    /// Injects, then runs one forward pass keeping logits for the last
    /// `num_to_produce` positions: `[b, num_to_produce, rows + N]`.
    pub fn generate_step(
        &mut self,
        inputs: &Encoding,
        images: Option<&Tensor>,
        new_embeddings: &Tensor,
        num_to_produce: usize,
    ) -> Result<(VocabExtension<'_, M>, Tensor)> {
        let ext = self.inject(new_embeddings)?;
        let logits = ext.forward(inputs, images, num_to_produce)?;
        Ok((ext, logits))
    }

    /// Restores the frozen table. Legal exactly once per injection.
    pub fn reset(&mut self) -> Result<()> {
        let VocabState::Extended { injected } = self.state else {
            return Err(Error::corrupted("reset called while the vocabulary is at baseline"));
        };
        if let Err(e) = self.model.set_embedding_table(self.original.clone()) {
            self.poisoned = true;
            return Err(e);
        }
        let rows = self.vocab_size();
        if rows != self.original_rows {
            self.poisoned = true;
            return Err(Error::corrupted(format!(
                "table has {rows} rows after reset, expected {}", self.original_rows
            )));
        }
        self.state = VocabState::Baseline;
        tracing::debug!(removed = injected, rows, "vocabulary reset");
        Ok(())
    }

    /// Re-snapshots the installed table (after loading weights). Baseline only.
    pub fn rebaseline(&mut self) -> Result<()> {
        if self.is_extended() || self.poisoned {
            return Err(Error::corrupted("rebaseline requires a healthy baseline state"));
        }
        let original = self.model.embedding_table().clone();
        let (rows, _) = original.dims2()?;
        if self.boundary >= rows {
            return Err(Error::config(format!(
                "reloaded table has {rows} rows, boundary is {}", self.boundary
            )));
        }
        self.original = original;
        self.original_rows = rows;
        Ok(())
    }
}

// ── Scoped extension ──────────────────────────────────────────────────────

/// A live vocabulary extension. Resets the wrapper on drop; use
/// [`VocabExtension::release`] to observe reset errors.
pub struct VocabExtension<'a, M: VisionLanguageModel> {
    owner: &'a mut DynamicVocabModel<M>,
    table: Var,
    injected: usize,
    released: bool,
}

impl<'a, M: VisionLanguageModel> VocabExtension<'a, M> {
    pub fn injected(&self) -> usize {
        self.injected
    }

    /// Table indices holding the injected rows: `B+1 .. B+1+N`.
    pub fn window(&self) -> Range<usize> {
        let start = self.owner.boundary + 1;
        start..start + self.injected
    }

    /// The installed (trainable) table.
    pub fn table(&self) -> &Var {
        &self.table
    }

    pub fn model(&self) -> &M {
        &self.owner.model
    }

    pub fn forward(
        &self,
        inputs: &Encoding,
        images: Option<&Tensor>,
        num_logits_to_keep: usize,
    ) -> Result<Tensor> {
        self.owner.model.forward(inputs, images, num_logits_to_keep)
    }

    /// Detached gradient of the injected rows, `[N, hidden]`. `None` when
    /// nothing was injected or the table took no part in the loss.
    pub fn injected_row_grad(&self, grads: &GradStore) -> Result<Option<Tensor>> {
        if self.injected == 0 {
            return Ok(None);
        }
        let Some(g) = grads.get(self.table.as_tensor()) else {
            return Ok(None);
        };
        Ok(Some(g.narrow(0, self.owner.boundary + 1, self.injected)?.detach()))
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.owner.reset()
    }
}

impl<M: VisionLanguageModel> Drop for VocabExtension<'_, M> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.owner.reset() {
            // Drop cannot propagate; the wrapper refuses further injections.
            self.owner.poisoned = true;
            tracing::error!(error = %e, "vocabulary reset failed; wrapper poisoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_END_TURN;
    use crate::model::test_model;
    use crate::quantize::Quantization;
    use crate::tokenizer::Tokenizer;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn setup() -> Result<(Tokenizer, DynamicVocabModel<crate::model::TinyVlm>)> {
        let tok = Tokenizer::from_text("mask the dog", DEFAULT_END_TURN, 2)?;
        let vlm = test_model(&tok, Quantization::None, 8)?;
        let b = tok.vocab_size();
        Ok((tok, DynamicVocabModel::new(vlm, b)?))
    }

    fn rows(t: &Tensor) -> Vec<Vec<f32>> {
        t.to_vec2::<f32>().unwrap()
    }

    #[test]
    fn round_trip_is_bit_identical() -> Result<()> {
        let (_, mut dv) = setup()?;
        let before = rows(dv.model().embedding_table());
        let new = Tensor::randn(0f32, 1.0, (3, 16), &Device::Cpu)?;
        let ext = dv.inject(&new)?;
        assert_eq!(ext.model().embedding_table().dims()[0], before.len() + 3);
        ext.release()?;
        assert_eq!(rows(dv.model().embedding_table()), before);
        assert_eq!(dv.vocab_size(), dv.original_vocab_size());
        assert_eq!(dv.state(), VocabState::Baseline);
        Ok(())
    }

    #[test]
    fn injected_rows_sit_above_the_boundary() -> Result<()> {
        let (_, mut dv) = setup()?;
        let b = dv.boundary();
        let before = rows(dv.model().embedding_table());
        let new = Tensor::randn(0f32, 1.0, (2, 16), &Device::Cpu)?;
        let ext = dv.inject(&new)?;
        let after = rows(ext.table().as_tensor());
        assert_eq!(&after[..=b], &before[..=b]);
        assert_eq!(&after[b + 1..b + 3], rows(&new).as_slice());
        assert_eq!(&after[b + 3..], &before[b + 1..]);
        assert_eq!(ext.window(), b + 1..b + 3);
        Ok(())
    }

    #[test]
    fn dropping_the_extension_resets() -> Result<()> {
        let (_, mut dv) = setup()?;
        {
            let _ext = dv.inject(&Tensor::zeros((4, 16), DType::F32, &Device::Cpu)?)?;
        }
        assert!(!dv.is_extended());
        assert_eq!(dv.vocab_size(), dv.original_vocab_size());
        Ok(())
    }

    #[test]
    fn double_reset_and_overlapping_injects_are_corruption() -> Result<()> {
        let (_, mut dv) = setup()?;
        let new = Tensor::zeros((1, 16), DType::F32, &Device::Cpu)?;
        dv.inject(&new)?.release()?;
        let err = dv.reset().unwrap_err();
        assert!(matches!(err, Error::StateCorruption(_)));

        // a leaked extension never resets
        std::mem::forget(dv.inject(&new)?);
        let err = dv.inject(&new).err().expect("second inject must fail");
        assert!(matches!(err, Error::StateCorruption(_)));
        dv.reset()?;
        assert!(dv.inject(&new).is_ok());
        Ok(())
    }

    #[test]
    fn wrong_embedding_width_is_config_error() -> Result<()> {
        let (_, mut dv) = setup()?;
        let err = dv.inject(&Tensor::zeros((2, 7), DType::F32, &Device::Cpu)?).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert!(!dv.is_extended());
        Ok(())
    }

    #[test]
    fn generate_step_widens_logits_and_routes_row_grads() -> Result<()> {
        let (tok, mut dv) = setup()?;
        let b = tok.vocab_size();
        let enc = tok.encode_batch(&[format!("dog {}", crate::tokenizer::mask_token(2))], &Device::Cpu)?;
        let new = Tensor::randn(0f32, 1.0, (2, 16), &Device::Cpu)?;
        let (ext, logits) = dv.generate_step(&enc, None, &new, 2)?;
        assert_eq!(logits.dims(), &[1, 2, b + 4 + 2]);

        let grads = logits.sum_all()?.backward()?;
        let g = ext.injected_row_grad(&grads)?.expect("injected rows receive gradient");
        assert_eq!(g.dims(), &[2, 16]);
        drop(ext);
        assert!(!dv.is_extended());
        Ok(())
    }

    // ── failure injection ───────────────────────────────────────────────

    struct FlakyModel {
        table: Tensor,
        fail_restore: bool,
        device: Device,
    }

    impl VisionLanguageModel for FlakyModel {
        fn hidden_size(&self) -> usize { 4 }
        fn embedding_table(&self) -> &Tensor { &self.table }
        fn set_embedding_table(&mut self, table: Tensor) -> Result<()> {
            if self.fail_restore && table.dims()[0] < self.table.dims()[0] {
                return Err(Error::Checkpoint("device lost".into()));
            }
            self.table = table;
            Ok(())
        }
        fn forward(&self, _: &Encoding, _: Option<&Tensor>, _: usize) -> Result<Tensor> {
            Ok(self.table.clone())
        }
        fn set_training(&mut self, _: bool) {}
        fn lora_vars(&self) -> Vec<Var> { Vec::new() }
        fn var_maps(&self) -> Vec<(&'static str, &VarMap)> { Vec::new() }
        fn device(&self) -> &Device { &self.device }
    }

    #[test]
    fn failed_reset_in_drop_poisons_the_wrapper() -> Result<()> {
        let model = FlakyModel {
            table: Tensor::zeros((6, 4), DType::F32, &Device::Cpu)?,
            fail_restore: true,
            device: Device::Cpu,
        };
        let mut dv = DynamicVocabModel::new(model, 3)?;
        let new = Tensor::ones((2, 4), DType::F32, &Device::Cpu)?;
        drop(dv.inject(&new)?);
        assert!(dv.is_poisoned());
        let err = dv.inject(&new).err().unwrap();
        assert!(matches!(err, Error::StateCorruption(_)));
        assert!(err.is_fatal());
        Ok(())
    }

    #[test]
    fn boundary_must_lie_inside_the_table() -> Result<()> {
        let model = FlakyModel {
            table: Tensor::zeros((3, 4), DType::F32, &Device::Cpu)?,
            fail_restore: false,
            device: Device::Cpu,
        };
        assert!(DynamicVocabModel::new(model, 3).is_err());
        Ok(())
    }
}
