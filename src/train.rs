/* ------------------------------------------------------------------ */
/* Training loop, validation, testing, best-model checkpointing      */
/* ------------------------------------------------------------------ */
//
//   for epoch:  train ─► (every val_every, and last) validate ─► save if F1 ↑
//   then:       reload best ─► test ─► final save
//
// Ctrl-C is honoured between steps only: a step always completes (and
// resets the vocabulary) before the flag is looked at.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use crate::checkpoint::{BestF1, CheckpointMeta, CheckpointStore};
use crate::config::ExperimentConfig;
use crate::data::DataLoader;
use crate::error::Result;
use crate::lisa::LisaModel;
use crate::metrics::{score_batch, MetricsAccumulator, Scores};
use crate::model::VisionLanguageModel;
use crate::optimizer::JointOptimizer;
use crate::tracking::{metrics, Tracker};

pub struct Loaders {
    pub train: DataLoader,
    pub val: DataLoader,
    pub test: DataLoader,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochOutcome {
    pub avg_loss: f64,
    pub batches: usize,
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvalReport {
    pub scores: Scores,
    pub random: Scores,
    pub examples: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentSummary {
    pub experiment: String,
    pub epochs_run: usize,
    pub final_train_loss: f64,
    pub best_val_f1: Option<f64>,
    pub test: Option<EvalReport>,
    pub interrupted: bool,
    pub checkpoint: PathBuf,
}

/* ------------------------------------------------------------------ */
/* One epoch of optimisation steps                                    */
/* ------------------------------------------------------------------ */
#[allow(clippy::too_many_arguments)]
pub fn train_epoch<M: VisionLanguageModel>(
    model: &mut LisaModel<M>,
    loader: &mut DataLoader,
    optimizer: &mut JointOptimizer,
    epoch: usize,
    epochs: usize,
    log_interval: usize,
    global_step: &mut usize,
    tracker: &mut dyn Tracker,
    interrupt: &AtomicBool,
) -> Result<EpochOutcome> {
    model.set_training(true);
    let batches = loader.batches();
    let total = batches.len();
    let mut sum = 0.0f64;
    let mut done = 0usize;
    let mut interrupted = false;

    for (i, batch) in batches.iter().enumerate() {
        if interrupt.load(Ordering::Relaxed) {
            interrupted = true;
            break;
        }
        let out = model.optim_step(batch, optimizer)?;
        let loss = out.loss_value as f64;
        sum += loss;
        done += 1;
        *global_step += 1;

        if (i + 1) % log_interval == 0 || i + 1 == total {
            tracing::info!(
                "Epoch {}/{} | batch {:>4}/{} | loss {:.4} | injected {}",
                epoch + 1, epochs, i + 1, total, loss, out.injected
            );
            tracker.log(*global_step, &metrics([("train/loss", loss)]))?;
        }
    }

    let avg_loss = if done > 0 { sum / done as f64 } else { 0.0 };
    Ok(EpochOutcome { avg_loss, batches: done, interrupted })
}

/* ------------------------------------------------------------------ */
/* Generation-based evaluation (validation and test)                 */
/* ------------------------------------------------------------------ */
pub fn evaluate<M: VisionLanguageModel>(
    model: &mut LisaModel<M>,
    loader: &mut DataLoader,
    max_new_tokens: usize,
) -> Result<EvalReport> {
    model.set_training(false);
    let boundary = model.boundary();
    let mut acc = MetricsAccumulator::new();
    for batch in loader.batches() {
        let gen = model.generate(&batch, max_new_tokens)?;
        acc.extend(&score_batch(&gen.tokens, &gen.layout, boundary));
    }
    let (scores, random) = acc.averages();
    Ok(EvalReport { scores, random, examples: acc.count() })
}

fn log_report(stage: &str, r: &EvalReport) {
    tracing::info!("{stage} ({} examples)", r.examples);
    tracing::info!("Accuracy:  {:.4} vs (rand) {:.4}", r.scores.accuracy, r.random.accuracy);
    tracing::info!("Precision: {:.4} vs (rand) {:.4}", r.scores.precision, r.random.precision);
    tracing::info!("Recall:    {:.4} vs (rand) {:.4}", r.scores.recall, r.random.recall);
    tracing::info!("F1:        {:.4} vs (rand) {:.4}", r.scores.f1, r.random.f1);
}

fn report_metrics(prefix: &str, r: &EvalReport) -> Vec<(String, f64)> {
    let mut m = r.scores.named(prefix);
    m.extend(r.random.named(&format!("{prefix}/rand")));
    m
}

fn save<M: VisionLanguageModel>(
    store: &CheckpointStore,
    model: &LisaModel<M>,
    experiment: &str,
    epoch: usize,
    val_f1: Option<f64>,
) -> Result<PathBuf> {
    let meta = CheckpointMeta {
        experiment: experiment.to_string(),
        epoch,
        val_f1,
        boundary: model.boundary(),
        table_rows: model.vocab().original_vocab_size(),
    };
    store.save(&model.var_maps(), &meta)
}

/* ------------------------------------------------------------------ */
/* Full experiment                                                    */
/* ------------------------------------------------------------------ */
pub fn run_experiment<M: VisionLanguageModel>(
    experiment: &str,
    cfg: &ExperimentConfig,
    model: &mut LisaModel<M>,
    loaders: &mut Loaders,
    store: &CheckpointStore,
    tracker: &mut dyn Tracker,
    interrupt: &AtomicBool,
) -> Result<ExperimentSummary> {
    cfg.validate()?;
    tracing::info!("=== Running Experiment: {experiment} ===");
    tracing::info!(
        epochs = cfg.epochs,
        val_every = cfg.val_every,
        log_interval = cfg.log_interval,
        train_batches = loaders.train.len(),
        val_batches = loaders.val.len(),
        test_batches = loaders.test.len(),
        cores = rayon::current_num_threads(),
        "starting training"
    );

    let (adapter_vars, lora_vars) = model.trainable_groups();
    let mut optimizer = JointOptimizer::new(adapter_vars, lora_vars, &cfg.optimizer)?;
    let mut best = BestF1::default();
    let mut improved = false;
    let mut global_step = 0usize;
    let mut epochs_run = 0usize;
    let mut final_train_loss = 0.0;
    let mut interrupted = false;

    for epoch in 0..cfg.epochs {
        if interrupt.load(Ordering::Relaxed) {
            interrupted = true;
            break;
        }
        let out = train_epoch(
            model,
            &mut loaders.train,
            &mut optimizer,
            epoch,
            cfg.epochs,
            cfg.log_interval,
            &mut global_step,
            tracker,
            interrupt,
        )?;
        epochs_run = epoch + 1;
        final_train_loss = out.avg_loss;
        tracing::info!("Epoch {}/{} - Train Loss: {:.4}", epoch + 1, cfg.epochs, out.avg_loss);
        tracker.log(global_step, &metrics([("train/avg_loss", out.avg_loss), ("epoch", (epoch + 1) as f64)]))?;
        if out.interrupted {
            interrupted = true;
            break;
        }

        if cfg.is_validation_epoch(epoch) {
            let report = evaluate(model, &mut loaders.val, cfg.max_new_tokens)?;
            log_report(&format!("Validation - Epoch {}", epoch + 1), &report);
            let mut m = report_metrics("val", &report);
            m.push(("epoch".into(), (epoch + 1) as f64));
            tracker.log(global_step, &m)?;

            if best.observe(report.scores.f1) {
                tracing::info!("New Best F1: {:.4}", report.scores.f1);
                tracker.log(global_step, &metrics([("best_val_f1", report.scores.f1)]))?;
                save(store, model, experiment, epoch + 1, Some(report.scores.f1))?;
                improved = true;
            }
        }
    }

    if interrupted {
        tracing::warn!("Interrupted after {epochs_run} epoch(s). Saving checkpoint...");
        let checkpoint = save(store, model, experiment, epochs_run, best.best())?;
        tracker.finish()?;
        return Ok(ExperimentSummary {
            experiment: experiment.to_string(),
            epochs_run,
            final_train_loss,
            best_val_f1: best.best(),
            test: None,
            interrupted: true,
            checkpoint,
        });
    }

    if improved {
        let device = model.vocab().model().device().clone();
        let meta = store.load(experiment, &model.var_maps(), &device)?;
        model.vocab_mut().rebaseline()?;
        tracing::info!("Loaded best model from epoch {} with F1: {:.4}", meta.epoch, meta.val_f1.unwrap_or(0.0));
    }

    tracing::info!("Starting Testing");
    let test = evaluate(model, &mut loaders.test, cfg.max_new_tokens)?;
    log_report("Test Results", &test);
    tracing::info!("Best F1 (Val): {:.4}", best.best().unwrap_or(0.0));
    let mut m = report_metrics("test", &test);
    m.push(("best_val_f1".into(), best.best().unwrap_or(0.0)));
    tracker.log(global_step, &m)?;

    let checkpoint = save(store, model, experiment, epochs_run, best.best())?;
    tracing::info!(path = %checkpoint.display(), "Model saved");
    tracker.finish()?;

    Ok(ExperimentSummary {
        experiment: experiment.to_string(),
        epochs_run,
        final_train_loss,
        best_val_f1: best.best(),
        test: Some(test),
        interrupted: false,
        checkpoint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelParams, OptimizerConfig, DEFAULT_END_TURN};
    use crate::data::{synthetic_corpus, synthetic_examples, SyntheticConfig};
    use crate::model::{test_model, TinyVlm};
    use crate::quantize::Quantization;
    use crate::tokenizer::Tokenizer;
    use crate::tracking::MemoryTracker;
    use candle_core::Device;

    fn synth() -> SyntheticConfig {
        SyntheticConfig { region_dim: 6, image_dim: 4, patches: 2, max_positives: 2, max_negatives: 1 }
    }

    fn setup() -> Result<(LisaModel<TinyVlm>, Loaders)> {
        let tok = Tokenizer::from_text(&synthetic_corpus(), DEFAULT_END_TURN, 2)?;
        let vlm = test_model(&tok, Quantization::Q8, 4)?;
        let model = LisaModel::new(vlm, tok, 6, ModelParams::default())?;
        let dev = Device::Cpu;
        let loaders = Loaders {
            train: DataLoader::new(synthetic_examples(4, &synth(), 1, &dev)?, 2, true, 1)?,
            val: DataLoader::new(synthetic_examples(2, &synth(), 2, &dev)?, 2, false, 0)?,
            test: DataLoader::new(synthetic_examples(2, &synth(), 3, &dev)?, 2, false, 0)?,
        };
        Ok((model, loaders))
    }

    fn cfg() -> ExperimentConfig {
        ExperimentConfig {
            epochs: 2,
            log_interval: 1,
            val_every: 1,
            max_new_tokens: 3,
            optimizer: OptimizerConfig { adapter_lr: 1e-3, lora_lr: 1e-3 },
            model_params: ModelParams::default(),
        }
    }

    #[test]
    fn experiment_validates_tests_and_saves() -> Result<()> {
        let (mut model, mut loaders) = setup()?;
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path())?;
        let mut tracker = MemoryTracker::default();
        let flag = AtomicBool::new(false);

        let summary = run_experiment("unit", &cfg(), &mut model, &mut loaders, &store, &mut tracker, &flag)?;
        assert!(!summary.interrupted);
        assert_eq!(summary.epochs_run, 2);
        assert!(summary.best_val_f1.is_some());
        assert_eq!(summary.test.map(|t| t.examples), Some(2));
        assert!(store.exists("unit"));

        assert_eq!(tracker.series("train/avg_loss").len(), 2);
        assert_eq!(tracker.series("train/loss").len(), 4);
        assert_eq!(tracker.series("val/f1").len(), 2);
        assert!(tracker.last("test/f1").is_some());
        assert!(tracker.last("test/rand/f1").is_some());
        // first validation always counts as an improvement
        assert!(!tracker.series("best_val_f1").is_empty());
        assert!(!model.vocab().is_extended());
        Ok(())
    }

    #[test]
    fn interrupt_stops_before_any_step_and_skips_testing() -> Result<()> {
        let (mut model, mut loaders) = setup()?;
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path())?;
        let mut tracker = MemoryTracker::default();
        let flag = AtomicBool::new(true);

        let summary = run_experiment("stop", &cfg(), &mut model, &mut loaders, &store, &mut tracker, &flag)?;
        assert!(summary.interrupted);
        assert_eq!(summary.epochs_run, 0);
        assert!(summary.test.is_none());
        assert!(store.exists("stop"));
        assert!(tracker.series("train/loss").is_empty());
        Ok(())
    }

    #[test]
    fn empty_loaders_score_zero() -> Result<()> {
        let (mut model, _) = setup()?;
        let mut empty = DataLoader::new(Vec::new(), 2, false, 0)?;
        let report = evaluate(&mut model, &mut empty, 3)?;
        assert_eq!(report, EvalReport { scores: Scores::default(), random: Scores::default(), examples: 0 });
        Ok(())
    }
}
