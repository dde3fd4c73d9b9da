use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use candle_core::Device;
use clap::{Parser, ValueEnum};

use lisa_tune::config::{
    ADAPTER_LR, BATCH_SIZE, EPOCHS, IMAGE_DIM, IMAGE_TOKENS, LOG_INTERVAL, LORA_LR, MAX_NEW_TOKENS,
    TABLE_PADDING, VAL_EVERY,
};
use lisa_tune::data::{synthetic_corpus, synthetic_examples, SyntheticConfig};
use lisa_tune::device::DEVICE;
use lisa_tune::quantize::Quantization;
use lisa_tune::tracking::Fanout;
use lisa_tune::{
    run_experiment, CheckpointStore, DataLoader, ExperimentConfig, JsonlTracker, LisaModel, Loaders,
    ModelParams, OptimizerConfig, TinyVlm, Tokenizer, Tracker, TracingTracker, VlmConfig,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

/// Train the segmentation adapter + LoRA on a synthetic referring dataset.
#[derive(Debug, Parser)]
#[command(name = "lisa-tune", version)]
struct Args {
    /// Experiment name; checkpoints are written as model_{name}.*
    #[arg(long, default_value = "synthetic")]
    experiment: String,

    #[arg(long, default_value_t = EPOCHS)]
    epochs: usize,

    #[arg(long, default_value_t = VAL_EVERY)]
    val_every: usize,

    #[arg(long, default_value_t = LOG_INTERVAL)]
    log_interval: usize,

    #[arg(long, default_value_t = MAX_NEW_TOKENS)]
    max_new_tokens: usize,

    #[arg(long, default_value_t = ADAPTER_LR)]
    adapter_lr: f64,

    #[arg(long, default_value_t = LORA_LR)]
    lora_lr: f64,

    /// Keep the frozen projections at full precision instead of 4-bit.
    #[arg(long)]
    no_q4: bool,

    /// 8-bit frozen projections (conflicts with 4-bit).
    #[arg(long)]
    q8: bool,

    #[arg(long, default_value_t = BATCH_SIZE)]
    batch_size: usize,

    #[arg(long, default_value_t = 64)]
    train_examples: usize,

    #[arg(long, default_value_t = 16)]
    val_examples: usize,

    #[arg(long, default_value_t = 16)]
    test_examples: usize,

    #[arg(long, default_value_t = 24)]
    region_dim: usize,

    #[arg(long, default_value_t = 3)]
    max_positives: usize,

    #[arg(long, default_value_t = 3)]
    max_negatives: usize,

    #[arg(long, default_value_t = 1337)]
    seed: u64,

    /// Checkpoint directory.
    #[arg(long, default_value = "models")]
    out: PathBuf,

    /// Also append metrics as JSON lines to this file.
    #[arg(long)]
    metrics: Option<PathBuf>,

    /// Write the tokenizer vocabulary here.
    #[arg(long)]
    vocab_out: Option<PathBuf>,

    /// Force CPU even when a GPU backend is compiled in.
    #[arg(long)]
    cpu: bool,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
}

fn setup_logging(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Compact => subscriber.compact().init(),
        LogFormat::Pretty => subscriber.pretty().init(),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level, args.log_format);

    let interrupt = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&interrupt);
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::Relaxed);
        })
        .context("installing Ctrl-C handler")?;
    }

    let device = if args.cpu { Device::Cpu } else { DEVICE.clone() };

    let model_params = ModelParams { q4: !args.no_q4, q8: args.q8, ..ModelParams::default() };
    let cfg = ExperimentConfig {
        epochs: args.epochs,
        log_interval: args.log_interval,
        val_every: args.val_every,
        max_new_tokens: args.max_new_tokens,
        optimizer: OptimizerConfig { adapter_lr: args.adapter_lr, lora_lr: args.lora_lr },
        model_params,
    };
    cfg.validate().context("invalid experiment configuration")?;
    let quant: Quantization = cfg.model_params.quantization()?;

    // ── data ───────────────────────────────────────────────────────────────
    let synth = SyntheticConfig {
        region_dim: args.region_dim,
        image_dim: IMAGE_DIM,
        patches: IMAGE_TOKENS,
        max_positives: args.max_positives,
        max_negatives: args.max_negatives,
    };
    let train = synthetic_examples(args.train_examples, &synth, args.seed, &device)?;
    let val = synthetic_examples(args.val_examples, &synth, args.seed.wrapping_add(1), &device)?;
    let test = synthetic_examples(args.test_examples, &synth, args.seed.wrapping_add(2), &device)?;
    let mut loaders = Loaders {
        train: DataLoader::new(train, args.batch_size, true, args.seed)?,
        val: DataLoader::new(val, args.batch_size, false, 0)?,
        test: DataLoader::new(test, args.batch_size, false, 0)?,
    };
    let region_dim = loaders.train.region_dim().context("training set is empty")?;

    // ── model ──────────────────────────────────────────────────────────────
    let tokenizer = Tokenizer::from_text(&synthetic_corpus(), &cfg.model_params.end_turn_token, IMAGE_TOKENS)?;
    if let Some(path) = &args.vocab_out {
        tokenizer.save(path)?;
    }
    let vlm_cfg = VlmConfig::tiny(tokenizer.vocab_size() + TABLE_PADDING, tokenizer.image_id);
    let base = TinyVlm::new(vlm_cfg, &cfg.model_params.lora, quant, &device)?;
    let mut model = LisaModel::new(base, tokenizer, region_dim, cfg.model_params.clone())?;

    let store = CheckpointStore::new(&args.out)?;
    let mut tracker: Box<dyn Tracker> = match &args.metrics {
        Some(path) => Box::new(Fanout(vec![Box::new(TracingTracker), Box::new(JsonlTracker::create(path)?)])),
        None => Box::new(TracingTracker),
    };

    let summary = run_experiment(
        &args.experiment,
        &cfg,
        &mut model,
        &mut loaders,
        &store,
        tracker.as_mut(),
        &interrupt,
    )
    .with_context(|| format!("experiment {} failed", args.experiment))?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
