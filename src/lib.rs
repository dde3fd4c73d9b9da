//! Adapter + LoRA fine-tuning of a vision-language model that names
//! segmentation masks by emitting tokens from a per-step, embedding-valued
//! vocabulary extension.

pub mod adapter;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod dynamic_vocab;
pub mod error;
pub mod lisa;
pub mod lora;
pub mod metrics;
pub mod model;
pub mod ops;
pub mod optimizer;
pub mod quantize;
pub mod rng;
pub mod tokenizer;
pub mod tracking;
pub mod train;

pub use adapter::SegAdapter;
pub use checkpoint::{BestF1, CheckpointMeta, CheckpointStore};
pub use config::{ExperimentConfig, LoraConfig, ModelParams, OptimizerConfig, VlmConfig};
pub use data::{Batch, DataLoader, Example};
pub use dynamic_vocab::{DynamicVocabModel, VocabExtension, VocabState};
pub use error::{Error, Result};
pub use lisa::{Generation, LisaModel, StepOutput};
pub use metrics::{Confusion, MaskIndexLayout, Scores};
pub use model::{TinyVlm, VisionLanguageModel};
pub use optimizer::JointOptimizer;
pub use tokenizer::Tokenizer;
pub use tracking::{JsonlTracker, MemoryTracker, Tracker, TracingTracker};
pub use train::{run_experiment, ExperimentSummary, Loaders};
