/* ------------------------------------------------------------------ */
/* Examples, batches, loader and a synthetic segmentation dataset    */
/* ------------------------------------------------------------------ */

use candle_core::{Device, Tensor};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::rng::Rng;

/// One referring-segmentation sample. `gt_embs` / `sam_embs` are
/// `[regions, region_dim]`: ground-truth masks and distractor masks from
/// the external region encoder. `image` is `[patches, image_dim]`.
#[derive(Debug, Clone)]
pub struct Example {
    pub query: String,
    pub image: Tensor,
    pub answer: String,
    pub gt_embs: Tensor,
    pub sam_embs: Tensor,
}

impl Example {
    pub fn num_positives(&self) -> usize {
        self.gt_embs.dims().first().copied().unwrap_or(0)
    }

    pub fn num_negatives(&self) -> usize {
        self.sam_embs.dims().first().copied().unwrap_or(0)
    }

    pub fn region_dim(&self) -> Option<usize> {
        self.gt_embs.dims().get(1).copied()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub examples: Vec<Example>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// (positives, negatives) per example, in batch order.
    pub fn region_counts(&self) -> Vec<(usize, usize)> {
        self.examples.iter().map(|e| (e.num_positives(), e.num_negatives())).collect()
    }
}

// ── Loader ─────────────────────────────────────────────────────────────────

pub struct DataLoader {
    examples: Vec<Example>,
    batch_size: usize,
    shuffle: bool,
    rng: Rng,
}

impl DataLoader {
    pub fn new(examples: Vec<Example>, batch_size: usize, shuffle: bool, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::config("batch_size must be positive"));
        }
        Ok(Self { examples, batch_size, shuffle, rng: Rng::new(seed) })
    }

    pub fn dataset(&self) -> &[Example] {
        &self.examples
    }

    /// Number of batches per epoch (last one may be short).
    pub fn len(&self) -> usize {
        self.examples.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Region-embedding width of the first example, if any.
    pub fn region_dim(&self) -> Option<usize> {
        self.examples.first().and_then(Example::region_dim)
    }

    /// One epoch of batches; reshuffled per call when shuffling is on.
    pub fn batches(&mut self) -> Vec<Batch> {
        let mut order: Vec<usize> = (0..self.examples.len()).collect();
        if self.shuffle {
            self.rng.shuffle(&mut order);
        }
        order
            .chunks(self.batch_size)
            .map(|idx| Batch { examples: idx.iter().map(|&i| self.examples[i].clone()).collect() })
            .collect()
    }
}

// ── Synthetic dataset ──────────────────────────────────────────────────────

const OBJECTS: [&str; 6] = ["car", "dog", "tree", "cup", "bike", "door"];
const COLOURS: [&str; 5] = ["red", "blue", "green", "white", "black"];

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub region_dim: usize,
    pub image_dim: usize,
    pub patches: usize,
    pub max_positives: usize,
    pub max_negatives: usize,
}

struct RawExample {
    query: String,
    answer: String,
    image: Vec<f32>,
    gt: Vec<f32>,
    sam: Vec<f32>,
    n_pos: usize,
    n_neg: usize,
}

/// Deterministic toy data: each example asks for one object, has 1..=P
/// unit-norm positive regions and 0..=N negatives. Positives of one object
/// share a direction so the task is learnable.
pub fn synthetic_examples(n: usize, cfg: &SyntheticConfig, seed: u64, device: &Device) -> Result<Vec<Example>> {
    if cfg.region_dim == 0 || cfg.image_dim == 0 || cfg.patches == 0 || cfg.max_positives == 0 {
        return Err(Error::config(format!("degenerate synthetic config {cfg:?}")));
    }
    let prototypes: Vec<Vec<f32>> = (0..OBJECTS.len())
        .map(|o| Rng::fork(seed, 1_000_000 + o as u64).unit_vector(cfg.region_dim))
        .collect();

    let raw: Vec<RawExample> = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut rng = Rng::fork(seed, i as u64);
            let obj = rng.choice(OBJECTS.len());
            let colour = COLOURS[rng.choice(COLOURS.len())];
            let n_pos = rng.range_inclusive(1, cfg.max_positives);
            let n_neg = rng.range_inclusive(0, cfg.max_negatives);

            let region = |proto: &[f32], rng: &mut Rng| -> Vec<f32> {
                let noise = rng.unit_vector(cfg.region_dim);
                let v: Vec<f32> = proto.iter().zip(&noise).map(|(p, e)| p + 0.3 * e).collect();
                let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-12);
                v.into_iter().map(|x| x / norm).collect()
            };
            let gt: Vec<f32> = (0..n_pos).flat_map(|_| region(&prototypes[obj], &mut rng)).collect();
            let sam: Vec<f32> = (0..n_neg)
                .flat_map(|_| {
                    let other = (obj + 1 + rng.choice(OBJECTS.len() - 1)) % OBJECTS.len();
                    region(&prototypes[other], &mut rng)
                })
                .collect();
            let image: Vec<f32> = (0..cfg.patches * cfg.image_dim).map(|_| rng.gauss(0.0, 1.0)).collect();

            RawExample {
                query: format!("segment the {colour} {}", OBJECTS[obj]),
                answer: format!("the {colour} {}", OBJECTS[obj]),
                image,
                gt,
                sam,
                n_pos,
                n_neg,
            }
        })
        .collect();

    raw.into_iter()
        .map(|r| {
            Ok(Example {
                query: r.query,
                answer: r.answer,
                image: Tensor::from_vec(r.image, (cfg.patches, cfg.image_dim), device)?,
                gt_embs: Tensor::from_vec(r.gt, (r.n_pos, cfg.region_dim), device)?,
                sam_embs: Tensor::from_vec(r.sam, (r.n_neg, cfg.region_dim), device)?,
            })
        })
        .collect()
}

/// Every character the synthetic queries and answers can use.
pub fn synthetic_corpus() -> String {
    let mut text = String::from("segment the ");
    for w in OBJECTS.iter().chain(COLOURS.iter()) {
        text.push_str(w);
        text.push(' ');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SyntheticConfig {
        SyntheticConfig { region_dim: 6, image_dim: 4, patches: 2, max_positives: 2, max_negatives: 2 }
    }

    #[test]
    fn synthetic_data_is_deterministic_and_well_shaped() -> Result<()> {
        let a = synthetic_examples(8, &cfg(), 42, &Device::Cpu)?;
        let b = synthetic_examples(8, &cfg(), 42, &Device::Cpu)?;
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.query, y.query);
            assert_eq!(x.gt_embs.to_vec2::<f32>()?, y.gt_embs.to_vec2::<f32>()?);
            assert!((1..=2).contains(&x.num_positives()));
            assert!(x.num_negatives() <= 2);
            assert_eq!(x.image.dims(), &[2, 4]);
            assert_eq!(x.region_dim(), Some(6));
        }
        Ok(())
    }

    #[test]
    fn loader_covers_every_example_once_per_epoch() -> Result<()> {
        let data = synthetic_examples(5, &cfg(), 1, &Device::Cpu)?;
        let queries: Vec<String> = data.iter().map(|e| e.query.clone()).collect();
        let mut loader = DataLoader::new(data, 2, true, 9)?;
        assert_eq!(loader.len(), 3);
        let batches = loader.batches();
        assert_eq!(batches.iter().map(Batch::len).collect::<Vec<_>>(), vec![2, 2, 1]);
        let mut seen: Vec<String> = batches.iter().flat_map(|b| b.examples.iter().map(|e| e.query.clone())).collect();
        let mut want = queries;
        seen.sort();
        want.sort();
        assert_eq!(seen, want);
        assert!(DataLoader::new(Vec::new(), 0, false, 0).is_err());
        Ok(())
    }
}
