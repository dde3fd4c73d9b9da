/* ------------------------------------------------------------------ */
/* Mask-reference scoring: index layout, set overlap, baselines      */
/* ------------------------------------------------------------------ */
//
// Mask indices are 1-based and batch-global. For per-example counts
// (p_0, n_0), (p_1, n_1), ... the layout is
//
//   positives:  [1 .. p_0] [p_0+1 .. p_0+p_1] ...
//   negatives:  [P+1 .. P+n_0] [P+n_0+1 .. ] ...     (P = Σ p_i)
//
// which is also the order the embeddings are injected in, so a generated
// id B+k always names the k-th injected row.

use std::collections::HashSet;
use std::ops::Range;

use rayon::prelude::*;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskIndexLayout {
    positives: Vec<Range<usize>>,
    negatives: Vec<Range<usize>>,
}

impl MaskIndexLayout {
    /// `counts[i]` = (positives, negatives) of example i.
    pub fn new(counts: &[(usize, usize)]) -> Self {
        let total_pos: usize = counts.iter().map(|c| c.0).sum();
        let mut next_pos = 1;
        let mut next_neg = total_pos + 1;
        let mut positives = Vec::with_capacity(counts.len());
        let mut negatives = Vec::with_capacity(counts.len());
        for &(p, n) in counts {
            positives.push(next_pos..next_pos + p);
            negatives.push(next_neg..next_neg + n);
            next_pos += p;
            next_neg += n;
        }
        Self { positives, negatives }
    }

    pub fn len(&self) -> usize {
        self.positives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positives.is_empty()
    }

    pub fn positive_range(&self, example: usize) -> Range<usize> {
        self.positives.get(example).cloned().unwrap_or(0..0)
    }

    pub fn negative_range(&self, example: usize) -> Range<usize> {
        self.negatives.get(example).cloned().unwrap_or(0..0)
    }

    pub fn total_positives(&self) -> usize {
        self.positives.iter().map(|r| r.len()).sum()
    }

    /// Number of injected rows the layout describes.
    pub fn total(&self) -> usize {
        self.total_positives() + self.negatives.iter().map(|r| r.len()).sum::<usize>()
    }
}

// ── Confusion counts ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Confusion {
    pub tp: f64,
    pub fp: f64,
    pub fn_: f64,
    pub tn: f64,
}

impl Confusion {
    /// Set overlap of the generated references with one example's runs.
    pub fn from_sets(generated: &HashSet<usize>, positives: Range<usize>, negatives: Range<usize>) -> Self {
        let hit = |r: &Range<usize>| r.clone().filter(|k| generated.contains(k)).count() as f64;
        let tp = hit(&positives);
        let fp = hit(&negatives);
        Self {
            tp,
            fp,
            fn_: positives.len() as f64 - tp,
            tn: negatives.len() as f64 - fp,
        }
    }

    /// Closed-form random guesser: half of each class called right.
    pub fn random_baseline(n_pos: usize, n_neg: usize) -> Self {
        let (p, n) = (n_pos as f64 / 2.0, n_neg as f64 / 2.0);
        Self { tp: p, fp: n, fn_: p, tn: n }
    }

    pub fn scores(&self) -> Scores {
        let ratio = |num: f64, den: f64| if den > 0.0 { num / den } else { 0.0 };
        let Self { tp, fp, fn_, tn } = *self;
        Scores {
            accuracy: ratio(tp + tn, tp + tn + fp + fn_),
            precision: ratio(tp, tp + fp),
            recall: ratio(tp, tp + fn_),
            f1: ratio(2.0 * tp, 2.0 * tp + fp + fn_),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Scores {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl Scores {
    /// `(prefix/name, value)` pairs for a tracker.
    pub fn named(&self, prefix: &str) -> Vec<(String, f64)> {
        vec![
            (format!("{prefix}/accuracy"), self.accuracy),
            (format!("{prefix}/precision"), self.precision),
            (format!("{prefix}/recall"), self.recall),
            (format!("{prefix}/f1"), self.f1),
        ]
    }
}

/// Per-example scores of the model and of the random baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExampleScore {
    pub model: Scores,
    pub random: Scores,
}

/// Mask references named by one example's generated ids (`id > boundary`).
pub fn generated_masks(tokens: &[u32], boundary: usize) -> HashSet<usize> {
    tokens
        .iter()
        .map(|&id| id as usize)
        .filter(|&id| id > boundary)
        .map(|id| id - boundary)
        .collect()
}

/// Scores every example of a generated batch in parallel.
pub fn score_batch(tokens: &[Vec<u32>], layout: &MaskIndexLayout, boundary: usize) -> Vec<ExampleScore> {
    tokens
        .par_iter()
        .enumerate()
        .map(|(i, ids)| {
            let generated = generated_masks(ids, boundary);
            let (pos, neg) = (layout.positive_range(i), layout.negative_range(i));
            ExampleScore {
                random: Confusion::random_baseline(pos.len(), neg.len()).scores(),
                model: Confusion::from_sets(&generated, pos, neg).scores(),
            }
        })
        .collect()
}

// ── Running averages ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct MetricsAccumulator {
    model: Scores,
    random: Scores,
    count: usize,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, scores: &[ExampleScore]) {
        for s in scores {
            add(&mut self.model, &s.model);
            add(&mut self.random, &s.random);
            self.count += 1;
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Averages over examples; all zero when nothing was scored.
    pub fn averages(&self) -> (Scores, Scores) {
        if self.count == 0 {
            return (Scores::default(), Scores::default());
        }
        let n = self.count as f64;
        (scale(&self.model, n), scale(&self.random, n))
    }
}

fn add(acc: &mut Scores, s: &Scores) {
    acc.accuracy += s.accuracy;
    acc.precision += s.precision;
    acc.recall += s.recall;
    acc.f1 += s.f1;
}

fn scale(s: &Scores, n: f64) -> Scores {
    Scores {
        accuracy: s.accuracy / n,
        precision: s.precision / n,
        recall: s.recall / n,
        f1: s.f1 / n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hand_computed_overlap() {
        // positives {1, 2}, negatives {3, 4}, generated {1, 3}
        let layout = MaskIndexLayout::new(&[(2, 2)]);
        let boundary = 100;
        let tokens = vec![vec![7, 101, 9, 103, 2]];
        let scored = score_batch(&tokens, &layout, boundary);
        let c = Confusion::from_sets(&generated_masks(&tokens[0], boundary), 1..3, 3..5);
        assert_eq!(c, Confusion { tp: 1.0, fp: 1.0, fn_: 1.0, tn: 1.0 });
        let s = scored[0].model;
        assert_eq!((s.accuracy, s.precision, s.recall, s.f1), (0.5, 0.5, 0.5, 0.5));
    }

    #[test]
    fn random_baseline_is_a_pure_function_of_sizes() {
        let a = Confusion::random_baseline(3, 5).scores();
        let b = Confusion::random_baseline(3, 5).scores();
        assert_eq!(a, b);
        assert_eq!(a.recall, 0.5);
        assert_eq!(a.accuracy, 0.5);
        assert!((a.precision - 3.0 / 8.0).abs() < 1e-12);
        assert_eq!(Confusion::random_baseline(0, 0).scores(), Scores::default());
    }

    #[test]
    fn layout_puts_all_positives_before_negatives() {
        let layout = MaskIndexLayout::new(&[(1, 1), (2, 3)]);
        assert_eq!(layout.positive_range(0), 1..2);
        assert_eq!(layout.positive_range(1), 2..4);
        assert_eq!(layout.negative_range(0), 4..5);
        assert_eq!(layout.negative_range(1), 5..8);
        assert_eq!(layout.total(), 7);

        let single = MaskIndexLayout::new(&[(2, 2)]);
        assert_eq!((single.positive_range(0), single.negative_range(0)), (1..3, 3..5));
    }

    #[test]
    fn empty_inputs_average_to_zero() {
        let acc = MetricsAccumulator::new();
        assert_eq!(acc.averages(), (Scores::default(), Scores::default()));
        // no positives, nothing generated: every denominator but accuracy's is 0
        let s = Confusion::from_sets(&HashSet::new(), 1..1, 1..3).scores();
        assert_eq!((s.precision, s.recall, s.f1), (0.0, 0.0, 0.0));
        assert_eq!(s.accuracy, 1.0);
    }

    #[test]
    fn accumulator_averages_examples() {
        let layout = MaskIndexLayout::new(&[(1, 1), (1, 1)]);
        // example 0 names its positive (1); example 1 names its negative (4)
        let tokens = vec![vec![11], vec![14]];
        let mut acc = MetricsAccumulator::new();
        acc.extend(&score_batch(&tokens, &layout, 10));
        let (model, random) = acc.averages();
        assert_eq!(acc.count(), 2);
        assert_eq!(model.f1, 0.5);
        assert_eq!(random.f1, 0.5);
    }
}
