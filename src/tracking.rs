/* ------------------------------------------------------------------ */
/* Experiment tracking sinks                                          */
/* ------------------------------------------------------------------ */

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Scalar metrics keyed by name, logged at a step.
pub trait Tracker {
    fn log(&mut self, step: usize, metrics: &[(String, f64)]) -> Result<()>;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builds a metric list from `&str` names.
pub fn metrics<const N: usize>(pairs: [(&str, f64); N]) -> Vec<(String, f64)> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

// ── tracing ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct TracingTracker;

impl Tracker for TracingTracker {
    fn log(&mut self, step: usize, metrics: &[(String, f64)]) -> Result<()> {
        for (name, value) in metrics {
            tracing::info!(target: "metrics", step, metric = %name, value, "metric");
        }
        Ok(())
    }
}

// ── JSON lines ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub step: usize,
    pub metrics: BTreeMap<String, f64>,
}

/// One JSON object per `log` call.
pub struct JsonlTracker {
    out: BufWriter<File>,
}

impl JsonlTracker {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(dir) = path.as_ref().parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        Ok(Self { out: BufWriter::new(File::create(path)?) })
    }
}

impl Tracker for JsonlTracker {
    fn log(&mut self, step: usize, metrics: &[(String, f64)]) -> Result<()> {
        let record = MetricRecord { step, metrics: metrics.iter().cloned().collect() };
        serde_json::to_writer(&mut self.out, &record)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

// ── in-memory ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryTracker {
    pub records: Vec<MetricRecord>,
}

impl MemoryTracker {
    /// Every (step, value) logged under `name`, in order.
    pub fn series(&self, name: &str) -> Vec<(usize, f64)> {
        self.records
            .iter()
            .filter_map(|r| r.metrics.get(name).map(|&v| (r.step, v)))
            .collect()
    }

    pub fn last(&self, name: &str) -> Option<f64> {
        self.series(name).last().map(|&(_, v)| v)
    }
}

impl Tracker for MemoryTracker {
    fn log(&mut self, step: usize, metrics: &[(String, f64)]) -> Result<()> {
        self.records.push(MetricRecord { step, metrics: metrics.iter().cloned().collect() });
        Ok(())
    }
}

/// Forwards every call to each inner tracker.
pub struct Fanout(pub Vec<Box<dyn Tracker>>);

impl Tracker for Fanout {
    fn log(&mut self, step: usize, metrics: &[(String, f64)]) -> Result<()> {
        for t in &mut self.0 {
            t.log(step, metrics)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        for t in &mut self.0 {
            t.finish()?;
        }
        Ok(())
    }
}
