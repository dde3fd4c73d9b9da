/* ------------------------------------------------------------------ */
/* Checkpoint save / load                                            */
/* ------------------------------------------------------------------ */
//
// Layout under the store directory, per experiment:
//   model_{exp}.safetensors   every var, keyed "{store}/{var name}"
//                             (store = base | lora | adapter)
//   model_{exp}.json          CheckpointMeta
//
// Both files are written to a .tmp sibling and renamed into place, so a
// reader never sees a half-written checkpoint.

use std::path::{Path, PathBuf};

use candle_core::Device;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::named_tensors;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub experiment: String,
    /// 1-based epoch the weights come from.
    pub epoch: usize,
    pub val_f1: Option<f64>,
    pub boundary: usize,
    pub table_rows: usize,
}

pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn weights_path(&self, experiment: &str) -> PathBuf {
        self.dir.join(format!("model_{experiment}.safetensors"))
    }

    pub fn meta_path(&self, experiment: &str) -> PathBuf {
        self.dir.join(format!("model_{experiment}.json"))
    }

    pub fn exists(&self, experiment: &str) -> bool {
        self.weights_path(experiment).is_file() && self.meta_path(experiment).is_file()
    }

    pub fn save(&self, maps: &[(&str, &VarMap)], meta: &CheckpointMeta) -> Result<PathBuf> {
        let tensors = named_tensors(maps)?;
        let path = self.weights_path(&meta.experiment);
        let tmp = tmp_sibling(&path);
        candle_core::safetensors::save(&tensors, &tmp)?;
        std::fs::rename(&tmp, &path)?;

        flush_atomic(&self.meta_path(&meta.experiment), serde_json::to_string_pretty(meta)?.as_bytes())?;
        tracing::info!(path = %path.display(), tensors = tensors.len(), epoch = meta.epoch, "checkpoint saved");
        Ok(path)
    }

    /// Copies stored values into the existing vars in place.
    pub fn load(&self, experiment: &str, maps: &[(&str, &VarMap)], device: &Device) -> Result<CheckpointMeta> {
        let path = self.weights_path(experiment);
        let tensors = candle_core::safetensors::load(&path, device)?;
        for (prefix, map) in maps {
            let data = map
                .data()
                .lock()
                .map_err(|_| Error::Checkpoint(format!("{prefix} parameter store lock poisoned")))?;
            for (name, var) in data.iter() {
                let key = format!("{prefix}/{name}");
                let stored = tensors
                    .get(&key)
                    .ok_or_else(|| Error::Checkpoint(format!("{} has no tensor {key}", path.display())))?;
                if stored.dims() != var.dims() {
                    return Err(Error::Checkpoint(format!(
                        "{key}: stored shape {:?}, model shape {:?}", stored.dims(), var.dims()
                    )));
                }
                var.set(&stored.to_dtype(var.dtype())?)?;
            }
        }
        let meta: CheckpointMeta = serde_json::from_str(&std::fs::read_to_string(self.meta_path(experiment))?)?;
        tracing::info!(path = %path.display(), epoch = meta.epoch, val_f1 = ?meta.val_f1, "checkpoint loaded");
        Ok(meta)
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write to `{path}.tmp`, then rename over `path`.
fn flush_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_sibling(path);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ── Best-model policy ──────────────────────────────────────────────────────

/// Tracks the best validation F1 of a run. `observe` is true iff the new
/// value strictly beats every earlier one; the first observation always
/// counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct BestF1 {
    best: Option<f64>,
}

impl BestF1 {
    pub fn observe(&mut self, f1: f64) -> bool {
        match self.best {
            Some(b) if f1 <= b => false,
            _ => {
                self.best = Some(f1);
                true
            }
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }
}
