/* ------------------------------------------------------------------ */
/* Compute device selection                                           */
/* ------------------------------------------------------------------ */

use candle_core::Device;
use std::panic::{self, AssertUnwindSafe};
use tracing::{info, warn};

use crate::config::USE_GPU;

lazy_static::lazy_static! {
    /// Chosen once per process: CUDA, then Metal, then CPU. Backends not
    /// compiled in (cargo features `cuda` / `metal`) report an error and are
    /// skipped.
    pub static ref DEVICE: Device = select_device(USE_GPU);
}

fn try_backend(name: &str, init: impl FnOnce() -> candle_core::Result<Device>) -> Option<Device> {
    match panic::catch_unwind(AssertUnwindSafe(init)) {
        Ok(Ok(dev)) => {
            info!(backend = name, device = ?dev, "GPU enabled");
            Some(dev)
        }
        Ok(Err(e)) => {
            warn!(backend = name, error = %e, "GPU unavailable");
            None
        }
        Err(_) => {
            warn!(backend = name, "GPU unavailable (initialization panicked)");
            None
        }
    }
}

pub fn select_device(use_gpu: bool) -> Device {
    if !use_gpu {
        return Device::Cpu;
    }
    if cfg!(feature = "cuda") {
        if let Some(dev) = try_backend("cuda", || Device::new_cuda(0)) {
            return dev;
        }
    }
    if cfg!(feature = "metal") {
        if let Some(dev) = try_backend("metal", || Device::new_metal(0)) {
            return dev;
        }
    }
    Device::Cpu
}
