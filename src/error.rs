/* ------------------------------------------------------------------ */
/* Error taxonomy                                                     */
/* ------------------------------------------------------------------ */
//
// Config and StateCorruption are fatal: the run must abort. Device and
// I/O failures are propagated untouched so the caller decides whether the
// experiment is retried.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Dimension mismatches, conflicting flags, impossible sizes.
    #[error("configuration error: {0}")]
    Config(String),

    /// The dynamic vocabulary left its step discipline (double reset,
    /// inject while extended, poisoned after a failed reset).
    #[error("vocabulary state corrupted: {0}")]
    StateCorruption(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::StateCorruption(msg.into())
    }

    /// True for errors after which continuing the run is unsafe.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::StateCorruption(_))
    }
}
