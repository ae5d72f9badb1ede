//! Engine error taxonomy

use thiserror::Error;

/// Errors surfaced by the engine to its immediate caller
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Unreadable asset: {0}")]
    UnreadableAsset(String),
    #[error("No source loaded")]
    NoSourceLoaded,
    #[error("An export is already in progress")]
    ExportInProgress,
    #[error("Render failure: {0}")]
    RenderFailure(String),
    #[error("Audio output failed to start: {0}")]
    EngineStartFailure(String),
    #[error("Seek to {requested:.3}s is outside the source ({duration:.3}s)")]
    SeekOutOfRange { requested: f64, duration: f64 },
}
