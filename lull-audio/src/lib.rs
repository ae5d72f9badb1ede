//! Audio engine for Lull - source, stage chain, playback and export
//!
//! This module provides the core audio processing pipeline:
//! - Source: decoded, seekable audio held in memory
//! - Chain: fixed Source → TimePitch → Reverb topology with lock-free controls
//! - Controller: device-clocked transport (play/pause/seek/end-of-file)
//! - Offline: unthrottled export of the same chain to a sink
//! - Device: cpal output running on its own thread

mod chain;
mod controller;
mod device;
mod error;
mod now_playing;
mod offline;
mod params;
mod render;
mod source;
pub mod stages;
pub mod timestretcher;

#[cfg(test)]
pub(crate) mod test_support;

pub use chain::StageChain;
pub use controller::{
    ChangeCause, LiveFeed, PlaybackController, RemoteCommand, TransportChange, TransportListener,
    TransportState,
};
pub use device::{AudioOutput, CpalOutput};
pub use error::EngineError;
pub use now_playing::{NowPlayingInfo, NowPlayingSink};
pub use offline::{ExportReport, ExportSink, Exporter, SinkError, WavSink, EXPORT_BLOCK_FRAMES};
pub use params::{ChainControls, StageParams};
pub use render::{BlockRender, ChainRenderer, OfflineStream, RenderStatus};
pub use source::{Artwork, AssetInfo, AudioSource, SourceFormat};
