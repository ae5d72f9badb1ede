//! Asset loading and settings for Lull

mod config;
mod loader;

pub use config::Config;
pub use loader::{AssetSummary, LoadError, LoadedTrack, TrackLoader};
