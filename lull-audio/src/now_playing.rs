//! Now-playing metadata pushed to the platform (lock screen, media keys)

use crate::source::Artwork;

/// Snapshot of what is playing and where
#[derive(Debug, Clone, PartialEq)]
pub struct NowPlayingInfo {
    pub title: String,
    pub artist: String,
    pub artwork: Option<Artwork>,
    /// Seconds
    pub duration: f64,
    /// Seconds
    pub elapsed: f64,
    /// Playback rate; 0 while not playing
    pub rate: f32,
}

/// Receiver of now-playing updates
///
/// Called from control threads after every transport or rate change, never
/// from the audio callback.
pub trait NowPlayingSink: Send + Sync {
    fn publish(&self, info: &NowPlayingInfo);
}
