//! Session wiring: loader, controller, exporter and persisted settings

use lull_audio::{
    AudioOutput, EngineError, ExportReport, Exporter, NowPlayingInfo, NowPlayingSink,
    PlaybackController, WavSink,
};
use lull_library::{AssetSummary, Config, TrackLoader};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

/// Publishes now-playing updates to the log
pub struct LogNowPlaying;

impl NowPlayingSink for LogNowPlaying {
    fn publish(&self, info: &NowPlayingInfo) {
        info!(
            "Now playing: {} - {} [{:.1}/{:.1}s] x{:.2}",
            info.artist, info.title, info.elapsed, info.duration, info.rate
        );
    }
}

/// Output for sessions that only export; it never plays
pub struct OfflineOutput {
    sample_rate: u32,
}

impl OfflineOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl AudioOutput for OfflineOutput {
    fn start(&mut self) -> Result<(), EngineError> {
        Err(EngineError::EngineStartFailure(
            "offline session has no audio device".into(),
        ))
    }

    fn stop(&mut self) {}

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

pub struct Session {
    loader: TrackLoader,
    controller: Arc<PlaybackController>,
    exporter: Exporter,
    config: Config,
    config_path: PathBuf,
    asset: Option<PathBuf>,
}

impl Session {
    pub fn new(controller: PlaybackController, config_path: PathBuf) -> Self {
        let config = Config::load_from(&config_path).unwrap_or_default();
        controller.set_now_playing_sink(Arc::new(LogNowPlaying));
        Self {
            loader: TrackLoader::with_sample_rate(controller.sample_rate()),
            controller: Arc::new(controller),
            exporter: Exporter::new(),
            config,
            config_path,
            asset: None,
        }
    }

    pub fn controller(&self) -> &Arc<PlaybackController> {
        &self.controller
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Decode `path` and make it the current source
    pub fn load_asset(&mut self, path: &Path) -> Result<AssetSummary, EngineError> {
        let track = self.loader.open(path)?;
        let summary = track.summary();
        self.controller.load(track.source, track.info);
        self.asset = Some(path.to_path_buf());
        Ok(summary)
    }

    /// Apply persisted stage settings and reopen the last asset where it was
    pub fn restore(&mut self) -> Result<Option<AssetSummary>, EngineError> {
        self.controller.apply_params(self.config.stage_params());

        let Some(path) = self.config.last_asset.clone() else {
            return Ok(None);
        };
        let summary = self.load_asset(&path)?;

        let position = self.config.last_position;
        if position > 0.0 {
            if let Err(e) = self.controller.seek(position) {
                warn!("Could not restore position {:.2}s: {}", position, e);
            }
        }
        info!("Restored session: {:?} at {:.2}s", path, position);
        Ok(Some(summary))
    }

    /// Write the current session to disk
    pub fn persist(&mut self) -> io::Result<()> {
        self.config.last_asset = self.asset.clone();
        self.config.last_position = self.controller.current_time();
        self.config.set_stage_params(self.controller.params());
        self.config.save_to(&self.config_path)
    }

    /// Render the current source to a WAV file in the background
    pub fn export<F>(&self, output: PathBuf, on_complete: F) -> Result<JoinHandle<()>, EngineError>
    where
        F: FnOnce(Result<ExportReport<PathBuf>, EngineError>) + Send + 'static,
    {
        self.exporter
            .export_async(self.controller.clone(), WavSink::new(output), on_complete)
    }
}
