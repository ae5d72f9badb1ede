//! Playback controller - device-clocked transport over the live chain
//!
//! The audio callback and the controller share one [`Transport`] behind a
//! mutex. The callback only ever `try_lock`s it (silence on contention); the
//! controller takes it for every transport operation and, when it also needs
//! the output, always locks transport first, then output.
//!
//! Position is tracked on the device clock: every callback commits
//! `frames * rate` source frames, and the audible position trails that by the
//! device-reported output latency.

use crate::chain::StageChain;
use crate::device::AudioOutput;
use crate::error::EngineError;
use crate::now_playing::{NowPlayingInfo, NowPlayingSink};
use crate::params::{ChainControls, StageParams};
use crate::render::{ChainRenderer, LIVE_FEED_FRAMES};
use crate::source::{AssetInfo, AudioSource};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fade-in applied after play/seek to avoid clicks
const DECLICK_FRAMES: usize = 256;

/// Transport state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Idle,
    Loaded,
    Playing,
    Paused,
    /// Played through to the end; rewound to the start
    Finished,
}

/// Why the play state changed without a direct local call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCause {
    Interruption,
    Remote,
    EndOfFile,
    Export,
}

/// Notification sent to the transport listener
#[derive(Debug, Clone, PartialEq)]
pub struct TransportChange {
    pub cause: ChangeCause,
    pub state: TransportState,
    /// Seconds
    pub position: f64,
}

/// Callback fired on [`TransportChange`]s
pub type TransportListener = Arc<dyn Fn(&TransportChange) + Send + Sync>;

/// Commands from media keys / lock screen
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RemoteCommand {
    Play,
    Pause,
    TogglePlayPause,
    /// Seconds
    Seek(f64),
}

/// Where playback should pick up once an export is done
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ResumePoint {
    pub source_id: u64,
    pub was_playing: bool,
}

/// Holds the controller's export slot; released on drop
pub(crate) struct ExportGuard {
    exporting: Arc<AtomicBool>,
}

impl Drop for ExportGuard {
    fn drop(&mut self) {
        self.exporting.store(false, Ordering::Release);
    }
}

/// Everything an offline render takes from the live side
pub(crate) struct ExportHandoff {
    pub source: AudioSource,
    pub params: StageParams,
    pub resume: ResumePoint,
    pub guard: ExportGuard,
}

/// State shared between the controller and the audio callback
struct Transport {
    state: TransportState,
    renderer: Option<ChainRenderer>,
    info: AssetInfo,
    /// Source frame of the last explicit position
    anchor: f64,
    /// Source frames handed to the device since `anchor`
    committed: f64,
    /// Source frames actually audible since `anchor`
    heard: f64,
    fade_remaining: usize,
    /// Set by the callback at end of file, cleared by the controller
    finished_unacked: bool,
}

impl Transport {
    fn new() -> Self {
        Self {
            state: TransportState::Idle,
            renderer: None,
            info: AssetInfo::default(),
            anchor: 0.0,
            committed: 0.0,
            heard: 0.0,
            fade_remaining: 0,
            finished_unacked: false,
        }
    }

    fn source(&self) -> Option<&AudioSource> {
        self.renderer.as_ref().map(|r| r.source())
    }

    fn len_frames(&self) -> f64 {
        self.source().map_or(0.0, |s| s.len_frames() as f64)
    }

    fn duration_secs(&self) -> f64 {
        self.source().map_or(0.0, |s| s.duration_secs())
    }

    fn position_frames(&self) -> f64 {
        (self.anchor + self.heard).clamp(0.0, self.len_frames())
    }

    fn position_secs(&self) -> f64 {
        match self.source() {
            Some(source) => self.position_frames() / source.sample_rate() as f64,
            None => 0.0,
        }
    }

    /// Make `frame` the new explicit position
    fn rebase(&mut self, frame: f64) {
        self.anchor = frame;
        self.committed = 0.0;
        self.heard = 0.0;
    }

    /// Rebase and rebuild the streaming cursor at `frame`
    fn restart_at(&mut self, frame: f64) {
        self.rebase(frame);
        if let Some(renderer) = self.renderer.as_mut() {
            renderer.seek(frame as usize);
        }
        self.fade_remaining = DECLICK_FRAMES;
    }

    /// Audio callback body
    fn render(&mut self, out: &mut [f32], latency_frames: usize, rate: f32) {
        let renderer = match (self.state, self.renderer.as_mut()) {
            (TransportState::Playing, Some(renderer)) => renderer,
            _ => {
                out.fill(0.0);
                return;
            }
        };

        renderer.pull(out);

        if self.fade_remaining > 0 {
            for frame in out.chunks_exact_mut(2) {
                if self.fade_remaining == 0 {
                    break;
                }
                let gain = 1.0 - self.fade_remaining as f32 / DECLICK_FRAMES as f32;
                frame[0] *= gain;
                frame[1] *= gain;
                self.fade_remaining -= 1;
            }
        }

        let rate = rate as f64;
        self.committed += (out.len() / 2) as f64 * rate;
        self.heard = self
            .heard
            .max(self.committed - latency_frames as f64 * rate);

        let len = renderer.source().len_frames() as f64;
        if self.anchor + self.heard >= len {
            renderer.seek(0);
            self.state = TransportState::Finished;
            self.finished_unacked = true;
            self.rebase(0.0);
        }
    }
}

/// Handle the output device pulls audio through
///
/// Cheap to clone; [`LiveFeed::render`] never blocks.
#[derive(Clone)]
pub struct LiveFeed {
    transport: Arc<Mutex<Transport>>,
    controls: Arc<ChainControls>,
}

impl LiveFeed {
    /// Fill `out` (interleaved stereo) with the next audio; `latency_frames`
    /// is how far the device's playback trails this callback
    pub fn render(&self, out: &mut [f32], latency_frames: usize) {
        match self.transport.try_lock() {
            Some(mut transport) => transport.render(out, latency_frames, self.controls.rate()),
            None => out.fill(0.0),
        }
    }
}

/// Owner of the transport, the live chain parameters and the output device
pub struct PlaybackController {
    transport: Arc<Mutex<Transport>>,
    controls: Arc<ChainControls>,
    output: Mutex<Box<dyn AudioOutput>>,
    sample_rate: u32,
    listener: Mutex<Option<TransportListener>>,
    now_playing: Mutex<Option<Arc<dyn NowPlayingSink>>>,
    /// At most one export per controller, whichever `Exporter` starts it
    exporting: Arc<AtomicBool>,
}

impl PlaybackController {
    /// Create a controller; `make_output` receives the feed the output must
    /// pull from
    pub fn new<O, F>(make_output: F) -> Result<Self, EngineError>
    where
        O: AudioOutput + 'static,
        F: FnOnce(LiveFeed) -> Result<O, EngineError>,
    {
        Self::with_controls(Arc::new(ChainControls::new()), make_output)
    }

    pub fn with_controls<O, F>(controls: Arc<ChainControls>, make_output: F) -> Result<Self, EngineError>
    where
        O: AudioOutput + 'static,
        F: FnOnce(LiveFeed) -> Result<O, EngineError>,
    {
        let transport = Arc::new(Mutex::new(Transport::new()));
        let output = make_output(LiveFeed {
            transport: transport.clone(),
            controls: controls.clone(),
        })?;
        let sample_rate = output.sample_rate();

        Ok(Self {
            transport,
            controls,
            output: Mutex::new(Box::new(output)),
            sample_rate,
            listener: Mutex::new(None),
            now_playing: Mutex::new(None),
            exporting: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Output sample rate; sources should be decoded at this rate
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn controls(&self) -> Arc<ChainControls> {
        self.controls.clone()
    }

    /// Register the callback for state changes not caused by a direct call
    pub fn set_listener(&self, listener: impl Fn(&TransportChange) + Send + Sync + 'static) {
        *self.listener.lock() = Some(Arc::new(listener));
    }

    pub fn set_now_playing_sink(&self, sink: Arc<dyn NowPlayingSink>) {
        *self.now_playing.lock() = Some(sink);
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    /// Bind a new source at position 0, stopping any current playback
    pub fn load(&self, source: AudioSource, info: AssetInfo) {
        if source.sample_rate() != self.sample_rate {
            warn!(
                "Source rate {} Hz differs from output rate {} Hz",
                source.sample_rate(),
                self.sample_rate
            );
        }

        {
            let mut t = self.transport.lock();
            if t.state == TransportState::Playing {
                self.output.lock().stop();
            }
            let chain = StageChain::live(source.sample_rate(), self.controls.clone());
            info!(
                "Loaded '{}' ({:.2}s, {} Hz)",
                info.title,
                source.duration_secs(),
                source.sample_rate()
            );
            t.renderer = Some(ChainRenderer::new(source, chain, LIVE_FEED_FRAMES));
            t.info = info;
            t.state = TransportState::Loaded;
            t.finished_unacked = false;
            t.restart_at(0.0);
        }
        self.publish_now_playing();
    }

    /// Start (or resume) playback from the current position
    pub fn play(&self) -> Result<(), EngineError> {
        self.check_end();
        {
            let mut t = self.transport.lock();
            let state = t.state;
            match state {
                TransportState::Idle => return Err(EngineError::NoSourceLoaded),
                TransportState::Playing => return Ok(()),
                _ => {}
            }

            self.output.lock().start()?;

            let anchor = t.anchor;
            t.restart_at(anchor);
            t.state = TransportState::Playing;
            debug!("Playing from {:.3}s", t.position_secs());
        }
        self.publish_now_playing();
        Ok(())
    }

    /// Halt playback, keeping the audible position
    pub fn pause(&self) -> Result<(), EngineError> {
        self.check_end();
        {
            let mut t = self.transport.lock();
            let state = t.state;
            match state {
                TransportState::Idle => return Err(EngineError::NoSourceLoaded),
                TransportState::Playing => self.pause_locked(&mut t),
                _ => return Ok(()),
            }
        }
        self.publish_now_playing();
        Ok(())
    }

    fn pause_locked(&self, t: &mut Transport) {
        let position = t.position_frames();
        t.rebase(position);
        t.state = TransportState::Paused;
        self.output.lock().stop();
        debug!("Paused at {:.3}s", t.position_secs());
    }

    /// Stop and rewind to the start
    pub fn stop(&self) -> Result<(), EngineError> {
        self.check_end();
        {
            let mut t = self.transport.lock();
            if t.state == TransportState::Idle {
                return Err(EngineError::NoSourceLoaded);
            }
            if t.state == TransportState::Playing {
                self.output.lock().stop();
            }
            t.restart_at(0.0);
            t.state = TransportState::Loaded;
        }
        self.publish_now_playing();
        Ok(())
    }

    /// Jump to `seconds`; negative values clamp to 0, the end is out of range
    pub fn seek(&self, seconds: f64) -> Result<(), EngineError> {
        self.check_end();
        {
            let mut t = self.transport.lock();
            let (sample_rate, len, duration) = match t.source() {
                Some(source) => (
                    source.sample_rate() as f64,
                    source.len_frames() as f64,
                    source.duration_secs(),
                ),
                None => return Err(EngineError::NoSourceLoaded),
            };

            let clamped = if seconds.is_nan() { 0.0 } else { seconds.max(0.0) };
            let frame = (clamped * sample_rate).floor();
            if frame >= len {
                return Err(EngineError::SeekOutOfRange {
                    requested: seconds,
                    duration,
                });
            }

            t.restart_at(frame);
            if t.state == TransportState::Finished {
                t.state = TransportState::Loaded;
            }
            debug!("Seek to {:.3}s", clamped);
        }
        self.publish_now_playing();
        Ok(())
    }

    /// Audible position in seconds
    pub fn current_time(&self) -> f64 {
        self.check_end();
        self.transport.lock().position_secs()
    }

    /// Source duration in seconds (0 when nothing is loaded)
    pub fn duration(&self) -> f64 {
        self.transport.lock().duration_secs()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == TransportState::Playing
    }

    pub fn state(&self) -> TransportState {
        self.check_end();
        self.transport.lock().state
    }

    /// Pick up end-of-file and device-loss signals from the audio side
    pub fn poll(&self) {
        self.check_end();
        let lost = self.output.lock().take_interruption();
        if lost {
            warn!("Audio device lost");
            self.interrupt(ChangeCause::Interruption);
        }
    }

    /// Another audio client took the device: pause without rewinding
    pub fn interruption_began(&self) {
        self.interrupt(ChangeCause::Interruption);
    }

    /// The device is available again; playback does not resume by itself
    pub fn interruption_ended(&self) -> Result<(), EngineError> {
        self.output.lock().prepare()
    }

    fn interrupt(&self, cause: ChangeCause) {
        let change = {
            let mut t = self.transport.lock();
            if t.state != TransportState::Playing {
                return;
            }
            self.pause_locked(&mut t);
            TransportChange {
                cause,
                state: t.state,
                position: t.position_secs(),
            }
        };
        self.emit(&change);
        self.publish_now_playing();
    }

    /// Perform a remote command, notifying the listener if the play state flipped
    pub fn handle_remote(&self, command: RemoteCommand) -> Result<(), EngineError> {
        let was_playing = self.is_playing();
        match command {
            RemoteCommand::Play => self.play()?,
            RemoteCommand::Pause => self.pause()?,
            RemoteCommand::TogglePlayPause => {
                if was_playing {
                    self.pause()?
                } else {
                    self.play()?
                }
            }
            RemoteCommand::Seek(seconds) => self.seek(seconds)?,
        }
        if self.is_playing() != was_playing {
            self.notify(ChangeCause::Remote);
        }
        Ok(())
    }

    /// Acknowledge an end of file flagged by the callback
    fn check_end(&self) {
        let change = {
            let mut t = self.transport.lock();
            if !t.finished_unacked {
                return;
            }
            t.finished_unacked = false;
            self.output.lock().stop();
            TransportChange {
                cause: ChangeCause::EndOfFile,
                state: t.state,
                position: t.position_secs(),
            }
        };
        info!("Reached end of file");
        self.emit(&change);
        self.publish_now_playing();
    }

    fn notify(&self, cause: ChangeCause) {
        let change = {
            let t = self.transport.lock();
            TransportChange {
                cause,
                state: t.state,
                position: t.position_secs(),
            }
        };
        self.emit(&change);
    }

    fn emit(&self, change: &TransportChange) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener(change);
        }
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    pub fn set_rate(&self, rate: f32) {
        self.controls.set_rate(rate);
        self.publish_now_playing();
    }

    /// Set rate, overriding the pitch link for this call only
    pub fn set_rate_with(&self, rate: f32, link_override: Option<bool>) {
        self.controls.set_rate_with(rate, link_override);
        self.publish_now_playing();
    }

    pub fn set_pitch(&self, cents: f32) {
        self.controls.set_pitch(cents);
    }

    pub fn set_reverb_mix(&self, mix: f32) {
        self.controls.set_reverb_mix(mix);
    }

    pub fn set_pitch_linked(&self, linked: bool) {
        self.controls.set_pitch_linked(linked);
    }

    /// Overwrite all parameters at once
    pub fn apply_params(&self, params: StageParams) {
        self.controls.apply(params);
        self.publish_now_playing();
    }

    pub fn params(&self) -> StageParams {
        self.controls.snapshot()
    }

    // ------------------------------------------------------------------
    // Now playing
    // ------------------------------------------------------------------

    /// Current metadata, or `None` when nothing is loaded
    pub fn now_playing(&self) -> Option<NowPlayingInfo> {
        let t = self.transport.lock();
        t.source()?;
        Some(NowPlayingInfo {
            title: t.info.title.clone(),
            artist: t.info.artist.clone(),
            artwork: t.info.artwork.clone(),
            duration: t.duration_secs(),
            elapsed: t.position_secs(),
            rate: if t.state == TransportState::Playing {
                self.controls.rate()
            } else {
                0.0
            },
        })
    }

    fn publish_now_playing(&self) {
        let sink = self.now_playing.lock().clone();
        if let Some(sink) = sink {
            if let Some(info) = self.now_playing() {
                sink.publish(&info);
            }
        }
    }

    // ------------------------------------------------------------------
    // Export hand-off
    // ------------------------------------------------------------------

    /// An export of this controller's source is running
    pub fn is_exporting(&self) -> bool {
        self.exporting.load(Ordering::Acquire)
    }

    fn claim_export(&self) -> Result<ExportGuard, EngineError> {
        self.exporting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| EngineError::ExportInProgress)?;
        Ok(ExportGuard {
            exporting: self.exporting.clone(),
        })
    }

    /// Claim the export slot, pause live playback and hand out what an
    /// offline render needs
    pub(crate) fn suspend_for_export(&self) -> Result<ExportHandoff, EngineError> {
        let guard = self.claim_export()?;
        self.check_end();
        let (source, resume, change) = {
            let mut t = self.transport.lock();
            let source = t.source().cloned().ok_or(EngineError::NoSourceLoaded)?;
            let was_playing = t.state == TransportState::Playing;
            let change = if was_playing {
                self.pause_locked(&mut t);
                Some(TransportChange {
                    cause: ChangeCause::Export,
                    state: t.state,
                    position: t.position_secs(),
                })
            } else {
                None
            };
            let resume = ResumePoint {
                source_id: source.id(),
                was_playing,
            };
            (source, resume, change)
        };

        if let Some(change) = change {
            self.emit(&change);
            self.publish_now_playing();
        }
        Ok(ExportHandoff {
            source,
            params: self.controls.snapshot(),
            resume,
            guard,
        })
    }

    /// Resume playback if it was playing before the export and nothing has
    /// moved on since (same source, still paused)
    ///
    /// A failed restart leaves the transport paused; the listener hears an
    /// `Export` change in that state and the error is returned.
    pub(crate) fn resume_after_export(&self, point: ResumePoint) -> Result<(), EngineError> {
        if !point.was_playing {
            return Ok(());
        }
        {
            let t = self.transport.lock();
            let same_source = t.source().map(|s| s.id()) == Some(point.source_id);
            if !same_source || t.state != TransportState::Paused {
                debug!("Not resuming after export: transport moved on");
                return Ok(());
            }
        }
        let resumed = self.play();
        if let Err(e) = &resumed {
            warn!("Could not resume playback after export: {}", e);
        }
        self.notify(ChangeCause::Export);
        resumed
    }
}
