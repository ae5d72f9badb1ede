//! Manually clocked output device and synthetic sources for tests

use crate::controller::{LiveFeed, PlaybackController};
use crate::device::AudioOutput;
use crate::error::EngineError;
use crate::now_playing::{NowPlayingInfo, NowPlayingSink};
use crate::source::AudioSource;
use parking_lot::Mutex;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Largest block the fake device renders per callback
const CALLBACK_FRAMES: usize = 512;

/// A stereo 440 Hz sine of `seconds` length
pub(crate) fn sine_source(seconds: f64, sample_rate: u32) -> AudioSource {
    let frames = (seconds * sample_rate as f64).round() as usize;
    let samples = (0..frames)
        .flat_map(|i| {
            let s = (2.0 * PI * 440.0 * i as f32 / sample_rate as f32).sin() * 0.5;
            [s, s]
        })
        .collect();
    AudioSource::new(samples, sample_rate, 2).unwrap()
}

/// Silence ending in a loud 440 Hz burst of `burst_frames`, so a render that
/// drops or delays the last frames of a source is easy to spot
pub(crate) fn tail_burst_source(seconds: f64, burst_frames: usize, sample_rate: u32) -> AudioSource {
    let frames = (seconds * sample_rate as f64).round() as usize;
    let burst_start = frames.saturating_sub(burst_frames);
    let samples = (0..frames)
        .flat_map(|i| {
            let s = if i >= burst_start {
                (2.0 * PI * 440.0 * i as f32 / sample_rate as f32).sin() * 0.5
            } else {
                0.0
            };
            [s, s]
        })
        .collect();
    AudioSource::new(samples, sample_rate, 2).unwrap()
}

/// Largest absolute sample
pub(crate) fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
}

/// Output device whose clock only advances when a test says so
pub(crate) struct ManualDevice {
    feed: Mutex<Option<LiveFeed>>,
    sample_rate: u32,
    running: AtomicBool,
    fail_start: AtomicBool,
    interrupted: AtomicBool,
    latency_frames: AtomicUsize,
    prepared: AtomicUsize,
}

impl ManualDevice {
    fn new(sample_rate: u32) -> Self {
        Self {
            feed: Mutex::new(None),
            sample_rate,
            running: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            latency_frames: AtomicUsize::new(0),
            prepared: AtomicUsize::new(0),
        }
    }

    /// Run the device for `seconds`, returning what it played (empty while
    /// stopped)
    pub fn advance_secs(&self, seconds: f64) -> Vec<f32> {
        let total = (seconds * self.sample_rate as f64).round() as usize;
        let mut played = Vec::with_capacity(total * 2);
        if !self.is_running() {
            return played;
        }
        let Some(feed) = self.feed.lock().clone() else {
            return played;
        };

        let latency = self.latency_frames.load(Ordering::Acquire);
        let mut buffer = vec![0.0f32; CALLBACK_FRAMES * 2];
        let mut done = 0;
        while done < total {
            let frames = (total - done).min(CALLBACK_FRAMES);
            let block = &mut buffer[..frames * 2];
            feed.render(block, latency);
            played.extend_from_slice(block);
            done += frames;
        }
        played
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_latency_frames(&self, frames: usize) {
        self.latency_frames.store(frames, Ordering::Release);
    }

    pub fn fail_next_start(&self) {
        self.fail_start.store(true, Ordering::Release);
    }

    pub fn lose_device(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    pub fn prepare_count(&self) -> usize {
        self.prepared.load(Ordering::Acquire)
    }
}

pub(crate) struct ManualOutput {
    device: Arc<ManualDevice>,
}

impl AudioOutput for ManualOutput {
    fn start(&mut self) -> Result<(), EngineError> {
        if self.device.fail_start.swap(false, Ordering::AcqRel) {
            return Err(EngineError::EngineStartFailure("device busy".into()));
        }
        self.device.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) {
        self.device.running.store(false, Ordering::Release);
    }

    fn prepare(&mut self) -> Result<(), EngineError> {
        self.device.prepared.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn take_interruption(&mut self) -> bool {
        self.device.interrupted.swap(false, Ordering::AcqRel)
    }

    fn sample_rate(&self) -> u32 {
        self.device.sample_rate
    }
}

/// Controller wired to a fresh [`ManualDevice`]
pub(crate) fn controller(sample_rate: u32) -> (PlaybackController, Arc<ManualDevice>) {
    let device = Arc::new(ManualDevice::new(sample_rate));
    let attached = device.clone();
    let controller = PlaybackController::new(move |feed| {
        *attached.feed.lock() = Some(feed);
        Ok(ManualOutput { device: attached })
    })
    .unwrap();
    (controller, device)
}

/// Now-playing sink that keeps every update
#[derive(Default)]
pub(crate) struct RecordingSink {
    published: Mutex<Vec<NowPlayingInfo>>,
}

impl RecordingSink {
    pub fn published(&self) -> Vec<NowPlayingInfo> {
        self.published.lock().clone()
    }
}

impl NowPlayingSink for RecordingSink {
    fn publish(&self, info: &NowPlayingInfo) {
        self.published.lock().push(info.clone());
    }
}
