//! Audio output backends
//!
//! The cpal stream is not `Send` on every platform, so it lives on a dedicated
//! thread that takes commands over a channel. The controller only ever talks
//! to the [`AudioOutput`] trait.

use crate::controller::LiveFeed;
use crate::error::EngineError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Maximum frames rendered per pass when the device is not stereo
const MAX_CALLBACK_FRAMES: usize = 4096;

/// An output path the controller can start and stop
pub trait AudioOutput: Send {
    /// Begin pulling from the live feed
    fn start(&mut self) -> Result<(), EngineError>;

    /// Stop pulling; must not block on the audio callback
    fn stop(&mut self);

    /// Re-establish the output path after an interruption
    fn prepare(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Returns true once after the device has been lost
    fn take_interruption(&mut self) -> bool {
        false
    }

    /// Frames per second consumed by the device
    fn sample_rate(&self) -> u32;
}

enum DeviceCommand {
    Start(Sender<Result<(), EngineError>>),
    Stop,
    Rebuild(Sender<Result<(), EngineError>>),
    Shutdown,
}

/// Default cpal output device
pub struct CpalOutput {
    cmd_tx: Sender<DeviceCommand>,
    sample_rate: u32,
    device_lost: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the default output device and attach it to `feed` (paused)
    pub fn open(feed: LiveFeed) -> Result<Self, EngineError> {
        let (cmd_tx, cmd_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);
        let device_lost = Arc::new(AtomicBool::new(false));
        let lost = device_lost.clone();

        let thread = thread::Builder::new()
            .name("lull-audio-device".into())
            .spawn(move || run_device_thread(feed, cmd_rx, ready_tx, lost))
            .map_err(|e| EngineError::EngineStartFailure(e.to_string()))?;

        let sample_rate = ready_rx
            .recv()
            .map_err(|_| EngineError::EngineStartFailure("audio thread exited".into()))??;

        info!("Audio output ready at {} Hz", sample_rate);
        Ok(Self {
            cmd_tx,
            sample_rate,
            device_lost,
            thread: Some(thread),
        })
    }

    fn request(
        &self,
        make: impl FnOnce(Sender<Result<(), EngineError>>) -> DeviceCommand,
    ) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.cmd_tx
            .send(make(reply_tx))
            .map_err(|_| EngineError::EngineStartFailure("audio thread stopped".into()))?;
        reply_rx
            .recv()
            .map_err(|_| EngineError::EngineStartFailure("audio thread stopped".into()))?
    }
}

impl AudioOutput for CpalOutput {
    fn start(&mut self) -> Result<(), EngineError> {
        self.request(DeviceCommand::Start)
    }

    fn stop(&mut self) {
        let _ = self.cmd_tx.send(DeviceCommand::Stop);
    }

    fn prepare(&mut self) -> Result<(), EngineError> {
        self.request(DeviceCommand::Rebuild)
    }

    fn take_interruption(&mut self) -> bool {
        self.device_lost.swap(false, Ordering::AcqRel)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(DeviceCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_device_thread(
    feed: LiveFeed,
    cmd_rx: Receiver<DeviceCommand>,
    ready_tx: Sender<Result<u32, EngineError>>,
    device_lost: Arc<AtomicBool>,
) {
    let (mut stream, sample_rate) = match build_stream(&feed, &device_lost) {
        Ok((stream, rate)) => (Some(stream), rate),
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let _ = ready_tx.send(Ok(sample_rate));

    for cmd in cmd_rx.iter() {
        match cmd {
            DeviceCommand::Start(reply) => {
                let result = match &stream {
                    Some(s) => s
                        .play()
                        .map_err(|e| EngineError::EngineStartFailure(e.to_string())),
                    None => Err(EngineError::EngineStartFailure(
                        "no output stream".into(),
                    )),
                };
                let _ = reply.send(result);
            }
            DeviceCommand::Stop => {
                if let Some(s) = &stream {
                    if let Err(e) = s.pause() {
                        warn!("Failed to pause output stream: {}", e);
                    }
                }
            }
            DeviceCommand::Rebuild(reply) => {
                // Release the old device before opening a new one
                stream = None;
                let result = build_stream(&feed, &device_lost).map(|(s, rate)| {
                    if rate != sample_rate {
                        warn!(
                            "Output device changed rate {} -> {} Hz; playback speed will be off",
                            sample_rate, rate
                        );
                    }
                    stream = Some(s);
                    device_lost.store(false, Ordering::Release);
                });
                let _ = reply.send(result);
            }
            DeviceCommand::Shutdown => break,
        }
    }
    debug!("Audio device thread exiting");
}

fn build_stream(
    feed: &LiveFeed,
    device_lost: &Arc<AtomicBool>,
) -> Result<(cpal::Stream, u32), EngineError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| EngineError::EngineStartFailure("No audio output device found".into()))?;

    let config = device
        .default_output_config()
        .map_err(|e| EngineError::EngineStartFailure(format!("Failed to get audio config: {}", e)))?;

    let sample_rate = config.sample_rate().0;
    let channels = config.channels() as usize;

    let feed = feed.clone();
    let lost = device_lost.clone();

    // Pre-allocate stereo buffer (avoid allocation in audio callback)
    let mut stereo = vec![0.0f32; MAX_CALLBACK_FRAMES * 2];

    let stream = device
        .build_output_stream(
            &config.into(),
            move |data: &mut [f32], info: &cpal::OutputCallbackInfo| {
                let timestamp = info.timestamp();
                let latency_frames = timestamp
                    .playback
                    .duration_since(&timestamp.callback)
                    .map(|d| (d.as_secs_f64() * sample_rate as f64) as usize)
                    .unwrap_or(0);

                if channels == 2 {
                    feed.render(data, latency_frames);
                    return;
                }

                for chunk in data.chunks_mut(MAX_CALLBACK_FRAMES * channels) {
                    let frames = chunk.len() / channels;
                    let stereo = &mut stereo[..frames * 2];
                    feed.render(stereo, latency_frames);
                    for (i, frame) in chunk.chunks_exact_mut(channels).enumerate() {
                        let (l, r) = (stereo[i * 2], stereo[i * 2 + 1]);
                        if channels == 1 {
                            frame[0] = (l + r) * 0.5;
                        } else {
                            frame[0] = l;
                            frame[1] = r;
                            frame[2..].fill(0.0);
                        }
                    }
                }
            },
            move |err| {
                error!("Audio stream error: {}", err);
                lost.store(true, Ordering::Release);
            },
            None,
        )
        .map_err(|e| {
            EngineError::EngineStartFailure(format!("Failed to create audio stream: {}", e))
        })?;

    // Some backends start streams immediately
    if let Err(e) = stream.pause() {
        debug!("Could not pause new stream: {}", e);
    }

    Ok((stream, sample_rate))
}
