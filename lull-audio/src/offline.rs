//! Offline export: the live chain's parameters rendered to a sink
//!
//! An export pauses live playback, renders the loaded source with a frozen
//! snapshot of the parameters as fast as the sink accepts blocks, then puts
//! the live transport back the way it was. Only one export per controller
//! runs at a time, however many `Exporter`s are pointed at it.

use crate::controller::{ExportHandoff, PlaybackController};
use crate::error::EngineError;
use crate::render::{BlockRender, OfflineStream, RenderStatus};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Maximum frames per block handed to the sink
pub const EXPORT_BLOCK_FRAMES: usize = 4096;

/// Consecutive "not ready" answers tolerated before giving up
const MAX_STALLS: usize = 64;

/// Error type sinks report
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Destination of an offline render
pub trait ExportSink {
    /// Handle returned on success (a path, an in-memory buffer...)
    type Output;

    fn begin(&mut self, sample_rate: u32, channels: u16) -> Result<(), SinkError>;

    /// Interleaved stereo samples
    fn write_block(&mut self, samples: &[f32]) -> Result<(), SinkError>;

    fn finish(self) -> Result<Self::Output, SinkError>
    where
        Self: Sized;

    /// Discard partial output after a failure
    fn abort(self)
    where
        Self: Sized,
    {
    }
}

/// Result of a successful export
#[derive(Debug, Clone, PartialEq)]
pub struct ExportReport<T> {
    pub output: T,
    pub frames: usize,
    pub sample_rate: u32,
    /// Set when playback was running before the export and could not restart
    pub resume_error: Option<EngineError>,
}

impl<T> ExportReport<T> {
    /// Rendered length in seconds
    pub fn duration_secs(&self) -> f64 {
        self.frames as f64 / self.sample_rate as f64
    }
}

/// Runs exports of a controller's loaded source
///
/// The busy flag lives on the controller, so two exporters cannot render
/// the same controller at once.
#[derive(Debug, Clone, Copy, Default)]
pub struct Exporter;

impl Exporter {
    pub fn new() -> Self {
        Self
    }

    /// Export on the calling thread
    pub fn export<S: ExportSink>(
        &self,
        controller: &PlaybackController,
        sink: S,
    ) -> Result<ExportReport<S::Output>, EngineError> {
        let ExportHandoff {
            source,
            params,
            resume,
            guard,
        } = controller.suspend_for_export()?;

        let result = render_to_sink(OfflineStream::new(source, params), sink);
        let resumed = controller.resume_after_export(resume);
        drop(guard);
        settle(result, resumed)
    }

    /// Export on a worker thread; `on_complete` receives the result
    ///
    /// The busy and no-source checks happen before this returns, and live
    /// playback is already paused by then.
    pub fn export_async<S, F>(
        &self,
        controller: Arc<PlaybackController>,
        sink: S,
        on_complete: F,
    ) -> Result<JoinHandle<()>, EngineError>
    where
        S: ExportSink + Send + 'static,
        S::Output: Send + 'static,
        F: FnOnce(Result<ExportReport<S::Output>, EngineError>) + Send + 'static,
    {
        let ExportHandoff {
            source,
            params,
            resume,
            guard,
        } = controller.suspend_for_export()?;

        let worker = controller.clone();
        thread::Builder::new()
            .name("lull-export".into())
            .spawn(move || {
                let result = render_to_sink(OfflineStream::new(source, params), sink);
                let resumed = worker.resume_after_export(resume);
                drop(guard);
                on_complete(settle(result, resumed));
            })
            .map_err(|e| {
                // The guard went down with the closure
                if let Err(resume_err) = controller.resume_after_export(resume) {
                    error!("Playback not resumed after export setup failed: {}", resume_err);
                }
                EngineError::RenderFailure(format!("failed to spawn export thread: {}", e))
            })
    }
}

/// Attach the outcome of restoring live playback to the export result
fn settle<T>(
    result: Result<ExportReport<T>, EngineError>,
    resumed: Result<(), EngineError>,
) -> Result<ExportReport<T>, EngineError> {
    match (result, resumed) {
        (Ok(report), Err(e)) => Ok(ExportReport {
            resume_error: Some(e),
            ..report
        }),
        (Err(e), Err(resume_err)) => {
            error!("Playback not resumed after failed export: {}", resume_err);
            Err(e)
        }
        (result, Ok(())) => result,
    }
}

fn render_to_sink<S: ExportSink>(
    mut stream: OfflineStream,
    mut sink: S,
) -> Result<ExportReport<S::Output>, EngineError> {
    let sample_rate = stream.sample_rate();
    info!(
        "Export started: {} frames at {} Hz ({:?})",
        stream.expected_frames(),
        sample_rate,
        stream.params()
    );

    if let Err(e) = sink.begin(sample_rate, 2) {
        error!("Export sink failed to open: {}", e);
        sink.abort();
        return Err(EngineError::RenderFailure(e.to_string()));
    }

    let frames = match drive(&mut stream, &mut sink, EXPORT_BLOCK_FRAMES) {
        Ok(frames) => frames,
        Err(e) => {
            error!("Export failed: {}", e);
            sink.abort();
            return Err(e);
        }
    };

    let output = sink.finish().map_err(|e| {
        error!("Export sink failed to finish: {}", e);
        EngineError::RenderFailure(e.to_string())
    })?;

    info!("Export finished: {} frames", frames);
    Ok(ExportReport {
        output,
        frames,
        sample_rate,
        resume_error: None,
    })
}

/// Pull blocks from `render` into `sink` until it reports completion
///
/// "Not ready" is retried in place; a long run of them is a stall.
pub(crate) fn drive<R: BlockRender, S: ExportSink>(
    render: &mut R,
    sink: &mut S,
    max_frames: usize,
) -> Result<usize, EngineError> {
    let mut block = Vec::with_capacity(max_frames * 2);
    let mut total = 0;
    let mut stalls = 0;

    loop {
        block.clear();
        match render.render_block(&mut block, max_frames)? {
            RenderStatus::Rendered(frames) => {
                stalls = 0;
                sink.write_block(&block)
                    .map_err(|e| EngineError::RenderFailure(e.to_string()))?;
                total += frames;
            }
            RenderStatus::NotReady => {
                stalls += 1;
                if stalls > MAX_STALLS {
                    return Err(EngineError::RenderFailure(format!(
                        "renderer stalled after {} frames",
                        total
                    )));
                }
                debug!("Renderer not ready, retrying");
            }
            RenderStatus::Finished => return Ok(total),
        }
    }
}

/// 32-bit float stereo WAV file
pub struct WavSink {
    path: PathBuf,
    writer: Option<WavWriter<BufWriter<File>>>,
}

impl WavSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ExportSink for WavSink {
    type Output = PathBuf;

    fn begin(&mut self, sample_rate: u32, channels: u16) -> Result<(), SinkError> {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        self.writer = Some(WavWriter::create(&self.path, spec)?);
        Ok(())
    }

    fn write_block(&mut self, samples: &[f32]) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or("WAV sink written before begin")?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<PathBuf, SinkError> {
        let writer = self.writer.take().ok_or("WAV sink finished before begin")?;
        if let Err(e) = writer.finalize() {
            let _ = std::fs::remove_file(&self.path);
            return Err(e.into());
        }
        Ok(self.path)
    }

    fn abort(mut self) {
        let started = self.writer.take().is_some();
        if started {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Could not remove partial export {:?}: {}", self.path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::TransportState;
    use crate::source::AssetInfo;
    use crate::controller::{ChangeCause, TransportChange};
    use crate::test_support::{controller, peak, sine_source, tail_burst_source};
    use parking_lot::Mutex;
    use crossbeam_channel::{bounded, Receiver, Sender};
    use std::collections::VecDeque;

    const RATE: u32 = 8000;

    /// Sink that keeps everything in memory
    #[derive(Default)]
    struct MemorySink {
        samples: Vec<f32>,
        begun: bool,
    }

    impl ExportSink for MemorySink {
        type Output = Vec<f32>;

        fn begin(&mut self, _sample_rate: u32, channels: u16) -> Result<(), SinkError> {
            assert_eq!(channels, 2);
            self.begun = true;
            Ok(())
        }

        fn write_block(&mut self, samples: &[f32]) -> Result<(), SinkError> {
            assert!(self.begun);
            self.samples.extend_from_slice(samples);
            Ok(())
        }

        fn finish(self) -> Result<Vec<f32>, SinkError> {
            Ok(self.samples)
        }
    }

    /// Sink that blocks on its first write until released
    struct GateSink {
        entered: Sender<()>,
        release: Receiver<()>,
        frames: usize,
        waited: bool,
    }

    impl ExportSink for GateSink {
        type Output = usize;

        fn begin(&mut self, _sample_rate: u32, _channels: u16) -> Result<(), SinkError> {
            Ok(())
        }

        fn write_block(&mut self, samples: &[f32]) -> Result<(), SinkError> {
            if !self.waited {
                self.waited = true;
                let _ = self.entered.send(());
                let _ = self.release.recv();
            }
            self.frames += samples.len() / 2;
            Ok(())
        }

        fn finish(self) -> Result<usize, SinkError> {
            Ok(self.frames)
        }
    }

    /// Sink whose writes always fail
    struct FailingSink;

    impl ExportSink for FailingSink {
        type Output = ();

        fn begin(&mut self, _sample_rate: u32, _channels: u16) -> Result<(), SinkError> {
            Ok(())
        }

        fn write_block(&mut self, _samples: &[f32]) -> Result<(), SinkError> {
            Err("disk full".into())
        }

        fn finish(self) -> Result<(), SinkError> {
            Ok(())
        }
    }

    /// Renderer replaying a fixed script of statuses
    struct Scripted(VecDeque<RenderStatus>);

    impl BlockRender for Scripted {
        fn render_block(
            &mut self,
            out: &mut Vec<f32>,
            _max_frames: usize,
        ) -> Result<RenderStatus, EngineError> {
            let status = self.0.pop_front().unwrap_or(RenderStatus::Finished);
            if let RenderStatus::Rendered(frames) = status {
                out.extend(std::iter::repeat(0.25).take(frames * 2));
            }
            Ok(status)
        }
    }

    #[test]
    fn test_export_unity_has_source_length() {
        let (controller, _) = controller(RATE);
        controller.load(sine_source(2.0, RATE), AssetInfo::default());

        let report = Exporter::new()
            .export(&controller, MemorySink::default())
            .unwrap();
        assert_eq!(report.frames, 16000);
        assert_eq!(report.output.len(), 16000 * 2);
        assert!((report.duration_secs() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_export_rate_two_halves_length() {
        let (controller, _) = controller(RATE);
        controller.load(sine_source(2.0, RATE), AssetInfo::default());
        controller.set_rate(2.0);

        let report = Exporter::new()
            .export(&controller, MemorySink::default())
            .unwrap();
        assert_eq!(report.frames, 8000);
    }

    #[test]
    fn test_export_without_source() {
        let (controller, _) = controller(RATE);
        let err = Exporter::new()
            .export(&controller, MemorySink::default())
            .unwrap_err();
        assert_eq!(err, EngineError::NoSourceLoaded);
    }

    #[test]
    fn test_export_resumes_playback() {
        let (controller, device) = controller(RATE);
        controller.load(sine_source(3.0, RATE), AssetInfo::default());
        controller.play().unwrap();
        device.advance_secs(1.0);

        Exporter::new()
            .export(&controller, MemorySink::default())
            .unwrap();

        assert!(controller.is_playing());
        assert!(device.is_running());
        assert!((controller.current_time() - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_failed_export_restores_playback() {
        let (controller, device) = controller(RATE);
        controller.load(sine_source(3.0, RATE), AssetInfo::default());
        controller.set_reverb_mix(40.0);
        controller.play().unwrap();
        device.advance_secs(0.5);

        let err = Exporter::new()
            .export(&controller, FailingSink)
            .unwrap_err();
        assert!(matches!(err, EngineError::RenderFailure(_)));
        assert!(controller.is_playing());
        assert_eq!(controller.params().reverb_mix, 40.0);
    }

    #[test]
    fn test_paused_export_stays_paused() {
        let (controller, device) = controller(RATE);
        controller.load(sine_source(3.0, RATE), AssetInfo::default());
        controller.play().unwrap();
        device.advance_secs(0.5);
        controller.pause().unwrap();

        Exporter::new()
            .export(&controller, MemorySink::default())
            .unwrap();
        assert_eq!(controller.state(), TransportState::Paused);
    }

    #[test]
    fn test_second_export_is_rejected() {
        let (controller, _) = controller(RATE);
        let controller = Arc::new(controller);
        controller.load(sine_source(2.0, RATE), AssetInfo::default());

        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(1);
        let exporter = Exporter::new();

        let handle = exporter
            .export_async(
                controller.clone(),
                GateSink {
                    entered: entered_tx,
                    release: release_rx,
                    frames: 0,
                    waited: false,
                },
                move |result| {
                    let _ = done_tx.send(result);
                },
            )
            .unwrap();

        entered_rx.recv().unwrap();
        assert!(controller.is_exporting());
        let err = exporter
            .export(&controller, MemorySink::default())
            .unwrap_err();
        assert_eq!(err, EngineError::ExportInProgress);

        release_tx.send(()).unwrap();
        handle.join().unwrap();
        let report = done_rx.recv().unwrap().unwrap();
        assert_eq!(report.output, 16000);
        assert!(!controller.is_exporting());
    }

    #[test]
    fn test_separate_exporters_share_one_slot() {
        let (controller, device) = controller(RATE);
        let controller = Arc::new(controller);
        controller.load(sine_source(2.0, RATE), AssetInfo::default());
        controller.play().unwrap();
        device.advance_secs(0.5);

        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let handle = Exporter::new()
            .export_async(
                controller.clone(),
                GateSink {
                    entered: entered_tx,
                    release: release_rx,
                    frames: 0,
                    waited: false,
                },
                |_| {},
            )
            .unwrap();
        entered_rx.recv().unwrap();

        // A second exporter must not render, nor resume playback mid-export
        let err = Exporter::new()
            .export(&controller, MemorySink::default())
            .unwrap_err();
        assert_eq!(err, EngineError::ExportInProgress);
        let err = Exporter::new()
            .export_async(controller.clone(), MemorySink::default(), |_| {})
            .unwrap_err();
        assert_eq!(err, EngineError::ExportInProgress);
        assert_eq!(controller.state(), TransportState::Paused);
        assert!(!device.is_running());

        release_tx.send(()).unwrap();
        handle.join().unwrap();
        assert!(!controller.is_exporting());
        assert!(controller.is_playing());
    }

    #[test]
    fn test_slot_is_released_without_source() {
        let (controller, _) = controller(RATE);
        let exporter = Exporter::new();
        assert_eq!(
            exporter.export(&controller, MemorySink::default()),
            Err(EngineError::NoSourceLoaded)
        );
        assert!(!controller.is_exporting());

        controller.load(sine_source(0.5, RATE), AssetInfo::default());
        assert!(exporter.export(&controller, MemorySink::default()).is_ok());
    }

    #[test]
    fn test_failed_resume_is_reported() {
        let (controller, device) = controller(RATE);
        controller.load(sine_source(3.0, RATE), AssetInfo::default());
        let changes = Arc::new(Mutex::new(Vec::<TransportChange>::new()));
        let sink = changes.clone();
        controller.set_listener(move |change| sink.lock().push(change.clone()));

        controller.play().unwrap();
        device.advance_secs(1.0);
        device.fail_next_start();

        let report = Exporter::new()
            .export(&controller, MemorySink::default())
            .unwrap();
        assert_eq!(report.frames, 24000);
        assert!(matches!(
            report.resume_error,
            Some(EngineError::EngineStartFailure(_))
        ));
        assert_eq!(controller.state(), TransportState::Paused);

        let changes = changes.lock();
        let last = changes.last().unwrap();
        assert_eq!(last.cause, ChangeCause::Export);
        assert_eq!(last.state, TransportState::Paused);
    }

    #[test]
    fn test_successful_resume_has_no_error() {
        let (controller, device) = controller(RATE);
        controller.load(sine_source(1.0, RATE), AssetInfo::default());
        controller.play().unwrap();
        device.advance_secs(0.25);

        let report = Exporter::new()
            .export(&controller, MemorySink::default())
            .unwrap();
        assert_eq!(report.resume_error, None);
    }

    #[test]
    fn test_off_grid_settings_keep_the_last_frames() {
        // (rate, pitch): a slow-down whose hop is fractional, and a semitone up
        for (rate, pitch) in [(0.9006f32, 0.0f32), (1.0, 100.0)] {
            let (controller, _) = controller(RATE);
            controller.load(tail_burst_source(120.0, 200, RATE), AssetInfo::default());
            controller.set_rate(rate);
            controller.set_pitch(pitch);

            let report = Exporter::new()
                .export(&controller, MemorySink::default())
                .unwrap();
            let expected = (960_000.0 / rate as f64).round() as usize;
            assert_eq!(report.frames, expected);

            // The burst closes the source, so it must close the render too
            let tail = &report.output[report.output.len() - 512 * 2..];
            let level = peak(tail);
            assert!(level > 0.15, "rate {} pitch {}: tail peak {}", rate, pitch, level);
        }
    }

    #[test]
    fn test_drive_retries_not_ready_in_place() {
        let mut render = Scripted(VecDeque::from(vec![
            RenderStatus::NotReady,
            RenderStatus::Rendered(10),
            RenderStatus::NotReady,
            RenderStatus::NotReady,
            RenderStatus::Rendered(5),
            RenderStatus::Finished,
        ]));
        let mut sink = MemorySink::default();
        sink.begun = true;

        let frames = drive(&mut render, &mut sink, 4096).unwrap();
        assert_eq!(frames, 15);
        assert_eq!(sink.samples.len(), 30);
    }

    #[test]
    fn test_drive_gives_up_on_stall() {
        let mut render = Scripted(VecDeque::from(vec![RenderStatus::NotReady; 100]));
        let mut sink = MemorySink::default();
        let err = drive(&mut render, &mut sink, 4096).unwrap_err();
        assert!(matches!(err, EngineError::RenderFailure(_)));
    }

    #[test]
    fn test_wav_sink_writes_float_stereo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let (controller, _) = controller(RATE);
        controller.load(sine_source(1.0, RATE), AssetInfo::default());

        let report = Exporter::new()
            .export(&controller, WavSink::new(&path))
            .unwrap();
        assert_eq!(report.output, path);

        let reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, RATE);
        assert_eq!(spec.sample_format, SampleFormat::Float);
        assert_eq!(reader.duration(), 8000);
    }

    #[test]
    fn test_wav_sink_abort_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.wav");
        let mut sink = WavSink::new(&path);
        sink.begin(RATE, 2).unwrap();
        sink.write_block(&[0.0; 64]).unwrap();
        assert!(path.exists());

        sink.abort();
        assert!(!path.exists());
    }
}
