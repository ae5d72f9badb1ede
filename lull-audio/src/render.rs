//! Pull-based rendering of a source through a stage chain
//!
//! [`ChainRenderer`] is the shared core: a source cursor, a chain, and the
//! chain output not yet handed out. The live feed pulls from it on the device
//! clock, [`OfflineStream`] pulls from it as fast as the sink accepts.

use crate::chain::StageChain;
use crate::error::EngineError;
use crate::params::StageParams;
use crate::source::AudioSource;

/// Source frames fed to the chain per step on the live path
pub const LIVE_FEED_FRAMES: usize = 512;

/// Source frames fed to the chain per step when exporting
pub const OFFLINE_FEED_FRAMES: usize = 4096;

/// Outcome of one block request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    /// `n` frames were appended
    Rendered(usize),
    /// Nothing available yet; ask again
    NotReady,
    /// The render is complete
    Finished,
}

/// A pull-mode producer of interleaved stereo blocks
pub trait BlockRender {
    /// Append at most `max_frames` frames to `out`
    fn render_block(
        &mut self,
        out: &mut Vec<f32>,
        max_frames: usize,
    ) -> Result<RenderStatus, EngineError>;
}

/// Source cursor + stage chain + pending output
pub struct ChainRenderer {
    source: AudioSource,
    chain: StageChain,
    /// Next source frame to feed
    cursor: usize,
    pending: Vec<f32>,
    /// Read offset into `pending` (samples)
    pending_pos: usize,
    feed_frames: usize,
    silence: Vec<f32>,
}

impl ChainRenderer {
    pub fn new(source: AudioSource, chain: StageChain, feed_frames: usize) -> Self {
        let feed_frames = feed_frames.max(1);
        Self {
            source,
            chain,
            cursor: 0,
            // Worst case: rate 0.5 doubles the fed frames
            pending: Vec::with_capacity(feed_frames * 8),
            pending_pos: 0,
            feed_frames,
            silence: vec![0.0; feed_frames * 2],
        }
    }

    pub fn source(&self) -> &AudioSource {
        &self.source
    }

    pub fn chain(&self) -> &StageChain {
        &self.chain
    }

    /// Next source frame the chain will consume
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Every source frame has been fed to the chain
    pub fn source_exhausted(&self) -> bool {
        self.cursor >= self.source.len_frames()
    }

    /// Move the cursor and drop everything in flight
    pub fn seek(&mut self, frame: usize) {
        self.cursor = frame.min(self.source.len_frames());
        self.chain.reset();
        self.pending.clear();
        self.pending_pos = 0;
    }

    /// Frames produced but not yet taken
    pub fn pending_frames(&self) -> usize {
        (self.pending.len() - self.pending_pos) / 2
    }

    /// Feed one block (source, or silence past the end) into the chain;
    /// returns the number of frames it produced
    pub fn step(&mut self) -> usize {
        if self.pending_pos == self.pending.len() {
            self.pending.clear();
            self.pending_pos = 0;
        }
        let before = self.pending.len();

        let block = self.source.read(self.cursor, self.feed_frames);
        if block.is_empty() {
            self.chain.process_block(&self.silence, &mut self.pending);
        } else {
            self.cursor += block.len() / 2;
            self.chain.process_block(block, &mut self.pending);
        }

        (self.pending.len() - before) / 2
    }

    /// Append up to `max_frames` pending frames to `out`; returns frames taken
    pub fn take(&mut self, out: &mut Vec<f32>, max_frames: usize) -> usize {
        let frames = self.pending_frames().min(max_frames);
        let end = self.pending_pos + frames * 2;
        out.extend_from_slice(&self.pending[self.pending_pos..end]);
        self.pending_pos = end;
        frames
    }

    /// Fill `out` completely, stepping the chain as often as needed
    pub fn pull(&mut self, out: &mut [f32]) {
        let mut filled = 0;
        while filled < out.len() {
            if self.pending_pos == self.pending.len() {
                self.step();
                continue;
            }
            let n = (self.pending.len() - self.pending_pos).min(out.len() - filled);
            out[filled..filled + n]
                .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
            self.pending_pos += n;
            filled += n;
        }
    }
}

/// Unthrottled render of a whole source with frozen parameters
///
/// Produces exactly `round(len / rate)` frames: the source is fed in full and
/// the chain tail is flushed with silence up to that count.
pub struct OfflineStream {
    renderer: ChainRenderer,
    expected: usize,
    produced: usize,
}

impl OfflineStream {
    pub fn new(source: AudioSource, params: StageParams) -> Self {
        Self::with_feed_frames(source, params, OFFLINE_FEED_FRAMES)
    }

    pub fn with_feed_frames(source: AudioSource, params: StageParams, feed_frames: usize) -> Self {
        let params = params.clamped();
        let expected = (source.len_frames() as f64 / params.rate as f64).round() as usize;
        let chain = StageChain::frozen(source.sample_rate(), params);
        Self {
            renderer: ChainRenderer::new(source, chain, feed_frames),
            expected,
            produced: 0,
        }
    }

    /// Total frames this render will produce
    pub fn expected_frames(&self) -> usize {
        self.expected
    }

    pub fn produced_frames(&self) -> usize {
        self.produced
    }

    pub fn sample_rate(&self) -> u32 {
        self.renderer.source().sample_rate()
    }

    pub fn params(&self) -> StageParams {
        self.renderer.chain().params()
    }
}

impl BlockRender for OfflineStream {
    fn render_block(
        &mut self,
        out: &mut Vec<f32>,
        max_frames: usize,
    ) -> Result<RenderStatus, EngineError> {
        let remaining = self.expected - self.produced;
        if remaining == 0 {
            return Ok(RenderStatus::Finished);
        }

        if self.renderer.pending_frames() == 0 {
            self.renderer.step();
        }

        let frames = self.renderer.take(out, max_frames.min(remaining));
        if frames == 0 {
            return Ok(RenderStatus::NotReady);
        }
        self.produced += frames;
        Ok(RenderStatus::Rendered(frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sine_source;

    #[test]
    fn test_pull_always_fills() {
        let source = sine_source(0.1, 8000);
        let chain = StageChain::frozen(8000, StageParams::default());
        let mut renderer = ChainRenderer::new(source, chain, LIVE_FEED_FRAMES);

        // Longer than the source: the tail is silence-fed, never short
        let mut out = vec![1.0; 8000 * 2];
        renderer.pull(&mut out);
        assert!(renderer.source_exhausted());
    }

    #[test]
    fn test_seek_moves_cursor_and_clears_pending() {
        let source = sine_source(1.0, 8000);
        let chain = StageChain::frozen(8000, StageParams::default());
        let mut renderer = ChainRenderer::new(source, chain, LIVE_FEED_FRAMES);

        let mut out = vec![0.0; 4096];
        renderer.pull(&mut out);
        renderer.seek(6000);
        assert_eq!(renderer.cursor(), 6000);
        assert_eq!(renderer.pending_frames(), 0);

        renderer.seek(1_000_000);
        assert!(renderer.source_exhausted());
    }

    #[test]
    fn test_offline_stream_exact_length() {
        let source = sine_source(2.0, 8000);
        let mut stream = OfflineStream::new(source, StageParams::default());
        let mut out = Vec::new();

        loop {
            match stream.render_block(&mut out, 1000).unwrap() {
                RenderStatus::Rendered(n) => assert!(n <= 1000),
                RenderStatus::NotReady => {}
                RenderStatus::Finished => break,
            }
        }
        assert_eq!(out.len() / 2, 16000);
        assert_eq!(stream.produced_frames(), stream.expected_frames());
    }

    #[test]
    fn test_offline_stream_reports_not_ready_while_priming() {
        let source = sine_source(1.0, 8000);
        let mut stream = OfflineStream::with_feed_frames(source, StageParams::default(), 256);
        let mut out = Vec::new();

        // 256 frames per step cannot cover the vocoder latency
        assert_eq!(
            stream.render_block(&mut out, 4096).unwrap(),
            RenderStatus::NotReady
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_offline_stream_rate_scales_length() {
        let source = sine_source(1.0, 8000);
        let params = StageParams {
            rate: 0.5,
            ..StageParams::default()
        };
        let stream = OfflineStream::new(source, params);
        assert_eq!(stream.expected_frames(), 16000);
    }
}
