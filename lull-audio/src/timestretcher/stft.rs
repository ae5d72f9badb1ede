//! Streaming stereo STFT: windowed analysis over a circular input and
//! overlap-add synthesis with a variable output hop.

use super::fft::{Complex, Fft};
use std::f32::consts::PI;

/// Analysis frame length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FftSize {
    Small = 1024,
    /// Good balance of transient smear and bass resolution for music
    #[default]
    Medium = 2048,
    Large = 4096,
}

impl FftSize {
    #[inline]
    pub fn as_usize(self) -> usize {
        self as usize
    }

    /// Analysis hop (75 % overlap)
    #[inline]
    pub fn hop_size(self) -> usize {
        self.as_usize() / 4
    }
}

/// Per-channel ring buffers
struct ChannelBuffers {
    input: Vec<f32>,
    /// Overlap-add accumulator, read from `Stft::read_pos`
    output: Vec<f32>,
}

impl ChannelBuffers {
    fn new(size: usize) -> Self {
        Self {
            input: vec![0.0; size],
            // One frame beyond the largest synthesis hop
            output: vec![0.0; size * 2],
        }
    }

    fn clear(&mut self) {
        self.input.fill(0.0);
        self.output.fill(0.0);
    }
}

pub struct Stft {
    fft: Fft,
    hop_size: usize,
    window: Vec<f32>,
    channels: [ChannelBuffers; 2],
    write_pos: usize,
    read_pos: usize,
    /// Synthesized samples not yet popped
    ready: usize,
    scratch: Vec<Complex>,
}

impl Stft {
    pub fn new(fft_size: FftSize) -> Self {
        let size = fft_size.as_usize();

        // Periodic Hann
        let window = (0..size)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / size as f32).cos())
            .collect();

        Self {
            fft: Fft::new(size),
            hop_size: fft_size.hop_size(),
            window,
            channels: [ChannelBuffers::new(size), ChannelBuffers::new(size)],
            write_pos: 0,
            read_pos: 0,
            ready: 0,
            scratch: vec![Complex::ZERO; size],
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.fft.size()
    }

    #[inline]
    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    /// Positive-frequency bins, DC and Nyquist included
    #[inline]
    pub fn num_bins(&self) -> usize {
        self.size() / 2 + 1
    }

    #[inline]
    pub fn output_available(&self) -> usize {
        self.ready
    }

    /// Push one stereo frame; true once another analysis hop is complete
    pub fn push_frame(&mut self, left: f32, right: f32) -> bool {
        let size = self.size();
        self.channels[0].input[self.write_pos] = left;
        self.channels[1].input[self.write_pos] = right;
        self.write_pos = (self.write_pos + 1) % size;
        self.write_pos % self.hop_size == 0
    }

    /// Spectrum of the latest `size` input samples of `channel`
    pub fn analyze(&mut self, channel: usize, bins: &mut [Complex]) {
        let size = self.size();
        let input = &self.channels[channel].input;
        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let sample = input[(self.write_pos + i) % size];
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.forward(&mut self.scratch);

        let n = self.num_bins();
        bins[..n].copy_from_slice(&self.scratch[..n]);
    }

    /// Inverse transform `bins` and overlap-add them at the read position
    pub fn overlap_add(&mut self, channel: usize, bins: &[Complex], gain: f32) {
        let size = self.size();
        let n = self.num_bins();

        // Hermitian mirror for a real signal
        self.scratch[..n].copy_from_slice(&bins[..n]);
        for k in 1..size / 2 {
            self.scratch[size - k] = bins[k].conj();
        }
        self.fft.inverse(&mut self.scratch);

        let scale = gain / size as f32;
        let output = &mut self.channels[channel].output;
        let len = output.len();
        for (i, bin) in self.scratch.iter().enumerate() {
            output[(self.read_pos + i) % len] += bin.re * self.window[i] * scale;
        }
    }

    /// Expose `output_hop` more samples once both channels are overlap-added
    pub fn commit(&mut self, output_hop: usize) {
        debug_assert!(output_hop <= self.size());
        self.ready += output_hop.max(1);
    }

    #[inline]
    pub fn pop_frame(&mut self) -> Option<(f32, f32)> {
        if self.ready == 0 {
            return None;
        }

        let pos = self.read_pos;
        let [left, right] = &mut self.channels;
        let frame = (
            std::mem::take(&mut left.output[pos]),
            std::mem::take(&mut right.output[pos]),
        );

        self.read_pos = (pos + 1) % left.output.len();
        self.ready -= 1;
        Some(frame)
    }

    pub fn reset(&mut self) {
        for channel in &mut self.channels {
            channel.clear();
        }
        self.write_pos = 0;
        self.read_pos = 0;
        self.ready = 0;
    }
}
