//! Phase vocoder for pitch-independent time-stretching.
//!
//! - Identity phase locking around spectral peaks (keeps harmonics coherent)
//! - Transient detection with phase reset (preserves attack clarity)
//! - Synthesis hop follows the stretch ratio frame by frame, so ratio changes
//!   mid-stream keep phase continuity
//! - The fractional part of the synthesis hop is carried between frames, so
//!   output length tracks the ratio exactly over any run

use super::fft::Complex;
use super::stft::{FftSize, Stft};
use std::f32::consts::PI;

const TWO_PI: f32 = 2.0 * PI;

/// Spectral flux (relative to frame energy) above which a frame is an onset
const TRANSIENT_THRESHOLD: f32 = 0.8;

/// Analysis and synthesis state of one channel
struct ChannelState {
    bins: Vec<Complex>,
    magnitude: Vec<f32>,
    prev_magnitude: Vec<f32>,
    phase: Vec<f32>,
    prev_phase: Vec<f32>,
    /// Running synthesis phase
    synth_phase: Vec<f32>,
}

impl ChannelState {
    fn new(num_bins: usize) -> Self {
        Self {
            bins: vec![Complex::ZERO; num_bins],
            magnitude: vec![0.0; num_bins],
            prev_magnitude: vec![0.0; num_bins],
            phase: vec![0.0; num_bins],
            prev_phase: vec![0.0; num_bins],
            synth_phase: vec![0.0; num_bins],
        }
    }

    fn split_polar(&mut self) {
        for (k, bin) in self.bins.iter().enumerate() {
            self.magnitude[k] = bin.magnitude();
            self.phase[k] = bin.phase();
        }
    }

    /// Propagate synthesis phases by each bin's measured frequency
    fn advance(&mut self, omega: &[f32], ratio: f32, reset: bool) {
        if reset {
            self.synth_phase.copy_from_slice(&self.phase);
            return;
        }
        for k in 0..self.synth_phase.len() {
            let deviation = wrap_phase(self.phase[k] - self.prev_phase[k] - omega[k]);
            self.synth_phase[k] = wrap_phase(self.synth_phase[k] + (omega[k] + deviation) * ratio);
        }
    }

    /// Identity phase locking: bins in a peak's region keep their analysis
    /// offset from the peak
    fn lock_to_peaks(&mut self, peaks: &[usize]) {
        let last = self.phase.len() - 1;
        for (i, &peak) in peaks.iter().enumerate() {
            let lo = match i {
                0 => 0,
                _ => (peaks[i - 1] + peak) / 2 + 1,
            };
            let hi = peaks.get(i + 1).map_or(last, |&next| (peak + next) / 2);

            let anchor = self.synth_phase[peak] - self.phase[peak];
            for k in (lo..=hi).filter(|&k| k != peak) {
                self.synth_phase[k] = wrap_phase(anchor + self.phase[k]);
            }
        }
    }

    /// Rebuild `bins` from analysis magnitude and synthesis phase
    fn resynthesize(&mut self) {
        for (k, bin) in self.bins.iter_mut().enumerate() {
            *bin = Complex::from_polar(self.magnitude[k], self.synth_phase[k]);
        }
    }

    fn end_frame(&mut self) {
        std::mem::swap(&mut self.prev_phase, &mut self.phase);
        std::mem::swap(&mut self.prev_magnitude, &mut self.magnitude);
    }

    /// Positive spectral flux and energy of this frame
    fn flux(&self) -> (f32, f32) {
        self.magnitude
            .iter()
            .zip(&self.prev_magnitude)
            .fold((0.0, 0.0), |(flux, energy), (&m, &prev)| {
                let rise = (m - prev).max(0.0);
                (flux + rise * rise, energy + m * m)
            })
    }

    fn clear(&mut self) {
        self.prev_phase.fill(0.0);
        self.prev_magnitude.fill(0.0);
        self.synth_phase.fill(0.0);
    }
}

/// Streaming stereo time-stretcher
pub struct PhaseVocoder {
    stft: Stft,
    stretch_ratio: f64,
    /// Fractional synthesis hop owed to the next frame
    hop_carry: f64,
    channels: [ChannelState; 2],
    /// Expected phase advance per bin over one analysis hop
    omega: Vec<f32>,
    peaks: Vec<usize>,
    /// Set after a reset: the next frame takes its phases from the analysis
    first_frame: bool,
}

impl PhaseVocoder {
    pub const MIN_RATIO: f64 = 0.25;
    pub const MAX_RATIO: f64 = 4.0;

    pub fn new(fft_size: FftSize) -> Self {
        let stft = Stft::new(fft_size);
        let num_bins = stft.num_bins();
        let hop = stft.hop_size() as f32;
        let size = stft.size() as f32;

        Self {
            omega: (0..num_bins).map(|k| TWO_PI * k as f32 * hop / size).collect(),
            channels: [ChannelState::new(num_bins), ChannelState::new(num_bins)],
            peaks: Vec::with_capacity(num_bins / 4),
            stretch_ratio: 1.0,
            hop_carry: 0.5,
            first_frame: true,
            stft,
        }
    }

    /// Output length over input length, clamped to 0.25..=4
    #[inline]
    pub fn set_stretch_ratio(&mut self, ratio: f64) {
        self.stretch_ratio = ratio.clamp(Self::MIN_RATIO, Self::MAX_RATIO);
    }

    #[inline]
    pub fn stretch_ratio(&self) -> f64 {
        self.stretch_ratio
    }

    /// Synthesis hop of the next frame. Starting the carry at one half makes
    /// the first `m` hops sum to `round(m * hop * ratio)`.
    fn next_output_hop(&mut self) -> usize {
        let exact = self.stft.hop_size() as f64 * self.stretch_ratio + self.hop_carry;
        let hop = (exact.floor() as usize).clamp(1, self.stft.size());
        self.hop_carry = exact - hop as f64;
        hop
    }

    /// Output frames between an input frame entering and its reconstruction
    /// leaving, at the current ratio
    pub fn latency_frames(&self) -> usize {
        let half = self.stft.size() / 2;
        let hop = self.stft.hop_size();
        half + (self.stretch_ratio * (half - hop) as f64).round() as usize
    }

    /// Push one stereo frame and append every finished frame to `out`
    /// (interleaved)
    pub fn process(&mut self, left: f32, right: f32, out: &mut Vec<f32>) {
        if self.stft.push_frame(left, right) {
            self.process_frame();
        }
        while let Some((l, r)) = self.stft.pop_frame() {
            out.push(l);
            out.push(r);
        }
    }

    fn process_frame(&mut self) {
        for (ch, state) in self.channels.iter_mut().enumerate() {
            self.stft.analyze(ch, &mut state.bins);
            state.split_polar();
        }

        let hop = self.stft.hop_size();
        let output_hop = self.next_output_hop();
        let ratio = output_hop as f32 / hop as f32;
        let reset = self.first_frame || self.detect_transient();
        self.first_frame = false;

        if !reset {
            self.find_peaks();
        }
        // Hann² overlap-add sums to 3N / (8 * mean hop)
        let mean_hop = hop as f64 * self.stretch_ratio;
        let gain = (8.0 * mean_hop / (3.0 * self.stft.size() as f64)) as f32;

        for (ch, state) in self.channels.iter_mut().enumerate() {
            state.advance(&self.omega, ratio, reset);
            if !reset {
                state.lock_to_peaks(&self.peaks);
            }
            state.resynthesize();
            self.stft.overlap_add(ch, &state.bins, gain);
            state.end_frame();
        }
        self.stft.commit(output_hop);
    }

    /// Local maxima over ±2 bins of the summed stereo magnitude
    fn find_peaks(&mut self) {
        let [left, right] = &self.channels;
        let sum = |k: usize| left.magnitude[k] + right.magnitude[k];

        self.peaks.clear();
        for k in 2..self.omega.len() - 2 {
            let m = sum(k);
            if m > sum(k - 2) && m > sum(k - 1) && m > sum(k + 1) && m > sum(k + 2) {
                self.peaks.push(k);
            }
        }
    }

    /// Spectral flux onset detector over both channels
    fn detect_transient(&self) -> bool {
        let (flux, energy) = self
            .channels
            .iter()
            .map(ChannelState::flux)
            .fold((0.0f32, 0.0f32), |(f, e), (cf, ce)| (f + cf, e + ce));

        let energy = energy.sqrt();
        energy > 0.001 && flux.sqrt() / energy > TRANSIENT_THRESHOLD
    }

    /// Drop all buffered audio; the next frame restarts phase propagation
    pub fn reset(&mut self) {
        self.stft.reset();
        for state in &mut self.channels {
            state.clear();
        }
        self.first_frame = true;
        self.hop_carry = 0.5;
    }
}

/// Wrap to [-π, π]
#[inline(always)]
fn wrap_phase(phase: f32) -> f32 {
    let mut p = phase;
    while p > PI {
        p -= TWO_PI;
    }
    while p < -PI {
        p += TWO_PI;
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(i: usize) -> f32 {
        (2.0 * PI * 440.0 * i as f32 / 48000.0).sin() * 0.5
    }

    fn run(pv: &mut PhaseVocoder, frames: usize) -> Vec<f32> {
        let mut out = Vec::new();
        for i in 0..frames {
            pv.process(sine(i), sine(i), &mut out);
        }
        out
    }

    #[test]
    fn test_unity_ratio_emits_one_frame_per_input() {
        let mut pv = PhaseVocoder::new(FftSize::Small);
        assert_eq!(run(&mut pv, 4096).len() / 2, 4096);
    }

    #[test]
    fn test_stretch_scales_output_length() {
        let mut pv = PhaseVocoder::new(FftSize::Small);
        pv.set_stretch_ratio(2.0);
        assert_eq!(run(&mut pv, 4096).len() / 2, 8192);
    }

    #[test]
    fn test_fractional_ratio_keeps_exact_length() {
        // 256 * 1.1 = 281.6, so every hop alone would round away 0.4 frames
        let mut pv = PhaseVocoder::new(FftSize::Small);
        pv.set_stretch_ratio(1.1);
        let out = run(&mut pv, 4096).len() / 2;
        assert!((out as f64 - 4096.0 * 1.1).abs() <= 1.0, "got {} frames", out);

        // A slow-down a hair off a whole hop, over a long run
        let ratio = 1.0 / 0.9006;
        let mut pv = PhaseVocoder::new(FftSize::Small);
        pv.set_stretch_ratio(ratio);
        let out = run(&mut pv, 51200).len() / 2;
        assert!((out as f64 - 51200.0 * ratio).abs() <= 1.0, "got {} frames", out);
    }

    #[test]
    fn test_ratio_change_keeps_running_length() {
        let mut pv = PhaseVocoder::new(FftSize::Small);
        pv.set_stretch_ratio(0.75);
        let first = run(&mut pv, 2048).len() / 2;
        pv.set_stretch_ratio(1.3);
        let mut out = Vec::new();
        for i in 2048..4096 {
            pv.process(sine(i), sine(i), &mut out);
        }
        let total = first + out.len() / 2;
        assert!((total as f64 - 2048.0 * 0.75 - 2048.0 * 1.3).abs() <= 1.0);
    }

    #[test]
    fn test_unity_ratio_reconstructs_signal() {
        let mut pv = PhaseVocoder::new(FftSize::Small);
        let total = 8192;
        let out = run(&mut pv, total);

        // Once the window has fully overlapped
        let latency = pv.latency_frames();
        let max_err = (4096..total)
            .map(|n| (out[n * 2] - sine(n - latency)).abs())
            .fold(0.0f32, f32::max);
        assert!(max_err < 0.05, "max reconstruction error {}", max_err);
    }

    #[test]
    fn test_stretch_ratio_clamping() {
        let mut pv = PhaseVocoder::new(FftSize::Medium);

        pv.set_stretch_ratio(0.1);
        assert_eq!(pv.stretch_ratio(), 0.25);
        pv.set_stretch_ratio(10.0);
        assert_eq!(pv.stretch_ratio(), 4.0);
        pv.set_stretch_ratio(1.5);
        assert_eq!(pv.stretch_ratio(), 1.5);
    }

    #[test]
    fn test_latency_at_unity() {
        let pv = PhaseVocoder::new(FftSize::Medium);
        assert_eq!(pv.latency_frames(), 2048 - 512);
    }

    #[test]
    fn test_latency_uses_exact_ratio() {
        let mut pv = PhaseVocoder::new(FftSize::Medium);
        pv.set_stretch_ratio(1.0 / 0.9006);
        // 512 / 0.9006 = 568.51
        assert_eq!(pv.latency_frames(), 1024 + 569);
    }

    #[test]
    fn test_phase_wrap() {
        assert!(wrap_phase(0.0).abs() < 0.001);
        assert!((wrap_phase(PI + 0.1) - (-PI + 0.1)).abs() < 0.001);
        assert!((wrap_phase(-PI - 0.1) - (PI - 0.1)).abs() < 0.001);
    }

    #[test]
    fn test_silence_is_not_a_transient() {
        let mut pv = PhaseVocoder::new(FftSize::Small);
        let mut out = Vec::new();
        for _ in 0..2048 {
            pv.process(0.0, 0.0, &mut out);
        }
        assert!(!pv.detect_transient());
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_reset_clears_pending_output() {
        let mut pv = PhaseVocoder::new(FftSize::Small);
        run(&mut pv, 300);
        pv.reset();
        assert_eq!(pv.hop_carry, 0.5);

        let mut out = Vec::new();
        pv.process(0.0, 0.0, &mut out);
        assert!(out.is_empty());
    }
}
