//! Time/pitch stage: phase vocoder stretch followed by a resampler
//!
//! Pitch shifting by `cents` plays the signal back `2^(cents/1200)` times
//! faster, so the vocoder first stretches by `pitch_ratio / rate` and the
//! resampler then reads at speed `pitch_ratio`. The net output length is
//! `input / rate`.

use super::Stage;
use crate::timestretcher::{FftSize, PhaseVocoder};

/// Streaming linear-interpolating resampler (interleaved stereo)
///
/// Output frame `j` is taken at input position `j * speed`; the speed may
/// change between calls without a discontinuity.
#[derive(Debug, Default)]
pub struct LinearResampler {
    /// Position between `prev` and the next input frame
    frac: f64,
    prev_l: f32,
    prev_r: f32,
    primed: bool,
}

impl LinearResampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, input: &[f32], speed: f64, output: &mut Vec<f32>) {
        let speed = speed.max(f64::EPSILON);
        for frame in input.chunks_exact(2) {
            let (l, r) = (frame[0], frame[1]);
            if !self.primed {
                self.prev_l = l;
                self.prev_r = r;
                self.primed = true;
                continue;
            }

            while self.frac < 1.0 {
                let t = self.frac as f32;
                output.push(self.prev_l + (l - self.prev_l) * t);
                output.push(self.prev_r + (r - self.prev_r) * t);
                self.frac += speed;
            }
            self.frac -= 1.0;
            self.prev_l = l;
            self.prev_r = r;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Tempo and pitch, independently
pub struct TimePitch {
    vocoder: PhaseVocoder,
    resampler: LinearResampler,
    rate: f32,
    pitch_cents: f32,
    /// Vocoder output not yet handed to the resampler
    scratch: Vec<f32>,
    /// Vocoder output frames still to discard after a reset
    trim_remaining: usize,
    needs_trim: bool,
}

impl TimePitch {
    pub fn new() -> Self {
        Self {
            vocoder: PhaseVocoder::new(FftSize::Medium),
            resampler: LinearResampler::new(),
            rate: 1.0,
            pitch_cents: 0.0,
            scratch: Vec::with_capacity(16384),
            trim_remaining: 0,
            needs_trim: true,
        }
    }

    /// Set tempo (already clamped) and pitch in cents; applies from the next block
    pub fn set_params(&mut self, rate: f32, pitch_cents: f32) {
        self.rate = rate;
        self.pitch_cents = pitch_cents;
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn pitch_cents(&self) -> f32 {
        self.pitch_cents
    }

    /// Kept in f64 so the stretch and resample speeds multiply back to the rate
    #[inline]
    fn pitch_ratio(&self) -> f64 {
        2.0f64.powf(self.pitch_cents as f64 / 1200.0)
    }
}

impl Default for TimePitch {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for TimePitch {
    fn process(&mut self, input: &[f32], output: &mut Vec<f32>) {
        let pitch_ratio = self.pitch_ratio();
        self.vocoder
            .set_stretch_ratio(pitch_ratio / (self.rate as f64).max(f64::EPSILON));

        if self.needs_trim {
            self.trim_remaining = self.vocoder.latency_frames();
            self.needs_trim = false;
        }

        self.scratch.clear();
        for frame in input.chunks_exact(2) {
            self.vocoder.process(frame[0], frame[1], &mut self.scratch);
        }

        let available = self.scratch.len() / 2;
        let trimmed = self.trim_remaining.min(available);
        self.trim_remaining -= trimmed;

        self.resampler
            .process(&self.scratch[trimmed * 2..], pitch_ratio, output);
    }

    fn reset(&mut self) {
        self.vocoder.reset();
        self.resampler.reset();
        self.scratch.clear();
        self.trim_remaining = 0;
        self.needs_trim = true;
    }

    fn name(&self) -> &'static str {
        "TimePitch"
    }
}
