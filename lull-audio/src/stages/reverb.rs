//! Freeverb-style reverb stage
//!
//! Uses parallel comb filters and series allpass filters with a fixed hall
//! voicing. The only live parameter is the wet mix.

use super::Stage;

/// Freeverb comb delays in samples at 44.1 kHz
const COMB_TUNINGS: [usize; 8] = [1116, 1188, 1277, 1356, 1422, 1491, 1557, 1617];
const ALLPASS_TUNINGS: [usize; 4] = [556, 441, 341, 225];

/// Extra delay of the right tank, in samples at 44.1 kHz
const STEREO_SPREAD: usize = 23;

/// Hall voicing
const ROOM_SIZE: f32 = 0.75;
const DAMPING: f32 = 0.4;
const ALLPASS_FEEDBACK: f32 = 0.5;

/// Makeup gain applied to the wet-only signal
const WET_GAIN: f32 = 1.5;

/// Envelope level below which the wet path counts as silent
const WET_FLOOR: f32 = 0.0001;

/// Wet envelope smoothing coefficient (~10ms at 48kHz)
const WET_SMOOTHING: f32 = 0.9995;

/// Circular delay of a fixed length
struct DelayLine {
    buffer: Vec<f32>,
    pos: usize,
}

impl DelayLine {
    fn new(len: usize) -> Self {
        Self {
            buffer: vec![0.0; len.max(1)],
            pos: 0,
        }
    }

    /// Sample written `len` calls ago
    #[inline]
    fn front(&self) -> f32 {
        self.buffer[self.pos]
    }

    #[inline]
    fn push(&mut self, value: f32) {
        self.buffer[self.pos] = value;
        self.pos = (self.pos + 1) % self.buffer.len();
    }

    fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.pos = 0;
    }
}

/// Comb with a one-pole lowpass in the feedback path
struct Comb {
    delay: DelayLine,
    lowpass: f32,
}

impl Comb {
    #[inline]
    fn tick(&mut self, input: f32, feedback: f32) -> f32 {
        let out = self.delay.front();
        self.lowpass = out * (1.0 - DAMPING) + self.lowpass * DAMPING;
        self.delay.push(input + self.lowpass * feedback);
        out
    }
}

/// One channel's filter network: parallel combs into series allpasses
struct Tank {
    combs: [Comb; 8],
    allpasses: [DelayLine; 4],
}

impl Tank {
    fn new(scale: f32, offset: usize) -> Self {
        let len = |tuning: usize| ((tuning + offset) as f32 * scale) as usize;
        Self {
            combs: COMB_TUNINGS.map(|t| Comb {
                delay: DelayLine::new(len(t)),
                lowpass: 0.0,
            }),
            allpasses: ALLPASS_TUNINGS.map(|t| DelayLine::new(len(t))),
        }
    }

    fn tick(&mut self, input: f32, feedback: f32) -> f32 {
        let combs: f32 = self.combs.iter_mut().map(|c| c.tick(input, feedback)).sum();

        // Averaged combs, then unity-gain diffusion
        self.allpasses.iter_mut().fold(combs * 0.125, |x, ap| {
            let delayed = ap.front();
            ap.push(x + delayed * ALLPASS_FEEDBACK);
            delayed - x
        })
    }

    fn clear(&mut self) {
        for comb in &mut self.combs {
            comb.delay.clear();
            comb.lowpass = 0.0;
        }
        for ap in &mut self.allpasses {
            ap.clear();
        }
    }
}

/// Freeverb-style stereo reverb stage
pub struct Reverb {
    tanks: [Tank; 2],
    feedback: f32,
    /// Wet envelope, smoothed per sample toward `wet_target`
    wet: f32,
    wet_target: f32,
    /// Filters hold no tail
    silent: bool,
}

impl Reverb {
    pub fn new(sample_rate: u32) -> Self {
        let scale = sample_rate as f32 / 44100.0;
        Self {
            tanks: [Tank::new(scale, 0), Tank::new(scale, STEREO_SPREAD)],
            feedback: ROOM_SIZE * 0.24 + 0.6,
            wet: 0.0,
            wet_target: 0.0,
            silent: true,
        }
    }

    /// Set wet mix in percent (0 - 100)
    pub fn set_mix(&mut self, percent: f32) {
        self.wet_target = (percent / 100.0).clamp(0.0, 1.0);
    }

    /// Wet mix target in percent
    pub fn mix(&self) -> f32 {
        self.wet_target * 100.0
    }

    /// True once the envelope has settled at zero
    fn bypassed(&self) -> bool {
        self.wet_target == 0.0 && self.wet < WET_FLOOR
    }

    fn clear_tail(&mut self) {
        for tank in &mut self.tanks {
            tank.clear();
        }
    }
}

/// Soft clipper to prevent harsh distortion
fn soft_clip(x: f32) -> f32 {
    if x > 1.0 {
        1.0 - 1.0 / (1.0 + (x - 1.0) * 2.0)
    } else if x < -1.0 {
        -1.0 + 1.0 / (1.0 + (-x - 1.0) * 2.0)
    } else {
        x
    }
}

impl Stage for Reverb {
    fn process(&mut self, input: &[f32], output: &mut Vec<f32>) {
        if self.bypassed() {
            // Exact passthrough; drop the old tail once so a later mix starts clean
            if !self.silent {
                self.clear_tail();
                self.wet = 0.0;
                self.silent = true;
            }
            output.extend_from_slice(input);
            return;
        }

        self.silent = false;
        output.reserve(input.len());
        for frame in input.chunks_exact(2) {
            self.wet = WET_SMOOTHING * self.wet + (1.0 - WET_SMOOTHING) * self.wet_target;

            // Mono send, attenuated against buildup
            let send = (frame[0] + frame[1]) * 0.25;
            for (tank, &dry) in self.tanks.iter_mut().zip(frame) {
                let wet_sample = soft_clip(tank.tick(send, self.feedback) * WET_GAIN);
                output.push(dry * (1.0 - self.wet) + wet_sample * self.wet);
            }
        }
    }

    fn reset(&mut self) {
        self.clear_tail();
        self.silent = true;
        // Envelope jumps to its target so a reset never fades the mix back in
        self.wet = self.wet_target;
    }

    fn name(&self) -> &'static str {
        "Reverb"
    }
}
