//! Transform stages of the chain

mod reverb;
mod time_pitch;

pub use reverb::Reverb;
pub use time_pitch::{LinearResampler, TimePitch};

/// A streaming transform over interleaved stereo blocks
///
/// Stages may change the number of frames (time-stretch) and may hold
/// output back while priming, so output is appended rather than written in
/// place.
pub trait Stage: Send {
    /// Process `input` and append the produced samples to `output`
    fn process(&mut self, input: &[f32], output: &mut Vec<f32>);

    /// Drop all internal state (delay lines, pending frames, phase)
    fn reset(&mut self);

    /// Get stage name
    fn name(&self) -> &'static str;
}
