//! Time-stretching for pitch-independent tempo control.
//!
//! A streaming stereo phase vocoder: changing the stretch ratio changes the
//! output length without touching pitch. The pitch stage builds on top of it
//! by stretching and then resampling (see `stages::TimePitch`).
//!
//! # Features
//!
//! - **Phase vocoder**: STFT with 75% overlap, Hann analysis/synthesis windows
//! - **Transient preservation**: spectral flux onsets reset phase propagation
//! - **Identity phase locking**: bins follow their nearest spectral peak
//! - **In-tree radix-2 FFT**: tables planned once per size
//! - **Zero-allocation**: all buffers pre-allocated
//!
//! # Usage
//!
//! ```rust,ignore
//! use lull_audio::timestretcher::{FftSize, PhaseVocoder};
//!
//! let mut vocoder = PhaseVocoder::new(FftSize::Medium);
//! vocoder.set_stretch_ratio(1.5); // 50% longer, same pitch
//!
//! let mut out = Vec::new();
//! for frame in input.chunks_exact(2) {
//!     vocoder.process(frame[0], frame[1], &mut out);
//! }
//! ```

mod fft;
mod phase;
mod stft;

pub use fft::{Complex, Fft};
pub use phase::PhaseVocoder;
pub use stft::{FftSize, Stft};
