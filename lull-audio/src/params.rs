//! Stage parameters and the lock-free controls shared with the audio thread

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Snapshot of every stage parameter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageParams {
    /// Playback rate, 1.0 = original tempo
    pub rate: f32,
    /// Pitch shift in cents
    pub pitch_cents: f32,
    /// Reverb wet mix in percent
    pub reverb_mix: f32,
    /// Whether `rate` changes also drive `pitch_cents`
    pub pitch_linked: bool,
}

impl StageParams {
    pub const MIN_RATE: f32 = 0.5;
    pub const MAX_RATE: f32 = 2.0;
    pub const MAX_PITCH_CENTS: f32 = 1200.0;
    pub const MAX_REVERB_MIX: f32 = 100.0;

    pub fn clamp_rate(rate: f32) -> f32 {
        if rate.is_nan() {
            return 1.0;
        }
        rate.clamp(Self::MIN_RATE, Self::MAX_RATE)
    }

    pub fn clamp_pitch(cents: f32) -> f32 {
        if cents.is_nan() {
            return 0.0;
        }
        cents.clamp(-Self::MAX_PITCH_CENTS, Self::MAX_PITCH_CENTS)
    }

    pub fn clamp_reverb_mix(mix: f32) -> f32 {
        if mix.is_nan() {
            return 0.0;
        }
        mix.clamp(0.0, Self::MAX_REVERB_MIX)
    }

    /// Pitch (in cents) a turntable would produce when sped up by `rate`
    pub fn linked_pitch(rate: f32) -> f32 {
        Self::clamp_pitch(1200.0 * Self::clamp_rate(rate).log2())
    }

    /// Return a copy with every field clamped into its domain
    pub fn clamped(self) -> Self {
        Self {
            rate: Self::clamp_rate(self.rate),
            pitch_cents: Self::clamp_pitch(self.pitch_cents),
            reverb_mix: Self::clamp_reverb_mix(self.reverb_mix),
            pitch_linked: self.pitch_linked,
        }
    }
}

impl Default for StageParams {
    fn default() -> Self {
        Self {
            rate: 1.0,
            pitch_cents: 0.0,
            reverb_mix: 0.0,
            pitch_linked: false,
        }
    }
}

/// Parameter surface of the stage chain
///
/// Written from UI/control threads, read by the audio thread at the start of
/// each block. Values are stored as `f32` bits in atomics so neither side ever
/// takes a lock. Out-of-domain values are clamped, never rejected.
#[derive(Debug)]
pub struct ChainControls {
    rate: AtomicU32,
    pitch_cents: AtomicU32,
    reverb_mix: AtomicU32,
    pitch_linked: AtomicBool,
}

impl ChainControls {
    pub fn new() -> Self {
        Self::with_params(StageParams::default())
    }

    pub fn with_params(params: StageParams) -> Self {
        let params = params.clamped();
        Self {
            rate: AtomicU32::new(params.rate.to_bits()),
            pitch_cents: AtomicU32::new(params.pitch_cents.to_bits()),
            reverb_mix: AtomicU32::new(params.reverb_mix.to_bits()),
            pitch_linked: AtomicBool::new(params.pitch_linked),
        }
    }

    /// Set the playback rate; derives pitch when linking is enabled
    pub fn set_rate(&self, rate: f32) {
        self.set_rate_with(rate, None);
    }

    /// Set the playback rate, optionally overriding the linked flag for this call
    pub fn set_rate_with(&self, rate: f32, link_override: Option<bool>) {
        let rate = StageParams::clamp_rate(rate);
        self.rate.store(rate.to_bits(), Ordering::Release);
        if link_override.unwrap_or_else(|| self.pitch_linked()) {
            self.store_pitch(StageParams::linked_pitch(rate));
        }
    }

    pub fn set_pitch(&self, cents: f32) {
        self.store_pitch(StageParams::clamp_pitch(cents));
    }

    pub fn set_reverb_mix(&self, mix: f32) {
        let mix = StageParams::clamp_reverb_mix(mix);
        self.reverb_mix.store(mix.to_bits(), Ordering::Release);
    }

    /// Couple pitch to rate; enabling re-derives pitch from the current rate
    pub fn set_pitch_linked(&self, linked: bool) {
        self.pitch_linked.store(linked, Ordering::Release);
        if linked {
            self.store_pitch(StageParams::linked_pitch(self.rate()));
        }
    }

    /// Overwrite every parameter (used when restoring persisted settings)
    pub fn apply(&self, params: StageParams) {
        let params = params.clamped();
        self.pitch_linked.store(params.pitch_linked, Ordering::Release);
        self.rate.store(params.rate.to_bits(), Ordering::Release);
        self.store_pitch(params.pitch_cents);
        self.reverb_mix
            .store(params.reverb_mix.to_bits(), Ordering::Release);
    }

    pub fn rate(&self) -> f32 {
        f32::from_bits(self.rate.load(Ordering::Acquire))
    }

    pub fn pitch_cents(&self) -> f32 {
        f32::from_bits(self.pitch_cents.load(Ordering::Acquire))
    }

    pub fn reverb_mix(&self) -> f32 {
        f32::from_bits(self.reverb_mix.load(Ordering::Acquire))
    }

    pub fn pitch_linked(&self) -> bool {
        self.pitch_linked.load(Ordering::Acquire)
    }

    /// Current values; fields are read independently, so a concurrent writer
    /// may be observed one block late
    pub fn snapshot(&self) -> StageParams {
        StageParams {
            rate: self.rate(),
            pitch_cents: self.pitch_cents(),
            reverb_mix: self.reverb_mix(),
            pitch_linked: self.pitch_linked(),
        }
    }

    fn store_pitch(&self, cents: f32) {
        self.pitch_cents.store(cents.to_bits(), Ordering::Release);
    }
}

impl Default for ChainControls {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_clamping() {
        let controls = ChainControls::new();

        controls.set_rate(0.1);
        assert_eq!(controls.rate(), 0.5);

        controls.set_rate(3.0);
        assert_eq!(controls.rate(), 2.0);

        controls.set_rate(0.8);
        assert_eq!(controls.rate(), 0.8);
    }

    #[test]
    fn test_pitch_clamping() {
        let controls = ChainControls::new();

        controls.set_pitch(-5000.0);
        assert_eq!(controls.pitch_cents(), -1200.0);

        controls.set_pitch(1500.0);
        assert_eq!(controls.pitch_cents(), 1200.0);

        controls.set_pitch(-350.0);
        assert_eq!(controls.pitch_cents(), -350.0);
    }

    #[test]
    fn test_reverb_mix_out_of_domain_is_clamped() {
        let controls = ChainControls::new();

        controls.set_reverb_mix(150.0);
        assert_eq!(controls.reverb_mix(), 100.0);

        controls.set_reverb_mix(-3.0);
        assert_eq!(controls.reverb_mix(), 0.0);
    }

    #[test]
    fn test_nan_maps_to_neutral() {
        let controls = ChainControls::new();
        controls.set_rate(1.5);
        controls.set_rate(f32::NAN);
        assert_eq!(controls.rate(), 1.0);
        controls.set_pitch(f32::NAN);
        assert_eq!(controls.pitch_cents(), 0.0);
        controls.set_reverb_mix(f32::NAN);
        assert_eq!(controls.reverb_mix(), 0.0);
    }

    #[test]
    fn test_linked_pitch_follows_rate() {
        let controls = ChainControls::new();
        controls.set_pitch_linked(true);

        for rate in [0.5f32, 0.75, 0.9, 1.0, 1.25, 1.5, 2.0] {
            controls.set_rate(rate);
            let expected = 1200.0 * rate.log2();
            assert!(
                (controls.pitch_cents() - expected).abs() < 1e-3,
                "rate {} gave pitch {}",
                rate,
                controls.pitch_cents()
            );
        }

        controls.set_rate(2.0);
        assert_eq!(controls.pitch_cents(), 1200.0);
    }

    #[test]
    fn test_unlinked_rate_leaves_pitch_alone() {
        let controls = ChainControls::new();
        controls.set_pitch(300.0);
        controls.set_rate(0.5);
        assert_eq!(controls.pitch_cents(), 300.0);
    }

    #[test]
    fn test_link_override_applies_to_one_call() {
        let controls = ChainControls::new();
        controls.set_rate_with(0.5, Some(true));
        assert_eq!(controls.pitch_cents(), -1200.0);
        assert!(!controls.pitch_linked());

        controls.set_pitch_linked(true);
        controls.set_rate_with(2.0, Some(false));
        assert_eq!(controls.pitch_cents(), -1200.0);
    }

    #[test]
    fn test_enabling_link_derives_pitch() {
        let controls = ChainControls::new();
        controls.set_rate(0.5);
        assert_eq!(controls.pitch_cents(), 0.0);
        controls.set_pitch_linked(true);
        assert_eq!(controls.pitch_cents(), -1200.0);
    }

    #[test]
    fn test_apply_clamps_snapshot() {
        let controls = ChainControls::new();
        controls.apply(StageParams {
            rate: 9.0,
            pitch_cents: 20.0,
            reverb_mix: 40.0,
            pitch_linked: true,
        });
        let snapshot = controls.snapshot();
        assert_eq!(snapshot.rate, 2.0);
        assert_eq!(snapshot.pitch_cents, 20.0);
        assert_eq!(snapshot.reverb_mix, 40.0);
        assert!(snapshot.pitch_linked);
    }
}
