//! Fixed stage chain: TimePitch → Reverb

use crate::params::{ChainControls, StageParams};
use crate::stages::{Reverb, Stage, TimePitch};
use std::sync::Arc;

/// Where the chain reads its parameters from
enum ParamSource {
    /// Shared with UI threads, re-read every block
    Live(Arc<ChainControls>),
    /// Snapshot taken for an offline render
    Frozen(StageParams),
}

/// Parameterized transform over interleaved stereo blocks
///
/// The chain holds no notion of time. Both the live feed and the offline
/// renderer drive it the same way through [`StageChain::process_block`].
pub struct StageChain {
    params: ParamSource,
    applied: StageParams,
    time_pitch: TimePitch,
    reverb: Reverb,
    /// Time/pitch output feeding the reverb
    scratch: Vec<f32>,
}

impl StageChain {
    /// Chain following live controls
    pub fn live(sample_rate: u32, controls: Arc<ChainControls>) -> Self {
        Self::with_source(sample_rate, ParamSource::Live(controls))
    }

    /// Chain pinned to a parameter snapshot
    pub fn frozen(sample_rate: u32, params: StageParams) -> Self {
        Self::with_source(sample_rate, ParamSource::Frozen(params.clamped()))
    }

    fn with_source(sample_rate: u32, params: ParamSource) -> Self {
        let mut chain = Self {
            params,
            applied: StageParams::default(),
            time_pitch: TimePitch::new(),
            reverb: Reverb::new(sample_rate),
            scratch: Vec::with_capacity(16384),
        };
        chain.apply_params();
        // Start with the envelope already at the configured mix
        chain.reverb.reset();
        chain
    }

    fn apply_params(&mut self) {
        let params = match &self.params {
            ParamSource::Live(controls) => controls.snapshot(),
            ParamSource::Frozen(params) => *params,
        };
        self.time_pitch.set_params(params.rate, params.pitch_cents);
        self.reverb.set_mix(params.reverb_mix);
        self.applied = params;
    }

    /// Run one block through every stage, appending the result to `output`
    ///
    /// Parameters are sampled once at the start of the block.
    pub fn process_block(&mut self, input: &[f32], output: &mut Vec<f32>) {
        self.apply_params();

        self.scratch.clear();
        self.time_pitch.process(input, &mut self.scratch);
        self.reverb.process(&self.scratch, output);
    }

    /// Drop all stage state (used on seek)
    pub fn reset(&mut self) {
        self.time_pitch.reset();
        self.reverb.reset();
        self.scratch.clear();
    }

    /// Parameters applied to the most recent block
    pub fn params(&self) -> StageParams {
        self.applied
    }

    /// Stage names in processing order
    pub fn stage_names(&self) -> [&'static str; 2] {
        [self.time_pitch.name(), self.reverb.name()]
    }
}
