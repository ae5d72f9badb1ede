//! Audio source - decoded samples with frame-addressed reads

use crate::error::EngineError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Channel/format descriptor of an opened source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFormat {
    /// Sample rate of the engine-side samples in Hz
    pub sample_rate: u32,
    /// Channel count of the decoded asset (engine samples are always stereo)
    pub channels: u16,
}

/// Embedded cover art
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artwork {
    pub media_type: String,
    pub data: Arc<[u8]>,
}

/// Descriptive metadata carried alongside a source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetInfo {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub artwork: Option<Artwork>,
}

/// An opened, immutable audio source
///
/// Samples are interleaved stereo `f32`. Cloning is cheap (the sample data is
/// shared) and clones keep the same [`AudioSource::id`].
#[derive(Debug, Clone)]
pub struct AudioSource {
    id: u64,
    samples: Arc<Vec<f32>>,
    format: SourceFormat,
}

impl AudioSource {
    /// Wrap decoded interleaved stereo samples
    ///
    /// A trailing half frame is dropped.
    pub fn new(mut samples: Vec<f32>, sample_rate: u32, channels: u16) -> Result<Self, EngineError> {
        if sample_rate == 0 {
            return Err(EngineError::UnreadableAsset(
                "source reports a sample rate of 0".into(),
            ));
        }
        if samples.len() % 2 != 0 {
            samples.pop();
        }
        Ok(Self {
            id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
            samples: Arc::new(samples),
            format: SourceFormat {
                sample_rate,
                channels,
            },
        })
    }

    /// Identity of the opened asset (stable across clones)
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn format(&self) -> SourceFormat {
        self.format
    }

    pub fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    /// Total length in frames
    pub fn len_frames(&self) -> usize {
        self.samples.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds
    pub fn duration_secs(&self) -> f64 {
        self.len_frames() as f64 / self.format.sample_rate as f64
    }

    /// Read up to `frame_count` frames starting at `start_frame`
    ///
    /// The count is clamped to the end of the source; a start at or past the
    /// end yields an empty block.
    pub fn read(&self, start_frame: usize, frame_count: usize) -> &[f32] {
        let len = self.len_frames();
        if start_frame >= len {
            return &[];
        }
        let end = start_frame + frame_count.min(len - start_frame);
        &self.samples[start_frame * 2..end * 2]
    }
}
