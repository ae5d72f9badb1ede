//! Audio file loading and decoding

use lull_audio::{Artwork, AssetInfo, AudioSource, EngineError};
use rubato::{FftFixedInOut, Resampler};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, MetadataRevision, StandardTagKey};
use symphonia::core::probe::{Hint, ProbeResult};
use thiserror::Error;
use tracing::{debug, info};

/// Why an asset could not be turned into a source
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No audio track found in file")]
    NoAudioTrack,
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Resample error: {0}")]
    Resample(String),
}

impl From<LoadError> for EngineError {
    fn from(err: LoadError) -> Self {
        EngineError::UnreadableAsset(err.to_string())
    }
}

/// What the UI shows for a freshly loaded asset
#[derive(Debug, Clone, PartialEq)]
pub struct AssetSummary {
    pub title: String,
    pub artist: String,
    pub artwork: Option<Artwork>,
    /// Seconds
    pub duration: f64,
}

/// Decoded stereo source plus its tags
pub struct LoadedTrack {
    /// Stereo samples at the loader's target rate
    pub source: AudioSource,
    pub info: AssetInfo,
}

impl LoadedTrack {
    pub fn summary(&self) -> AssetSummary {
        AssetSummary {
            title: self.info.title.clone(),
            artist: self.info.artist.clone(),
            artwork: self.info.artwork.clone(),
            duration: self.source.duration_secs(),
        }
    }
}

/// Decodes files with symphonia and converts them to the output rate
pub struct TrackLoader {
    target_sample_rate: u32,
}

impl Default for TrackLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackLoader {
    /// Create a new track loader with default 48kHz sample rate
    pub fn new() -> Self {
        Self::with_sample_rate(48000)
    }

    /// Create a new track loader with specific sample rate (usually the
    /// output device's)
    pub fn with_sample_rate(target_sample_rate: u32) -> Self {
        Self { target_sample_rate }
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    /// Open, decode and convert an audio file
    pub fn open(&self, path: &Path) -> Result<LoadedTrack, LoadError> {
        let mut probed = probe(path)?;

        let mut info = AssetInfo {
            title: path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "Unknown".into()),
            artist: "Unknown".into(),
            album: "Unknown".into(),
            artwork: None,
        };
        // Container tags (ID3 and the like) first, then the stream's own
        if let Some(rev) = probed.metadata.get().as_ref().and_then(|m| m.current()) {
            apply_revision(&mut info, rev);
        }
        if let Some(rev) = probed.format.metadata().current() {
            apply_revision(&mut info, rev);
        }

        let decoded = decode(probed.format.as_mut())?;
        let stereo = to_stereo(&decoded.samples, decoded.channels as usize);

        let stereo = if decoded.sample_rate == self.target_sample_rate {
            stereo
        } else {
            info!(
                "Resampling {} Hz -> {} Hz",
                decoded.sample_rate, self.target_sample_rate
            );
            resample(&stereo, decoded.sample_rate, self.target_sample_rate)?
        };

        let source = AudioSource::new(stereo, self.target_sample_rate, decoded.channels)
            .map_err(|e| LoadError::Decode(e.to_string()))?;

        info!(
            "Decoded {:?}: {} channel(s), {:.2}s",
            path,
            decoded.channels,
            source.duration_secs()
        );
        Ok(LoadedTrack { source, info })
    }
}

/// Interleaved PCM straight out of the decoder
struct Decoded {
    samples: Vec<f32>,
    channels: u16,
    sample_rate: u32,
}

fn probe(path: &Path) -> Result<ProbeResult, LoadError> {
    let file = File::open(path)?;
    let stream = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    symphonia::default::get_probe()
        .format(
            &hint,
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| LoadError::Decode(e.to_string()))
}

/// Decode every packet of the first audio track
///
/// Packets the codec rejects are skipped rather than failing the whole file.
fn decode(format: &mut dyn FormatReader) -> Result<Decoded, LoadError> {
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(LoadError::NoAudioTrack)?;
    let track_id = track.id;
    let params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(|e| LoadError::Decode(e.to_string()))?;

    let mut out = Decoded {
        samples: Vec::new(),
        channels: params.channels.map_or(2, |c| c.count() as u16),
        sample_rate: params.sample_rate.unwrap_or(44100),
    };
    let mut buffer: Option<SampleBuffer<f32>> = None;
    let mut skipped = 0usize;

    // Any read error, end of stream included, ends the track
    while let Ok(packet) = format.next_packet() {
        if packet.track_id() != track_id {
            continue;
        }
        let Ok(audio) = decoder.decode(&packet) else {
            skipped += 1;
            continue;
        };

        let needed = audio.capacity() * audio.spec().channels.count();
        if buffer.as_ref().map_or(true, |b| b.capacity() < needed) {
            buffer = Some(SampleBuffer::new(audio.capacity() as u64, *audio.spec()));
        }
        if let Some(buf) = buffer.as_mut() {
            buf.copy_interleaved_ref(audio);
            out.samples.extend_from_slice(buf.samples());
        }
    }

    if skipped > 0 {
        debug!("Skipped {} undecodable packets", skipped);
    }
    Ok(out)
}

/// Resample interleaved stereo from `from` Hz to `to` Hz
fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>, LoadError> {
    const CHANNELS: usize = 2;
    const CHUNK_FRAMES: usize = 1024;

    let frames = samples.len() / CHANNELS;
    if frames == 0 {
        return Ok(Vec::new());
    }

    let mut resampler = FftFixedInOut::<f32>::new(from as usize, to as usize, CHUNK_FRAMES, CHANNELS)
        .map_err(|e| LoadError::Resample(e.to_string()))?;

    let planar: [Vec<f32>; CHANNELS] =
        std::array::from_fn(|ch| samples.iter().skip(ch).step_by(CHANNELS).copied().collect());

    let chunk = resampler.input_frames_next();
    let mut input: [Vec<f32>; CHANNELS] = std::array::from_fn(|_| vec![0.0; chunk]);
    let mut output: [Vec<f32>; CHANNELS] = Default::default();

    for start in (0..frames).step_by(chunk) {
        let end = (start + chunk).min(frames);
        for (dst, src) in input.iter_mut().zip(&planar) {
            // The final chunk is zero padded
            dst.fill(0.0);
            dst[..end - start].copy_from_slice(&src[start..end]);
        }

        let resampled = resampler
            .process(&input, None)
            .map_err(|e| LoadError::Resample(e.to_string()))?;
        for (dst, data) in output.iter_mut().zip(resampled) {
            dst.extend(data);
        }
    }

    // Drop what the padding contributed
    let expected = (frames as u64 * to as u64 / from as u64) as usize;
    let len = output[0].len().min(expected);

    Ok((0..len)
        .flat_map(|i| [output[0][i], output[1][i]])
        .collect())
}

/// Down/up-mix interleaved audio to stereo: mono is duplicated, extra
/// channels beyond the first two are dropped
fn to_stereo(samples: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        2 => samples.to_vec(),
        0 | 1 => samples.iter().flat_map(|&s| [s, s]).collect(),
        n => samples
            .chunks_exact(n)
            .flat_map(|frame| [frame[0], frame[1]])
            .collect(),
    }
}

fn apply_revision(info: &mut AssetInfo, rev: &MetadataRevision) {
    for tag in rev.tags() {
        match tag.std_key {
            Some(StandardTagKey::TrackTitle) => info.title = tag.value.to_string(),
            Some(StandardTagKey::Artist) => info.artist = tag.value.to_string(),
            Some(StandardTagKey::Album) => info.album = tag.value.to_string(),
            _ => {}
        }
    }

    if info.artwork.is_none() {
        if let Some(visual) = rev.visuals().first() {
            info.artwork = Some(Artwork {
                media_type: visual.media_type.clone(),
                data: Arc::from(&visual.data[..]),
            });
        }
    }
}
