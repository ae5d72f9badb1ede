//! Simple configuration persistence for Lull
//!
//! Remembers the last session: which file was open, where playback stood and
//! how the stages were set.

use lull_audio::StageParams;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Last asset that was loaded
    pub last_asset: Option<PathBuf>,
    /// Playback position in that asset (seconds)
    pub last_position: f64,
    pub rate: f32,
    /// Cents
    pub pitch: f32,
    /// Percent
    pub reverb_mix: f32,
    pub pitch_linked: bool,
}

impl Default for Config {
    fn default() -> Self {
        let params = StageParams::default();
        Self {
            last_asset: None,
            last_position: 0.0,
            rate: params.rate,
            pitch: params.pitch_cents,
            reverb_mix: params.reverb_mix,
            pitch_linked: params.pitch_linked,
        }
    }
}

impl Config {
    /// Load config from the default location
    ///
    /// Returns default config if file doesn't exist or can't be parsed.
    pub fn load() -> Self {
        let path = Self::config_path();
        Self::load_from(&path).unwrap_or_default()
    }

    /// Load config from a specific path
    pub fn load_from(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// Save config to the default location
    pub fn save(&self) -> io::Result<()> {
        let path = Self::config_path();
        self.save_to(&path)
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, self.serialize())
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lull")
            .join("config.txt")
    }

    /// Stage parameters as stored (clamped into range)
    pub fn stage_params(&self) -> StageParams {
        StageParams {
            rate: self.rate,
            pitch_cents: self.pitch,
            reverb_mix: self.reverb_mix,
            pitch_linked: self.pitch_linked,
        }
        .clamped()
    }

    pub fn set_stage_params(&mut self, params: StageParams) {
        self.rate = params.rate;
        self.pitch = params.pitch_cents;
        self.reverb_mix = params.reverb_mix;
        self.pitch_linked = params.pitch_linked;
    }

    /// Parse config from simple key=value format
    ///
    /// Unknown keys and malformed values are skipped, keeping the default.
    fn parse(content: &str) -> Self {
        let mut config = Self::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();

            match key.trim() {
                "last_asset" => {
                    if !value.is_empty() {
                        config.last_asset = Some(PathBuf::from(value));
                    }
                }
                "last_position" => set_parsed(&mut config.last_position, value),
                "rate" => set_parsed(&mut config.rate, value),
                "pitch" => set_parsed(&mut config.pitch, value),
                "reverb_mix" => set_parsed(&mut config.reverb_mix, value),
                "pitch_linked" => set_parsed(&mut config.pitch_linked, value),
                _ => {} // Ignore unknown keys
            }
        }

        config
    }

    /// Serialize config to simple key=value format
    fn serialize(&self) -> String {
        let mut lines = Vec::new();
        lines.push("# Lull Configuration".to_string());

        if let Some(ref asset) = self.last_asset {
            lines.push(format!("last_asset={}", asset.display()));
        }
        lines.push(format!("last_position={}", self.last_position));
        lines.push(format!("rate={}", self.rate));
        lines.push(format!("pitch={}", self.pitch));
        lines.push(format!("reverb_mix={}", self.reverb_mix));
        lines.push(format!("pitch_linked={}", self.pitch_linked));

        lines.join("\n")
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, value: &str) {
    if let Ok(parsed) = value.parse() {
        *slot = parsed;
    }
}
