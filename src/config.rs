use crate::audio::devices::DeviceSelector;
use crate::audio::frame::FrameFormat;
use crate::audio::segmenter::SegmenterConfig;
use crate::audio::vad::{VadBackendKind, VadMode};
use crate::defaults;
use crate::error::{Result, VoxbridgeError};
use crate::pipeline::audio_pipeline::PipelineConfig;
use crate::pipeline::barge_in::{BargeInConfig, Sensitivity};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub barge_in: BargeInSection,
}

/// Audio device and buffering configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Device name or listing index; unset means the default device.
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub sample_rate: u32,
    pub capture_channels: u16,
    pub playback_channels: u16,
    pub frame_duration_ms: u32,
    pub capture_buffer_frames: usize,
    pub playback_buffer_frames: usize,
}

/// Speech classification and segmentation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VadConfig {
    pub mode: VadMode,
    pub backend: VadBackendKind,
    pub min_speech_duration_ms: u32,
    pub min_silence_duration_ms: u32,
    pub padding_duration_ms: u32,
    pub max_segment_duration_ms: u32,
}

/// Barge-in configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BargeInSection {
    pub enabled: bool,
    pub sensitivity: Sensitivity,
    pub min_speech_duration_ms: u32,
    pub cooldown_ms: u32,
    pub max_latency_ms: u32,
    pub poll_interval_ms: u64,
    pub energy_gain: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            sample_rate: defaults::SAMPLE_RATE,
            capture_channels: 1,
            playback_channels: 1,
            frame_duration_ms: defaults::FRAME_DURATION_MS,
            capture_buffer_frames: defaults::CAPTURE_BUFFER_FRAMES,
            playback_buffer_frames: defaults::PLAYBACK_BUFFER_FRAMES,
        }
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            mode: VadMode::default(),
            backend: VadBackendKind::default(),
            min_speech_duration_ms: defaults::MIN_SPEECH_DURATION_MS,
            min_silence_duration_ms: defaults::MIN_SILENCE_DURATION_MS,
            padding_duration_ms: defaults::PADDING_DURATION_MS,
            max_segment_duration_ms: defaults::MAX_SEGMENT_DURATION_MS,
        }
    }
}

impl Default for BargeInSection {
    fn default() -> Self {
        let detector = BargeInConfig::default();
        Self {
            enabled: detector.enabled,
            sensitivity: detector.sensitivity,
            min_speech_duration_ms: detector.min_speech_duration_ms,
            cooldown_ms: detector.cooldown_ms,
            max_latency_ms: detector.max_latency_ms,
            poll_interval_ms: detector.poll_interval_ms,
            energy_gain: defaults::BARGE_IN_ENERGY_GAIN,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file is missing or contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => VoxbridgeError::ConfigFileNotFound {
                path: path.display().to_string(),
            },
            _ => VoxbridgeError::Io(e),
        })?;
        let config: Config = toml::from_str(&contents)
            .map_err(VoxbridgeError::from)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only a missing file falls back to defaults; invalid TOML is an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - VOXBRIDGE_INPUT_DEVICE → audio.input_device
    /// - VOXBRIDGE_OUTPUT_DEVICE → audio.output_device
    /// - VOXBRIDGE_BARGE_IN_SENSITIVITY → barge_in.sensitivity
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(device) = std::env::var("VOXBRIDGE_INPUT_DEVICE")
            && !device.is_empty()
        {
            self.audio.input_device = Some(device);
        }

        if let Ok(device) = std::env::var("VOXBRIDGE_OUTPUT_DEVICE")
            && !device.is_empty()
        {
            self.audio.output_device = Some(device);
        }

        if let Ok(value) = std::env::var("VOXBRIDGE_BARGE_IN_SENSITIVITY")
            && !value.is_empty()
        {
            match value.parse::<Sensitivity>() {
                Ok(sensitivity) => self.barge_in.sensitivity = sensitivity,
                Err(e) => tracing::warn!("ignoring VOXBRIDGE_BARGE_IN_SENSITIVITY: {}", e),
            }
        }

        self
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/voxbridge/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("voxbridge")
            .join("config.toml")
    }

    pub fn frame_format(&self) -> FrameFormat {
        FrameFormat {
            sample_rate: self.audio.sample_rate,
            frame_duration_ms: self.audio.frame_duration_ms,
        }
    }

    pub fn segmenter_config(&self) -> SegmenterConfig {
        SegmenterConfig {
            min_speech_duration_ms: self.vad.min_speech_duration_ms,
            min_silence_duration_ms: self.vad.min_silence_duration_ms,
            padding_duration_ms: self.vad.padding_duration_ms,
            max_segment_duration_ms: self.vad.max_segment_duration_ms,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            format: self.frame_format(),
            input_device: DeviceSelector::parse(self.audio.input_device.as_deref()),
            output_device: DeviceSelector::parse(self.audio.output_device.as_deref()),
            capture_channels: self.audio.capture_channels,
            playback_channels: self.audio.playback_channels,
            capture_buffer_frames: self.audio.capture_buffer_frames,
            playback_buffer_frames: self.audio.playback_buffer_frames,
            vad_mode: self.vad.mode,
            vad_backend: self.vad.backend,
            segmenter: self.segmenter_config(),
            energy_gain: self.barge_in.energy_gain,
        }
    }

    pub fn barge_in_config(&self) -> BargeInConfig {
        BargeInConfig {
            enabled: self.barge_in.enabled,
            sensitivity: self.barge_in.sensitivity,
            min_speech_duration_ms: self.barge_in.min_speech_duration_ms,
            cooldown_ms: self.barge_in.cooldown_ms,
            max_latency_ms: self.barge_in.max_latency_ms,
            poll_interval_ms: self.barge_in.poll_interval_ms,
        }
    }

    /// Checks every section; the first problem found is returned.
    pub fn validate(&self) -> Result<()> {
        self.pipeline_config().validate()?;
        self.barge_in_config().validate()
    }
}
