//! Fixed-duration audio frames.

use crate::defaults;
use crate::error::{Result, VoxbridgeError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One frame of 16-bit mono PCM, exactly `FrameFormat::samples_per_frame` long.
pub type Frame = Vec<i16>;

/// Sample rate and frame duration shared by every component of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFormat {
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self {
            sample_rate: defaults::SAMPLE_RATE,
            frame_duration_ms: defaults::FRAME_DURATION_MS,
        }
    }
}

impl FrameFormat {
    /// Creates a validated frame format.
    pub fn new(sample_rate: u32, frame_duration_ms: u32) -> Result<Self> {
        let format = Self {
            sample_rate,
            frame_duration_ms,
        };
        format.validate()?;
        Ok(format)
    }

    /// Rejects sample rates and frame durations the classifier cannot handle.
    pub fn validate(&self) -> Result<()> {
        if !defaults::SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(VoxbridgeError::invalid(
                "sample_rate",
                format!(
                    "{}Hz is not supported (expected one of {:?})",
                    self.sample_rate,
                    defaults::SUPPORTED_SAMPLE_RATES
                ),
            ));
        }
        if !defaults::SUPPORTED_FRAME_DURATIONS_MS.contains(&self.frame_duration_ms) {
            return Err(VoxbridgeError::invalid(
                "frame_duration_ms",
                format!(
                    "{}ms is not supported (expected one of {:?})",
                    self.frame_duration_ms,
                    defaults::SUPPORTED_FRAME_DURATIONS_MS
                ),
            ));
        }
        Ok(())
    }

    /// Number of samples in one frame.
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }

    /// Duration of one frame.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms as u64)
    }

    /// Number of whole frames covering `duration_ms`.
    pub fn frames_for_ms(&self, duration_ms: u32) -> usize {
        (duration_ms / self.frame_duration_ms) as usize
    }
}

/// Mixes interleaved multi-channel samples down to mono by averaging channels.
///
/// Appends to `out` so callers on the audio thread can reuse a buffer.
pub fn downmix_into(samples: &[i16], channels: usize, out: &mut Vec<i16>) {
    if channels <= 1 {
        out.extend_from_slice(samples);
        return;
    }
    out.extend(samples.chunks_exact(channels).map(|frame| {
        let sum: i32 = frame.iter().map(|&s| s as i32).sum();
        (sum / channels as i32) as i16
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_format_is_30ms_at_16khz() {
        let format = FrameFormat::default();
        assert_eq!(format.samples_per_frame(), 480);
        assert_eq!(format.frame_duration(), Duration::from_millis(30));
    }

    #[test]
    fn test_samples_per_frame_for_supported_durations() {
        assert_eq!(FrameFormat::new(16000, 10).unwrap().samples_per_frame(), 160);
        assert_eq!(FrameFormat::new(16000, 20).unwrap().samples_per_frame(), 320);
        assert_eq!(FrameFormat::new(48000, 30).unwrap().samples_per_frame(), 1440);
        assert_eq!(FrameFormat::new(8000, 10).unwrap().samples_per_frame(), 80);
    }

    #[test]
    fn test_rejects_unsupported_frame_duration() {
        let err = FrameFormat::new(16000, 25).unwrap_err();
        assert!(err.to_string().contains("frame_duration_ms"), "{}", err);
    }

    #[test]
    fn test_rejects_unsupported_sample_rate() {
        let err = FrameFormat::new(44100, 30).unwrap_err();
        assert!(err.to_string().contains("sample_rate"), "{}", err);
    }

    #[test]
    fn test_frames_for_ms_truncates() {
        let format = FrameFormat::default();
        assert_eq!(format.frames_for_ms(300), 10);
        assert_eq!(format.frames_for_ms(100), 3);
        assert_eq!(format.frames_for_ms(0), 0);
    }

    #[test]
    fn test_downmix_mono_passthrough() {
        let mut out = Vec::new();
        downmix_into(&[1, 2, 3], 1, &mut out);
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn test_downmix_stereo_averages_channels() {
        let mut out = Vec::new();
        downmix_into(&[100, 300, -200, 200, 7, 7], 2, &mut out);
        assert_eq!(out, vec![200, 0, 7]);
    }

    #[test]
    fn test_downmix_drops_incomplete_trailing_frame() {
        let mut out = Vec::new();
        downmix_into(&[10, 20, 30, 40, 50], 2, &mut out);
        assert_eq!(out, vec![15, 35]);
    }
}
