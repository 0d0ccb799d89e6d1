//! voxbridge - audio core for a local voice assistant
//!
//! Captures microphone audio, cuts it into utterances, plays synthesized
//! replies and aborts playback when the user talks over them.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod defaults;
pub mod error;
pub mod pipeline;

// Audio primitives
pub use audio::frame::{Frame, FrameFormat};
pub use audio::ring_buffer::SampleRingBuffer;
pub use audio::segmenter::{SegmenterConfig, SpeechSegment, SpeechSegmenter};
pub use audio::vad::{Clock, ManualClock, SpeechClassifier, SystemClock, VadBackendKind, VadMode};

// Device layer
pub use audio::devices::{DeviceDiscovery, DeviceInfo, DeviceSelector, Direction};
pub use audio::driver::{AudioDriver, MockDriver, NullDriver, StreamSpec};

// Real-time pipeline
pub use pipeline::{
    AudioPipeline, BargeInConfig, BargeInDetector, BargeInHandle, PipelineConfig, PipelineState,
    PipelineStats, SegmentSink, Sensitivity,
};

// Error handling
pub use error::{Result, VoxbridgeError};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_starts_with_cargo_version() {
        let ver = version_string();
        assert!(
            ver.starts_with(env!("CARGO_PKG_VERSION")),
            "version_string should start with CARGO_PKG_VERSION, got: {}",
            ver
        );
    }

    #[test]
    fn version_string_contains_plus_when_git_hash_present() {
        let ver = version_string();
        if option_env!("GIT_HASH").is_some_and(|h| !h.is_empty()) {
            assert!(
                ver.contains('+'),
                "With GIT_HASH set, version should contain '+', got: {}",
                ver
            );
            let hash_part = ver.split('+').nth(1).unwrap_or("");
            assert_eq!(hash_part.len(), 7, "Git hash should be 7 chars, got: {}", hash_part);
        } else {
            assert_eq!(ver, env!("CARGO_PKG_VERSION"));
        }
    }
}
