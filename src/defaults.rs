//! Default configuration constants for voxbridge.
//!
//! Shared by the config file layer and the per-component config structs so both
//! agree on what "unset" means.

/// Default audio sample rate in Hz.
///
/// 16kHz is what both the native VAD engine and downstream speech recognizers
/// expect, so capture and playback default to it.
pub const SAMPLE_RATE: u32 = 16000;

/// Default frame duration in milliseconds.
pub const FRAME_DURATION_MS: u32 = 30;

/// Frame durations accepted by the classifier.
pub const SUPPORTED_FRAME_DURATIONS_MS: &[u32] = &[10, 20, 30];

/// Sample rates accepted by the classifier.
pub const SUPPORTED_SAMPLE_RATES: &[u32] = &[8000, 16000, 32000, 48000];

/// Default capture ring buffer capacity in frames (~3s at 30ms frames).
pub const CAPTURE_BUFFER_FRAMES: usize = 100;

/// Default playback ring buffer capacity in frames (~30s at 30ms frames).
///
/// Synthesized replies arrive in bursts much faster than real time, so this
/// is sized for a whole spoken answer.
pub const PLAYBACK_BUFFER_FRAMES: usize = 1000;

/// Minimum speech duration for an utterance to be emitted (milliseconds).
pub const MIN_SPEECH_DURATION_MS: u32 = 250;

/// Trailing silence that closes an utterance (milliseconds).
pub const MIN_SILENCE_DURATION_MS: u32 = 500;

/// Pre-roll kept before the speech onset (milliseconds).
///
/// Captures soft onsets (plosives, fricatives) that occur before the classifier
/// commits to speech.
pub const PADDING_DURATION_MS: u32 = 300;

/// Hard upper bound on a single utterance (milliseconds).
pub const MAX_SEGMENT_DURATION_MS: u32 = 30_000;

/// Minimum sustained speech that confirms a barge-in (milliseconds).
pub const BARGE_IN_MIN_SPEECH_MS: u32 = 100;

/// Quiet period after a confirmed barge-in (milliseconds).
pub const BARGE_IN_COOLDOWN_MS: u32 = 1000;

/// Detection latency target, used for reporting only (milliseconds).
pub const BARGE_IN_MAX_LATENCY_MS: u32 = 100;

/// Barge-in poll period (milliseconds).
pub const BARGE_IN_POLL_INTERVAL_MS: u64 = 50;

/// Gain applied to frame RMS before the barge-in detector sees it.
///
/// Conversational speech sits around 0.03-0.1 RMS, so a gain of 10 puts it
/// across the 0.3-0.7 sensitivity thresholds.
pub const BARGE_IN_ENERGY_GAIN: f32 = 10.0;

/// Capacity of the channel between the segmenter and the STT consumer.
pub const SEGMENT_CHANNEL_CAPACITY: usize = 16;
