//! Frame-level speech/silence classification.
//!
//! A [`SpeechClassifier`] wraps one [`VadBackend`]: the native WebRTC engine
//! when it is compiled in and initializes, otherwise an RMS energy threshold.
//! The classifier answers "is this frame speech?" and nothing else; turning
//! those answers into utterances is the segmenter's job.

use crate::audio::frame::FrameFormat;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Trait for time operations, allowing mock time in tests.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

/// Real system clock using `std::time::Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<Instant>>,
}

impl ManualClock {
    /// Creates a clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            current: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *current += duration;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Aggressiveness of the classifier, from most permissive to strictest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VadMode {
    Quality,
    LowBitrate,
    #[default]
    Aggressive,
    VeryAggressive,
}

impl VadMode {
    /// RMS threshold used by the energy fallback for this mode.
    pub fn energy_threshold(self) -> f32 {
        match self {
            VadMode::Quality => 0.01,
            VadMode::LowBitrate => 0.015,
            VadMode::Aggressive => 0.02,
            VadMode::VeryAggressive => 0.03,
        }
    }
}

/// Which backend a classifier should be built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VadBackendKind {
    /// Native engine if available, energy threshold otherwise.
    #[default]
    Auto,
    /// Native engine; still falls back (with a warning) if it cannot start.
    Native,
    /// Energy threshold only.
    Energy,
}

/// Result of the most recent classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClassificationState {
    Speech,
    Silence,
    Unknown,
}

impl fmt::Display for ClassificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassificationState::Speech => write!(f, "speech"),
            ClassificationState::Silence => write!(f, "silence"),
            ClassificationState::Unknown => write!(f, "unknown"),
        }
    }
}

/// A frame classifier implementation.
pub trait VadBackend: Send {
    /// Returns true if the frame contains speech.
    fn is_speech(&mut self, frame: &[i16]) -> bool;

    /// Short identifier used in logs and stats.
    fn name(&self) -> &'static str;

    /// Drops any internal history.
    fn reset(&mut self) {}
}

/// RMS energy threshold classifier.
#[derive(Debug, Clone, Copy)]
pub struct EnergyVad {
    threshold: f32,
}

impl EnergyVad {
    pub fn new(mode: VadMode) -> Self {
        Self::with_threshold(mode.energy_threshold())
    }

    pub fn with_threshold(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl VadBackend for EnergyVad {
    fn is_speech(&mut self, frame: &[i16]) -> bool {
        calculate_rms(frame) > self.threshold
    }

    fn name(&self) -> &'static str {
        "energy"
    }
}

#[cfg(feature = "native-vad")]
mod native {
    use super::{VadBackend, VadMode};
    use crate::audio::frame::FrameFormat;
    use crate::error::{Result, VoxbridgeError};
    use webrtc_vad::{SampleRate, Vad};

    /// WebRTC VAD engine.
    pub struct WebRtcVad {
        vad: Vad,
    }

    // SAFETY: the engine handle is owned exclusively by this struct and only
    // used through `&mut self`, so moving it to the audio thread is sound.
    unsafe impl Send for WebRtcVad {}

    impl WebRtcVad {
        pub fn new(format: FrameFormat, mode: VadMode) -> Result<Self> {
            let rate = match format.sample_rate {
                8000 => SampleRate::Rate8kHz,
                16000 => SampleRate::Rate16kHz,
                32000 => SampleRate::Rate32kHz,
                48000 => SampleRate::Rate48kHz,
                other => {
                    return Err(VoxbridgeError::VadInit {
                        message: format!("unsupported sample rate {}Hz", other),
                    });
                }
            };
            let mode = match mode {
                VadMode::Quality => webrtc_vad::VadMode::Quality,
                VadMode::LowBitrate => webrtc_vad::VadMode::LowBitrate,
                VadMode::Aggressive => webrtc_vad::VadMode::Aggressive,
                VadMode::VeryAggressive => webrtc_vad::VadMode::VeryAggressive,
            };
            Ok(Self {
                vad: Vad::new_with_rate_and_mode(rate, mode),
            })
        }
    }

    impl VadBackend for WebRtcVad {
        fn is_speech(&mut self, frame: &[i16]) -> bool {
            // The engine only rejects malformed frame lengths, which the
            // classifier has already filtered out.
            self.vad.is_voice_segment(frame).unwrap_or(false)
        }

        fn name(&self) -> &'static str {
            "webrtc"
        }
    }
}

#[cfg(feature = "native-vad")]
pub use native::WebRtcVad;

/// Builds the native engine, or explains why it is unavailable.
pub fn native_backend(format: FrameFormat, mode: VadMode) -> Result<Box<dyn VadBackend>> {
    #[cfg(feature = "native-vad")]
    {
        Ok(Box::new(WebRtcVad::new(format, mode)?))
    }
    #[cfg(not(feature = "native-vad"))]
    {
        let _ = (format, mode);
        Err(crate::error::VoxbridgeError::VadInit {
            message: "built without the native-vad feature".to_string(),
        })
    }
}

/// Counters kept by a classifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassifierStats {
    pub frames: u64,
    pub speech_frames: u64,
    pub mismatched_frames: u64,
}

/// Log the first wrong-length frame and then every Nth, the audio thread
/// must not flood stderr.
const MISMATCH_LOG_EVERY: u64 = 100;

/// Speech/silence classifier for fixed-size frames.
pub struct SpeechClassifier {
    backend: Box<dyn VadBackend>,
    format: FrameFormat,
    frame_len: usize,
    state: ClassificationState,
    stats: ClassifierStats,
}

impl SpeechClassifier {
    /// Creates a classifier, choosing the backend according to `kind`.
    ///
    /// Never fails because the native engine is missing: that case degrades to
    /// the energy fallback. Fails only for an invalid frame format.
    pub fn new(format: FrameFormat, mode: VadMode, kind: VadBackendKind) -> Result<Self> {
        format.validate()?;
        let backend: Box<dyn VadBackend> = match kind {
            VadBackendKind::Energy => Box::new(EnergyVad::new(mode)),
            VadBackendKind::Auto | VadBackendKind::Native => match native_backend(format, mode) {
                Ok(backend) => backend,
                Err(e) => {
                    if kind == VadBackendKind::Native {
                        tracing::warn!("native VAD requested but unavailable ({e}), using energy fallback");
                    } else {
                        tracing::info!("native VAD unavailable ({e}), using energy fallback");
                    }
                    Box::new(EnergyVad::new(mode))
                }
            },
        };
        Self::with_backend(format, backend)
    }

    /// Creates a classifier using the energy fallback only.
    pub fn energy(format: FrameFormat, mode: VadMode) -> Result<Self> {
        Self::new(format, mode, VadBackendKind::Energy)
    }

    /// Creates a classifier around a caller-supplied backend.
    pub fn with_backend(format: FrameFormat, backend: Box<dyn VadBackend>) -> Result<Self> {
        format.validate()?;
        tracing::debug!(
            backend = backend.name(),
            sample_rate = format.sample_rate,
            frame_ms = format.frame_duration_ms,
            "speech classifier ready"
        );
        Ok(Self {
            backend,
            frame_len: format.samples_per_frame(),
            format,
            state: ClassificationState::Unknown,
            stats: ClassifierStats::default(),
        })
    }

    /// Classifies one frame. Returns true for speech.
    ///
    /// A frame of the wrong length is counted, logged, and reported as silence.
    pub fn classify(&mut self, frame: &[i16]) -> bool {
        self.stats.frames += 1;

        let is_speech = if frame.len() != self.frame_len {
            self.stats.mismatched_frames += 1;
            if self.stats.mismatched_frames % MISMATCH_LOG_EVERY == 1 {
                tracing::warn!(
                    expected = self.frame_len,
                    actual = frame.len(),
                    total = self.stats.mismatched_frames,
                    "frame length mismatch, treating as silence"
                );
            }
            false
        } else {
            self.backend.is_speech(frame)
        };

        if is_speech {
            self.stats.speech_frames += 1;
            self.state = ClassificationState::Speech;
        } else {
            self.state = ClassificationState::Silence;
        }
        is_speech
    }

    /// State observed on the last `classify` call.
    pub fn state(&self) -> ClassificationState {
        self.state
    }

    pub fn stats(&self) -> ClassifierStats {
        self.stats
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Resets state and backend history. Counters are kept.
    pub fn reset(&mut self) {
        self.state = ClassificationState::Unknown;
        self.backend.reset();
    }
}

/// Calculates the Root Mean Square (RMS) of audio samples.
///
/// # Returns
/// Normalized RMS value (0.0 to 1.0), where:
/// - 0.0 represents silence
/// - ~0.707 represents a full-scale sine wave
/// - 1.0 represents maximum amplitude
pub fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let normalized = sample as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();

    let mean_square = sum_squares / samples.len() as f64;
    mean_square.sqrt() as f32
}
