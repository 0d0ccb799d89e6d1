//! Hysteresis segmenter that turns per-frame speech decisions into utterances.
//!
//! ```text
//!              speech                      silence ≥ min_silence
//!  NotInSpeech ───────▶ InSpeech ─────────────────────────────────▶ emit or discard
//!       ▲  │ silence      │ ▲ speech / short silence                     │
//!       │  ▼              └─┘                                            │
//!   pre-roll                                                             │
//!       └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All timing is stream time (frames seen × frame duration), never wall time,
//! so the same input always produces the same segments.

use crate::audio::frame::{Frame, FrameFormat};
use crate::audio::vad::SpeechClassifier;
use crate::defaults;
use crate::error::{Result, VoxbridgeError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Configuration for the segmenter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SegmenterConfig {
    /// Speech between onset and the last speech frame needed to emit (milliseconds).
    pub min_speech_duration_ms: u32,
    /// Trailing silence that closes an utterance (milliseconds).
    pub min_silence_duration_ms: u32,
    /// Audio kept from before the onset (milliseconds).
    pub padding_duration_ms: u32,
    /// Utterance length that forces a close, 0 disables (milliseconds).
    pub max_segment_duration_ms: u32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_speech_duration_ms: defaults::MIN_SPEECH_DURATION_MS,
            min_silence_duration_ms: defaults::MIN_SILENCE_DURATION_MS,
            padding_duration_ms: defaults::PADDING_DURATION_MS,
            max_segment_duration_ms: defaults::MAX_SEGMENT_DURATION_MS,
        }
    }
}

impl SegmenterConfig {
    /// Checks the durations against each other and against the frame size.
    pub fn validate(&self, format: &FrameFormat) -> Result<()> {
        if self.min_silence_duration_ms < format.frame_duration_ms {
            return Err(VoxbridgeError::invalid(
                "min_silence_duration_ms",
                format!(
                    "{}ms is shorter than one {}ms frame",
                    self.min_silence_duration_ms, format.frame_duration_ms
                ),
            ));
        }
        if self.max_segment_duration_ms != 0
            && self.max_segment_duration_ms < self.min_speech_duration_ms
        {
            return Err(VoxbridgeError::invalid(
                "max_segment_duration_ms",
                format!(
                    "{}ms is below min_speech_duration_ms ({}ms), no segment could be emitted",
                    self.max_segment_duration_ms, self.min_speech_duration_ms
                ),
            ));
        }
        Ok(())
    }
}

/// A finished utterance, handed to the speech-to-text consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechSegment {
    /// Position of this segment in the segmenter's output, starting at 0.
    pub sequence: u64,
    /// Stream offset of the speech onset.
    pub start: Duration,
    /// Stream offset where the utterance was closed.
    pub end: Duration,
    /// Onset to end of the last speech frame.
    pub speech_duration: Duration,
    /// Pre-roll followed by the utterance, 16-bit mono.
    pub samples: Vec<i16>,
    /// min(1, speech seconds / 1s).
    pub confidence: f32,
    pub sample_rate: u32,
}

impl SpeechSegment {
    /// `end - start`.
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }

    /// Length of the audio payload, pre-roll included.
    pub fn audio_duration(&self) -> Duration {
        let micros = (self.samples.len() as u64 * 1_000_000)
            .checked_div(u64::from(self.sample_rate))
            .unwrap_or(0);
        Duration::from_micros(micros)
    }
}

/// Segmenter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SegmenterState {
    NotInSpeech,
    InSpeech,
}

/// Counters kept by a segmenter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SegmenterStats {
    pub segments_emitted: u64,
    pub segments_discarded: u64,
    pub forced_closes: u64,
}

/// Speech segmenter driven by a [`SpeechClassifier`].
pub struct SpeechSegmenter {
    classifier: SpeechClassifier,
    config: SegmenterConfig,
    frame_duration: Duration,
    sample_rate: u32,
    state: SegmenterState,
    pre_roll: VecDeque<Frame>,
    pre_roll_frames: usize,
    utterance: Vec<i16>,
    /// Stream time at the start of the next frame.
    position: Duration,
    onset: Option<Duration>,
    last_speech_end: Duration,
    silence: Duration,
    sequence: u64,
    stats: SegmenterStats,
}

impl SpeechSegmenter {
    /// Creates a segmenter. The classifier's frame format is used for timing.
    pub fn new(classifier: SpeechClassifier, config: SegmenterConfig) -> Result<Self> {
        let format = classifier.format();
        config.validate(&format)?;
        let pre_roll_frames = format.frames_for_ms(config.padding_duration_ms);
        Ok(Self {
            classifier,
            config,
            frame_duration: format.frame_duration(),
            sample_rate: format.sample_rate,
            state: SegmenterState::NotInSpeech,
            pre_roll: VecDeque::with_capacity(pre_roll_frames),
            pre_roll_frames,
            utterance: Vec::new(),
            position: Duration::ZERO,
            onset: None,
            last_speech_end: Duration::ZERO,
            silence: Duration::ZERO,
            sequence: 0,
            stats: SegmenterStats::default(),
        })
    }

    /// Classifies one frame and advances the state machine.
    ///
    /// Returns a segment when this frame closed an utterance that was long enough.
    pub fn process_frame(&mut self, frame: &[i16]) -> Option<SpeechSegment> {
        let frame_start = self.position;
        self.position += self.frame_duration;
        let frame_end = self.position;
        let is_speech = self.classifier.classify(frame);

        match self.state {
            SegmenterState::NotInSpeech => {
                if is_speech {
                    self.state = SegmenterState::InSpeech;
                    self.onset = Some(frame_start);
                    self.last_speech_end = frame_end;
                    self.silence = Duration::ZERO;
                    self.utterance.clear();
                    for buffered in self.pre_roll.drain(..) {
                        self.utterance.extend_from_slice(&buffered);
                    }
                    self.utterance.extend_from_slice(frame);
                    tracing::trace!(onset_ms = frame_start.as_millis() as u64, "speech onset");
                } else if self.pre_roll_frames > 0 {
                    if self.pre_roll.len() == self.pre_roll_frames {
                        self.pre_roll.pop_front();
                    }
                    self.pre_roll.push_back(frame.to_vec());
                }
                None
            }
            SegmenterState::InSpeech => {
                self.utterance.extend_from_slice(frame);
                if is_speech {
                    self.silence = Duration::ZERO;
                    self.last_speech_end = frame_end;
                } else {
                    self.silence += self.frame_duration;
                    if self.silence >= Duration::from_millis(self.config.min_silence_duration_ms as u64)
                    {
                        return self.close(frame_end);
                    }
                }

                if self.config.max_segment_duration_ms > 0
                    && let Some(onset) = self.onset
                    && frame_end.saturating_sub(onset)
                        >= Duration::from_millis(self.config.max_segment_duration_ms as u64)
                {
                    self.stats.forced_closes += 1;
                    return self.close(frame_end);
                }
                None
            }
        }
    }

    /// Closes an in-progress utterance, e.g. when the stream ends.
    ///
    /// Emits only if the speech so far meets the minimum duration.
    pub fn flush(&mut self) -> Option<SpeechSegment> {
        match self.state {
            SegmenterState::InSpeech => self.close(self.position),
            SegmenterState::NotInSpeech => None,
        }
    }

    /// Drops all buffered audio and timers without emitting anything.
    ///
    /// Stream time keeps running, so later segments stay on the same timeline.
    pub fn reset(&mut self) {
        self.state = SegmenterState::NotInSpeech;
        self.pre_roll.clear();
        self.utterance.clear();
        self.onset = None;
        self.silence = Duration::ZERO;
        self.classifier.reset();
    }

    fn close(&mut self, end: Duration) -> Option<SpeechSegment> {
        let onset = self.onset.take().unwrap_or(end);
        let speech_duration = self.last_speech_end.saturating_sub(onset);
        let samples = std::mem::take(&mut self.utterance);
        self.state = SegmenterState::NotInSpeech;
        self.silence = Duration::ZERO;

        if speech_duration < Duration::from_millis(self.config.min_speech_duration_ms as u64) {
            self.stats.segments_discarded += 1;
            tracing::trace!(
                speech_ms = speech_duration.as_millis() as u64,
                "utterance too short, discarded"
            );
            return None;
        }

        let segment = SpeechSegment {
            sequence: self.sequence,
            start: onset,
            end,
            speech_duration,
            samples,
            confidence: (speech_duration.as_secs_f32() / 1.0).min(1.0),
            sample_rate: self.sample_rate,
        };
        self.sequence += 1;
        self.stats.segments_emitted += 1;
        tracing::debug!(
            sequence = segment.sequence,
            start_ms = segment.start.as_millis() as u64,
            end_ms = segment.end.as_millis() as u64,
            confidence = segment.confidence,
            "speech segment"
        );
        Some(segment)
    }

    pub fn state(&self) -> SegmenterState {
        self.state
    }

    pub fn is_in_speech(&self) -> bool {
        self.state == SegmenterState::InSpeech
    }

    pub fn stats(&self) -> SegmenterStats {
        self.stats
    }

    pub fn classifier(&self) -> &SpeechClassifier {
        &self.classifier
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Stream time processed so far.
    pub fn position(&self) -> Duration {
        self.position
    }
}
