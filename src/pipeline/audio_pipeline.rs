//! Composition root: device I/O, buffering, segmentation and playback control.
//!
//! ```text
//! driver input ─▶ downmix ─▶ re-frame ─┬─▶ capture buffer
//!                                      ├─▶ energy meter ─────▶ BargeInDetector
//!                                      └─▶ segmenter (Listening only) ─▶ SegmentSink
//!
//! play_audio ─▶ playback buffer ─▶ driver output
//! ```
//!
//! Audio callbacks never block: buffer writes and reads are non-blocking and
//! every failure is counted instead of raised.

use crate::audio::devices::{DeviceDiscovery, DeviceInfo, DeviceSelector, Direction};
use crate::audio::driver::{AudioDriver, StreamSpec};
use crate::audio::frame::{Frame, FrameFormat, downmix_into};
use crate::audio::ring_buffer::SampleRingBuffer;
use crate::audio::segmenter::{SegmenterConfig, SegmenterStats, SpeechSegmenter};
use crate::audio::vad::{ClassifierStats, SpeechClassifier, VadBackendKind, VadMode};
use crate::defaults;
use crate::error::{Result, VoxbridgeError};
use crate::pipeline::barge_in::{BargeInDetector, BargeInState, EnergyMeter};
use crate::pipeline::error::{ErrorReporter, invoke_guarded, log_reporter};
use crate::pipeline::sink::{NullSink, SegmentSink};
use crate::pipeline::state::{PipelineState, StateMachine};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Everything an [`AudioPipeline`] needs, resolved from the config file.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub format: FrameFormat,
    pub input_device: DeviceSelector,
    pub output_device: DeviceSelector,
    pub capture_channels: u16,
    pub playback_channels: u16,
    pub capture_buffer_frames: usize,
    pub playback_buffer_frames: usize,
    pub vad_mode: VadMode,
    pub vad_backend: VadBackendKind,
    pub segmenter: SegmenterConfig,
    /// Scales frame RMS into the 0..1 energy reading used for barge-in.
    pub energy_gain: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            format: FrameFormat::default(),
            input_device: DeviceSelector::Default,
            output_device: DeviceSelector::Default,
            capture_channels: 1,
            playback_channels: 1,
            capture_buffer_frames: defaults::CAPTURE_BUFFER_FRAMES,
            playback_buffer_frames: defaults::PLAYBACK_BUFFER_FRAMES,
            vad_mode: VadMode::default(),
            vad_backend: VadBackendKind::default(),
            segmenter: SegmenterConfig::default(),
            energy_gain: defaults::BARGE_IN_ENERGY_GAIN,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        self.format.validate()?;
        if self.capture_channels == 0 {
            return Err(VoxbridgeError::invalid(
                "capture_channels",
                "must be at least 1",
            ));
        }
        if self.playback_channels == 0 {
            return Err(VoxbridgeError::invalid(
                "playback_channels",
                "must be at least 1",
            ));
        }
        if self.capture_buffer_frames == 0 {
            return Err(VoxbridgeError::invalid(
                "capture_buffer_frames",
                "must be at least 1",
            ));
        }
        if self.playback_buffer_frames == 0 {
            return Err(VoxbridgeError::invalid(
                "playback_buffer_frames",
                "must be at least 1",
            ));
        }
        if !(self.energy_gain.is_finite() && self.energy_gain > 0.0) {
            return Err(VoxbridgeError::invalid(
                "energy_gain",
                format!("{} must be a positive number", self.energy_gain),
            ));
        }
        self.segmenter.validate(&self.format)
    }
}

/// Pipeline counters and buffer levels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStats {
    pub state: PipelineState,
    pub transitions: u64,
    pub capture_running: bool,
    pub playback_running: bool,
    pub frames_captured: u64,
    pub capture_dropped: u64,
    pub capture_buffered: usize,
    pub frames_played: u64,
    pub playback_rejected: u64,
    pub playback_buffered: usize,
    /// Times queued playback ran dry.
    pub underruns: u64,
    pub utterances_played: u64,
    pub barge_ins: u64,
    pub segments_delivered: u64,
    pub segments_dropped: u64,
    pub classifier: ClassifierStats,
    pub segmenter: SegmenterStats,
}

/// Audio-thread side of capture: re-framing, segmentation and delivery.
struct CaptureProcessor {
    channels: usize,
    frame_len: usize,
    mono: Vec<i16>,
    pending: Vec<i16>,
    segmenter: SpeechSegmenter,
    sink: Box<dyn SegmentSink>,
    was_listening: bool,
}

/// State shared between the pipeline handle and the audio callbacks.
struct Shared {
    format: FrameFormat,
    state: StateMachine,
    capture: SampleRingBuffer,
    playback: SampleRingBuffer,
    energy: Arc<EnergyMeter>,
    capture_proc: Mutex<CaptureProcessor>,
    reporter: Arc<dyn ErrorReporter>,
    speaking: AtomicBool,
    /// Bumped on every playback abort so the output callback drops its partial frame.
    playback_epoch: AtomicU64,
    frames_captured: AtomicU64,
    frames_played: AtomicU64,
    playback_rejected: AtomicU64,
    underruns: AtomicU64,
    utterances_played: AtomicU64,
    barge_ins: AtomicU64,
    segments_delivered: AtomicU64,
    segments_dropped: AtomicU64,
}

impl Shared {
    fn capture_proc(&self) -> MutexGuard<'_, CaptureProcessor> {
        self.capture_proc
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Input callback body: interleaved device samples in, frames out.
    fn process_capture(&self, data: &[i16]) {
        let mut guard = self.capture_proc();
        let proc = &mut *guard;

        proc.mono.clear();
        downmix_into(data, proc.channels, &mut proc.mono);
        proc.pending.extend_from_slice(&proc.mono);

        let mut consumed = 0;
        while proc.pending.len() - consumed >= proc.frame_len {
            let frame: Frame = proc.pending[consumed..consumed + proc.frame_len].to_vec();
            consumed += proc.frame_len;
            self.frames_captured.fetch_add(1, Ordering::Relaxed);
            self.energy.update_from_frame(&frame);

            let listening = self.state.get() == PipelineState::Listening;
            if listening {
                if let Some(segment) = proc.segmenter.process_frame(&frame) {
                    let sink = &mut proc.sink;
                    let delivered =
                        invoke_guarded(self.reporter.as_ref(), "segment-sink", || {
                            sink.deliver(segment)
                        })
                        .unwrap_or(false);
                    if delivered {
                        self.segments_delivered.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.segments_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            } else if proc.was_listening {
                // Half an utterance from before the state change is stale.
                proc.segmenter.reset();
            }
            proc.was_listening = listening;

            if !self.capture.write(frame, false, None) {
                let dropped = self.capture.dropped_frames();
                if dropped % 100 == 1 {
                    tracing::debug!(dropped, "capture buffer full, dropping frames");
                }
            }
        }
        proc.pending.drain(..consumed);
    }

    fn stop_playback_immediate(&self) -> bool {
        let mut discarded = 0;
        let stopped = self
            .state
            .transition_if(PipelineState::Listening, |from| {
                if from != PipelineState::Speaking {
                    return false;
                }
                discarded = self.playback.clear();
                self.playback_epoch.fetch_add(1, Ordering::SeqCst);
                self.speaking.store(false, Ordering::SeqCst);
                self.barge_ins.fetch_add(1, Ordering::Relaxed);
                true
            });
        if stopped {
            tracing::info!(discarded, "playback interrupted");
        }
        stopped
    }
}

/// Output callback state: the frame currently being played out.
struct PlaybackCursor {
    shared: Arc<Shared>,
    channels: usize,
    current: Frame,
    offset: usize,
    epoch: u64,
}

impl PlaybackCursor {
    fn fill(&mut self, out: &mut [i16]) {
        let epoch = self.shared.playback_epoch.load(Ordering::SeqCst);
        if epoch != self.epoch {
            self.epoch = epoch;
            self.current.clear();
            self.offset = 0;
        }

        let mut underrun = false;
        for slot in out.chunks_mut(self.channels) {
            if self.offset >= self.current.len() {
                match self.shared.playback.read(false, None) {
                    Some(frame) => {
                        self.shared.frames_played.fetch_add(1, Ordering::Relaxed);
                        self.current = frame;
                        self.offset = 0;
                    }
                    None => {
                        underrun = true;
                        slot.fill(0);
                        continue;
                    }
                }
            }
            slot.fill(self.current[self.offset]);
            self.offset += 1;
        }

        if underrun && self.shared.speaking.swap(false, Ordering::SeqCst) {
            self.shared.underruns.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("playback queue drained");
        }
    }
}

/// Real-time audio pipeline.
///
/// Cheap to share: every method takes `&self`.
pub struct AudioPipeline {
    config: PipelineConfig,
    discovery: Arc<dyn DeviceDiscovery>,
    driver: Mutex<Box<dyn AudioDriver>>,
    input_device: Mutex<Option<DeviceInfo>>,
    output_device: Mutex<Option<DeviceInfo>>,
    capture_running: AtomicBool,
    playback_running: AtomicBool,
    shared: Arc<Shared>,
}

impl AudioPipeline {
    /// Builds a pipeline. Fails only on invalid configuration.
    pub fn new(
        config: PipelineConfig,
        discovery: Arc<dyn DeviceDiscovery>,
        driver: Box<dyn AudioDriver>,
    ) -> Result<Self> {
        config.validate()?;

        let classifier = SpeechClassifier::new(config.format, config.vad_mode, config.vad_backend)?;
        let segmenter = SpeechSegmenter::new(classifier, config.segmenter)?;
        let reporter = log_reporter();

        let shared = Arc::new(Shared {
            format: config.format,
            state: StateMachine::new(Arc::clone(&reporter)),
            capture: SampleRingBuffer::new(config.capture_buffer_frames)?,
            playback: SampleRingBuffer::new(config.playback_buffer_frames)?,
            energy: Arc::new(EnergyMeter::new(config.energy_gain)),
            capture_proc: Mutex::new(CaptureProcessor {
                channels: config.capture_channels as usize,
                frame_len: config.format.samples_per_frame(),
                mono: Vec::new(),
                pending: Vec::new(),
                segmenter,
                sink: Box::new(NullSink),
                was_listening: false,
            }),
            reporter,
            speaking: AtomicBool::new(false),
            playback_epoch: AtomicU64::new(0),
            frames_captured: AtomicU64::new(0),
            frames_played: AtomicU64::new(0),
            playback_rejected: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            utterances_played: AtomicU64::new(0),
            barge_ins: AtomicU64::new(0),
            segments_delivered: AtomicU64::new(0),
            segments_dropped: AtomicU64::new(0),
        });

        Ok(Self {
            config,
            discovery,
            driver: Mutex::new(driver),
            input_device: Mutex::new(None),
            output_device: Mutex::new(None),
            capture_running: AtomicBool::new(false),
            playback_running: AtomicBool::new(false),
            shared,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn driver(&self) -> MutexGuard<'_, Box<dyn AudioDriver>> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, direction: Direction, selector: &DeviceSelector) -> Option<DeviceInfo> {
        let device = self.discovery.resolve(direction, selector);
        match &device {
            Some(d) => tracing::info!(%direction, device = %d.name, "audio device selected"),
            None => tracing::warn!(%direction, requested = %selector, "no audio device found"),
        }
        device
    }

    /// Resolves the configured capture and playback devices.
    ///
    /// Returns false if either side could not be resolved; the side that was
    /// found is still kept.
    pub fn initialize_devices(&self) -> bool {
        let input = self.resolve(Direction::Input, &self.config.input_device);
        let output = self.resolve(Direction::Output, &self.config.output_device);
        let complete = input.is_some() && output.is_some();
        *self.input_device.lock().unwrap_or_else(PoisonError::into_inner) = input;
        *self.output_device.lock().unwrap_or_else(PoisonError::into_inner) = output;
        complete
    }

    pub fn input_device(&self) -> Option<DeviceInfo> {
        self.input_device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn output_device(&self) -> Option<DeviceInfo> {
        self.output_device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Opens the capture stream. False if there is no device or no driver.
    pub fn start_capture(&self) -> bool {
        if self.capture_running.load(Ordering::SeqCst) {
            return true;
        }
        let Some(device) = self.input_device() else {
            tracing::warn!("capture not started: no input device");
            return false;
        };
        let mut driver = self.driver();
        if !driver.is_available() {
            tracing::warn!("capture not started: audio driver unavailable");
            return false;
        }

        let spec = StreamSpec {
            sample_rate: self.config.format.sample_rate,
            channels: self.config.capture_channels,
        };
        let shared = Arc::clone(&self.shared);
        match driver.open_input(
            &device,
            spec,
            Box::new(move |data| shared.process_capture(data)),
        ) {
            Ok(()) => {
                self.capture_running.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                tracing::warn!("capture not started: {}", e);
                false
            }
        }
    }

    /// Closes the capture stream and drops buffered frames. Idempotent.
    pub fn stop_capture(&self) {
        if self.capture_running.swap(false, Ordering::SeqCst) {
            self.driver().close_input();
            let discarded = self.shared.capture.clear();
            tracing::debug!(discarded, "capture stopped");
        }
    }

    /// Opens the playback stream. False if there is no device or no driver.
    pub fn start_playback(&self) -> bool {
        if self.playback_running.load(Ordering::SeqCst) {
            return true;
        }
        let Some(device) = self.output_device() else {
            tracing::warn!("playback not started: no output device");
            return false;
        };
        let mut driver = self.driver();
        if !driver.is_available() {
            tracing::warn!("playback not started: audio driver unavailable");
            return false;
        }

        let spec = StreamSpec {
            sample_rate: self.config.format.sample_rate,
            channels: self.config.playback_channels,
        };
        let mut cursor = PlaybackCursor {
            epoch: self.shared.playback_epoch.load(Ordering::SeqCst),
            shared: Arc::clone(&self.shared),
            channels: self.config.playback_channels as usize,
            current: Vec::new(),
            offset: 0,
        };
        match driver.open_output(&device, spec, Box::new(move |out| cursor.fill(out))) {
            Ok(()) => {
                self.playback_running.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                tracing::warn!("playback not started: {}", e);
                false
            }
        }
    }

    /// Closes the playback stream and discards unplayed audio. Idempotent.
    pub fn stop_playback(&self) {
        if self.playback_running.swap(false, Ordering::SeqCst) {
            self.driver().close_output();
            let discarded = self.shared.playback.clear();
            self.shared.playback_epoch.fetch_add(1, Ordering::SeqCst);
            self.shared.speaking.store(false, Ordering::SeqCst);
            tracing::debug!(discarded, "playback stopped");
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.capture_running.load(Ordering::SeqCst)
    }

    pub fn is_playing(&self) -> bool {
        self.playback_running.load(Ordering::SeqCst)
    }

    /// Queues synthesized mono audio for playback.
    ///
    /// The audio is cut into frames (the last one zero-padded) and queued until
    /// the buffer is full. Returns true and enters `Speaking` if at least one
    /// frame was queued.
    pub fn play_audio(&self, samples: &[i16]) -> bool {
        if self.state() == PipelineState::Error {
            tracing::debug!("play_audio ignored in error state");
            return false;
        }

        let frame_len = self.shared.format.samples_per_frame();
        let total = samples.len().div_ceil(frame_len);
        let mut queued = 0;
        for chunk in samples.chunks(frame_len) {
            let mut frame = chunk.to_vec();
            frame.resize(frame_len, 0);
            if !self.shared.playback.write(frame, false, None) {
                break;
            }
            queued += 1;
        }

        if queued < total {
            self.shared
                .playback_rejected
                .fetch_add((total - queued) as u64, Ordering::Relaxed);
            tracing::warn!(queued, total, "playback buffer full, audio truncated");
        }
        if queued == 0 {
            return false;
        }

        self.shared.speaking.store(true, Ordering::SeqCst);
        self.shared.utterances_played.fetch_add(1, Ordering::Relaxed);
        self.shared.state.transition(PipelineState::Speaking);
        true
    }

    /// Aborts playback: discards queued audio and returns to `Listening`.
    ///
    /// Only acts while `Speaking`; otherwise returns false and changes nothing.
    pub fn stop_playback_immediate(&self) -> bool {
        self.shared.stop_playback_immediate()
    }

    /// True while queued playback audio has not drained yet.
    pub fn is_speaking(&self) -> bool {
        self.shared.speaking.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state.get()
    }

    pub fn start_listening(&self) -> bool {
        self.shared.state.transition(PipelineState::Listening)
    }

    pub fn start_processing(&self) -> bool {
        self.shared.state.transition(PipelineState::Processing)
    }

    pub fn start_speaking(&self) -> bool {
        self.shared.state.transition(PipelineState::Speaking)
    }

    pub fn go_idle(&self) -> bool {
        self.shared.state.transition(PipelineState::Idle)
    }

    /// Enters `Error`. The orchestrator decides how to recover.
    pub fn set_error(&self, reason: &str) -> bool {
        tracing::error!(reason, "pipeline error");
        self.shared.state.transition(PipelineState::Error)
    }

    /// Registers an observer called with `(from, to)` after every transition.
    ///
    /// Observers run outside the state lock; a panicking observer is reported
    /// and skipped.
    pub fn add_observer(
        &self,
        observer: impl Fn(PipelineState, PipelineState) + Send + Sync + 'static,
    ) {
        self.shared.state.add_observer(Arc::new(observer));
    }

    /// Replaces the consumer of finished speech segments.
    pub fn set_segment_sink(&self, sink: Box<dyn SegmentSink>) {
        tracing::debug!(sink = sink.name(), "segment sink attached");
        self.shared.capture_proc().sink = sink;
    }

    /// Energy readings of captured audio, for a [`BargeInDetector`].
    pub fn energy_meter(&self) -> Arc<EnergyMeter> {
        Arc::clone(&self.shared.energy)
    }

    /// Captured frames, for consumers that want raw audio.
    pub fn capture_buffer(&self) -> &SampleRingBuffer {
        &self.shared.capture
    }

    /// Wires a detector to this pipeline in both directions.
    ///
    /// The detector follows the pipeline state (Speaking, Listening, idle
    /// otherwise), and a confirmed interruption aborts playback.
    pub fn attach_barge_in(&self, detector: &Arc<BargeInDetector>) {
        let weak_shared = Arc::downgrade(&self.shared);
        let weak_detector = Arc::downgrade(detector);
        let mirror = Mutex::new(());
        self.add_observer(move |_, _| {
            let (Some(shared), Some(detector)) = (weak_shared.upgrade(), weak_detector.upgrade())
            else {
                return;
            };
            // Notifications may arrive out of order. Follow the state as it is
            // now, one observer call at a time, so the last call wins.
            let _mirror = mirror.lock().unwrap_or_else(PoisonError::into_inner);
            let result = match shared.state.get() {
                PipelineState::Speaking => {
                    detector.start_speaking();
                    Ok(())
                }
                PipelineState::Listening if detector.state() == BargeInState::Interrupting => {
                    detector.acknowledge_interruption()
                }
                PipelineState::Listening => detector.start_listening(),
                PipelineState::Idle | PipelineState::Processing | PipelineState::Error => {
                    detector.go_idle();
                    Ok(())
                }
            };
            if let Err(e) = result {
                tracing::debug!("barge-in detector did not follow pipeline: {}", e);
            }
        });

        let weak_shared = Arc::downgrade(&self.shared);
        let weak_detector = Arc::downgrade(detector);
        detector.on_interruption(move |event| {
            let Some(shared) = weak_shared.upgrade() else {
                return;
            };
            if !shared.stop_playback_immediate() {
                // Playback had already ended; still leave Interrupting.
                if let Some(detector) = weak_detector.upgrade()
                    && let Err(e) = detector.acknowledge_interruption()
                {
                    tracing::debug!("interruption not acknowledged: {}", e);
                }
            }
            tracing::debug!(latency_ms = event.latency_ms, "barge-in handled");
        });

        // Sync with the current state
        if self.state() == PipelineState::Speaking {
            detector.start_speaking();
        }
    }

    pub fn stats(&self) -> PipelineStats {
        let (classifier, segmenter) = {
            let proc = self.shared.capture_proc();
            (proc.segmenter.classifier().stats(), proc.segmenter.stats())
        };
        let shared = &self.shared;
        PipelineStats {
            state: shared.state.get(),
            transitions: shared.state.transition_count(),
            capture_running: self.is_capturing(),
            playback_running: self.is_playing(),
            frames_captured: shared.frames_captured.load(Ordering::Relaxed),
            capture_dropped: shared.capture.dropped_frames(),
            capture_buffered: shared.capture.len(),
            frames_played: shared.frames_played.load(Ordering::Relaxed),
            playback_rejected: shared.playback_rejected.load(Ordering::Relaxed),
            playback_buffered: shared.playback.len(),
            underruns: shared.underruns.load(Ordering::Relaxed),
            utterances_played: shared.utterances_played.load(Ordering::Relaxed),
            barge_ins: shared.barge_ins.load(Ordering::Relaxed),
            segments_delivered: shared.segments_delivered.load(Ordering::Relaxed),
            segments_dropped: shared.segments_dropped.load(Ordering::Relaxed),
            classifier,
            segmenter,
        }
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.stop_capture();
        self.stop_playback();
    }
}
