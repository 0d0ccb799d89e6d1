//! Barge-in detection: the user talking over the assistant.
//!
//! ```text
//!   Idle ──start_listening──▶ Listening ──start_speaking──▶ Speaking
//!    ▲                           ▲  ▲                          │
//!    │ go_idle (any)             │  └──────start_listening─────┤
//!    │                           │                             │ energy > threshold
//!    │                acknowledge_interruption                 │ for min_speech
//!    │                           │                             ▼
//!    └───────────────────────────┴────────────────────── Interrupting
//! ```
//!
//! Energy is polled (every `poll_interval_ms`, 50ms by default) rather than
//! pushed, so detection latency is bounded by the poll period plus
//! `min_speech_duration_ms`.

use crate::audio::vad::{Clock, SystemClock, calculate_rms};
use crate::defaults;
use crate::error::{Result, VoxbridgeError};
use crate::pipeline::error::{ErrorReporter, invoke_guarded, log_reporter};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How loud the user has to be to interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    #[default]
    Medium,
    High,
}

impl Sensitivity {
    /// Energy level (0..1) that counts as the user speaking.
    pub fn threshold(self) -> f32 {
        match self {
            Sensitivity::Low => 0.7,
            Sensitivity::Medium => 0.5,
            Sensitivity::High => 0.3,
        }
    }
}

impl std::str::FromStr for Sensitivity {
    type Err = VoxbridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Sensitivity::Low),
            "medium" => Ok(Sensitivity::Medium),
            "high" => Ok(Sensitivity::High),
            other => Err(VoxbridgeError::invalid(
                "sensitivity",
                format!("'{}' is not one of low, medium, high", other),
            )),
        }
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sensitivity::Low => write!(f, "low"),
            Sensitivity::Medium => write!(f, "medium"),
            Sensitivity::High => write!(f, "high"),
        }
    }
}

/// Configuration for the barge-in detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInConfig {
    pub enabled: bool,
    pub sensitivity: Sensitivity,
    /// Sustained energy needed to confirm an interruption (milliseconds).
    pub min_speech_duration_ms: u32,
    /// No confirmations for this long after one (milliseconds).
    pub cooldown_ms: u32,
    /// Latency target, only reported against (milliseconds).
    pub max_latency_ms: u32,
    /// Period of the polling task (milliseconds).
    pub poll_interval_ms: u64,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sensitivity: Sensitivity::default(),
            min_speech_duration_ms: defaults::BARGE_IN_MIN_SPEECH_MS,
            cooldown_ms: defaults::BARGE_IN_COOLDOWN_MS,
            max_latency_ms: defaults::BARGE_IN_MAX_LATENCY_MS,
            poll_interval_ms: defaults::BARGE_IN_POLL_INTERVAL_MS,
        }
    }
}

impl BargeInConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_speech_duration_ms == 0 {
            return Err(VoxbridgeError::invalid(
                "min_speech_duration_ms",
                "must be greater than 0",
            ));
        }
        if self.max_latency_ms == 0 {
            return Err(VoxbridgeError::invalid(
                "max_latency_ms",
                "must be greater than 0",
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(VoxbridgeError::invalid(
                "poll_interval_ms",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    fn min_speech(&self) -> Duration {
        Duration::from_millis(self.min_speech_duration_ms as u64)
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms as u64)
    }
}

/// Detector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BargeInState {
    Idle,
    Listening,
    Speaking,
    Interrupting,
}

impl fmt::Display for BargeInState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BargeInState::Idle => "idle",
            BargeInState::Listening => "listening",
            BargeInState::Speaking => "speaking",
            BargeInState::Interrupting => "interrupting",
        };
        f.write_str(name)
    }
}

/// Something that reports the current input energy in 0..1.
pub trait EnergySource: Send + Sync {
    fn energy(&self) -> f32;
}

/// Latest input energy, written by the capture callback and read by the detector.
///
/// Lock-free: the value is an `f32` stored as bits in an atomic.
#[derive(Debug)]
pub struct EnergyMeter {
    bits: AtomicU32,
    gain: f32,
}

impl EnergyMeter {
    /// Creates a meter that scales frame RMS by `gain` (clamped to 1.0).
    pub fn new(gain: f32) -> Self {
        Self {
            bits: AtomicU32::new(0.0f32.to_bits()),
            gain,
        }
    }

    /// Updates the reading from a captured frame.
    pub fn update_from_frame(&self, frame: &[i16]) {
        self.set(calculate_rms(frame) * self.gain);
    }

    /// Sets the reading directly. Non-finite values read as silence.
    pub fn set(&self, energy: f32) {
        let energy = if energy.is_finite() {
            energy.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.bits.store(energy.to_bits(), Ordering::Relaxed);
    }

    pub fn level(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

impl Default for EnergyMeter {
    fn default() -> Self {
        Self::new(defaults::BARGE_IN_ENERGY_GAIN)
    }
}

impl EnergySource for EnergyMeter {
    fn energy(&self) -> f32 {
        self.level()
    }
}

/// A confirmed interruption.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterruptionEvent {
    pub timestamp: Instant,
    /// Energy reading that confirmed it.
    pub energy: f32,
    /// min(1, sustained speech / min_speech_duration).
    pub confidence: f32,
    /// Time from the first loud reading to confirmation.
    pub latency_ms: f64,
}

/// Detector counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BargeInStats {
    pub enabled: bool,
    pub state: BargeInState,
    pub total_interruptions: u64,
    pub average_latency_ms: f64,
    pub max_latency_ms: u32,
    /// Whether the average latency is within target; `None` before the first interruption.
    pub latency_target_met: Option<bool>,
}

/// Called with each confirmed interruption.
pub type InterruptionCallback = Arc<dyn Fn(&InterruptionEvent) + Send + Sync>;

struct DetectorState {
    state: BargeInState,
    onset: Option<Instant>,
    last_confirmation: Option<Instant>,
    total_interruptions: u64,
    latency_sum_ms: f64,
}

/// Barge-in state machine.
///
/// Every transition and every [`check`](Self::check) runs under one lock, so a
/// poll racing an explicit transition never sees a half-updated state.
pub struct BargeInDetector {
    config: BargeInConfig,
    threshold: f32,
    energy: Arc<dyn EnergySource>,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn ErrorReporter>,
    inner: Mutex<DetectorState>,
    callbacks: Mutex<Vec<InterruptionCallback>>,
}

impl BargeInDetector {
    /// Creates a detector reading from `energy`. Starts `Idle`.
    pub fn new(config: BargeInConfig, energy: Arc<dyn EnergySource>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            threshold: config.sensitivity.threshold(),
            config,
            energy,
            clock: Arc::new(SystemClock),
            reporter: log_reporter(),
            inner: Mutex::new(DetectorState {
                state: BargeInState::Idle,
                onset: None,
                last_confirmation: None,
                total_interruptions: 0,
                latency_sum_ms: 0.0,
            }),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    /// Replaces the clock (tests drive time manually).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the reporter that receives callback faults.
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    fn lock(&self) -> MutexGuard<'_, DetectorState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &BargeInConfig {
        &self.config
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn state(&self) -> BargeInState {
        self.lock().state
    }

    /// Registers a callback for confirmed interruptions.
    pub fn on_interruption(&self, callback: impl Fn(&InterruptionEvent) + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    fn set_state(inner: &mut DetectorState, to: BargeInState) {
        if inner.state != to {
            tracing::debug!(from = %inner.state, %to, "barge-in state transition");
        }
        if to != BargeInState::Speaking {
            inner.onset = None;
        }
        inner.state = to;
    }

    fn invalid(from: BargeInState, to: BargeInState) -> VoxbridgeError {
        VoxbridgeError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Idle or Speaking → Listening.
    pub fn start_listening(&self) -> Result<()> {
        let mut inner = self.lock();
        match inner.state {
            BargeInState::Idle | BargeInState::Speaking | BargeInState::Listening => {
                Self::set_state(&mut inner, BargeInState::Listening);
                Ok(())
            }
            from @ BargeInState::Interrupting => Err(Self::invalid(from, BargeInState::Listening)),
        }
    }

    /// Any state → Idle.
    pub fn go_idle(&self) {
        Self::set_state(&mut self.lock(), BargeInState::Idle);
    }

    /// Any state → Speaking, with onset tracking cleared.
    pub fn start_speaking(&self) {
        let mut inner = self.lock();
        inner.onset = None;
        Self::set_state(&mut inner, BargeInState::Speaking);
    }

    /// Interrupting → Listening, once the interruption has been handled.
    pub fn acknowledge_interruption(&self) -> Result<()> {
        let mut inner = self.lock();
        match inner.state {
            BargeInState::Interrupting => {
                Self::set_state(&mut inner, BargeInState::Listening);
                Ok(())
            }
            from => Err(Self::invalid(from, BargeInState::Listening)),
        }
    }

    /// One poll of the energy source.
    pub fn check(&self) -> Option<InterruptionEvent> {
        let energy = self.energy.energy();
        self.check_energy(energy)
    }

    /// One poll with an explicit energy reading.
    pub fn check_energy(&self, energy: f32) -> Option<InterruptionEvent> {
        let event = {
            let mut inner = self.lock();
            if !self.config.enabled || inner.state != BargeInState::Speaking {
                return None;
            }

            let now = self.clock.now();
            if let Some(last) = inner.last_confirmation
                && now.saturating_duration_since(last) < self.config.cooldown()
            {
                return None;
            }

            // NaN never counts as loud
            if energy.is_nan() || energy <= self.threshold {
                inner.onset = None;
                return None;
            }

            let onset = *inner.onset.get_or_insert(now);
            let elapsed = now.saturating_duration_since(onset);
            if elapsed < self.config.min_speech() {
                return None;
            }

            let latency_ms = elapsed.as_secs_f64() * 1000.0;
            inner.total_interruptions += 1;
            inner.latency_sum_ms += latency_ms;
            inner.last_confirmation = Some(now);
            Self::set_state(&mut inner, BargeInState::Interrupting);

            InterruptionEvent {
                timestamp: now,
                energy,
                confidence: (elapsed.as_secs_f32() / self.config.min_speech().as_secs_f32())
                    .min(1.0),
                latency_ms,
            }
        };

        tracing::info!(
            energy = event.energy,
            latency_ms = event.latency_ms,
            "barge-in confirmed"
        );
        if event.latency_ms > self.config.max_latency_ms as f64 {
            tracing::debug!(
                latency_ms = event.latency_ms,
                target_ms = self.config.max_latency_ms,
                "barge-in latency above target"
            );
        }

        let callbacks: Vec<InterruptionCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            invoke_guarded(self.reporter.as_ref(), "interruption-callback", || {
                callback(&event)
            });
        }

        Some(event)
    }

    pub fn stats(&self) -> BargeInStats {
        let inner = self.lock();
        let average_latency_ms = if inner.total_interruptions == 0 {
            0.0
        } else {
            inner.latency_sum_ms / inner.total_interruptions as f64
        };
        BargeInStats {
            enabled: self.config.enabled,
            state: inner.state,
            total_interruptions: inner.total_interruptions,
            average_latency_ms,
            max_latency_ms: self.config.max_latency_ms,
            latency_target_met: (inner.total_interruptions > 0)
                .then(|| average_latency_ms <= self.config.max_latency_ms as f64),
        }
    }

    /// Runs [`check`](Self::check) every `poll_interval_ms` on the current tokio runtime.
    ///
    /// The loop stops at the next tick boundary after the handle is stopped or
    /// dropped, never in the middle of a check.
    pub fn spawn(self: &Arc<Self>) -> BargeInHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let detector = Arc::clone(self);
        let period = Duration::from_millis(self.config.poll_interval_ms);

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::debug!(period_ms = period.as_millis() as u64, "barge-in polling started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        detector.check();
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("barge-in polling stopped");
        });

        BargeInHandle {
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }
}

/// Handle to a running barge-in polling task.
///
/// Dropping the handle stops the task.
pub struct BargeInHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl BargeInHandle {
    /// Asks the polling task to stop.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Stops the task and waits for it to finish.
    pub async fn join(mut self) {
        self.stop();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::error!("barge-in polling task failed: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }
}

impl Drop for BargeInHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::vad::ManualClock;
    use std::sync::atomic::AtomicU64;

    const LOUD: f32 = 0.8;
    const QUIET: f32 = 0.1;
    const FRAME: Duration = Duration::from_millis(30);

    fn detector(config: BargeInConfig) -> (BargeInDetector, ManualClock) {
        let clock = ManualClock::new();
        let detector = BargeInDetector::new(config, Arc::new(EnergyMeter::default()))
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        (detector, clock)
    }

    fn medium() -> BargeInConfig {
        BargeInConfig {
            sensitivity: Sensitivity::Medium,
            min_speech_duration_ms: 100,
            cooldown_ms: 1000,
            ..BargeInConfig::default()
        }
    }

    /// Loud audio starting now and lasting `frames` frames, checked at each
    /// frame boundary, followed by one quiet check.
    fn loud_burst(
        det: &BargeInDetector,
        clock: &ManualClock,
        frames: usize,
    ) -> Vec<InterruptionEvent> {
        let mut events = Vec::new();
        events.extend(det.check_energy(LOUD));
        for _ in 0..frames {
            clock.advance(FRAME);
            events.extend(det.check_energy(LOUD));
        }
        events.extend(det.check_energy(QUIET));
        events
    }

    #[test]
    fn test_sensitivity_thresholds() {
        assert_eq!(Sensitivity::Low.threshold(), 0.7);
        assert_eq!(Sensitivity::Medium.threshold(), 0.5);
        assert_eq!(Sensitivity::High.threshold(), 0.3);
        assert_eq!("HIGH".parse::<Sensitivity>().unwrap(), Sensitivity::High);
        assert!("loud".parse::<Sensitivity>().is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = BargeInConfig {
            min_speech_duration_ms: 0,
            ..BargeInConfig::default()
        };
        assert!(BargeInDetector::new(config, Arc::new(EnergyMeter::default())).is_err());

        let config = BargeInConfig {
            poll_interval_ms: 0,
            ..BargeInConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_three_frames_do_not_confirm() {
        let (det, clock) = detector(medium());
        det.start_speaking();

        assert!(loud_burst(&det, &clock, 3).is_empty());
        assert_eq!(det.state(), BargeInState::Speaking);
        assert_eq!(det.stats().total_interruptions, 0);
    }

    #[test]
    fn test_nan_energy_never_confirms() {
        let (det, clock) = detector(medium());
        det.start_speaking();

        for _ in 0..6 {
            assert!(det.check_energy(f32::NAN).is_none());
            clock.advance(FRAME);
        }
        assert_eq!(det.state(), BargeInState::Speaking);
        assert_eq!(det.stats().total_interruptions, 0);

        // A NaN reading in the middle of loud ones restarts the onset
        assert!(det.check_energy(LOUD).is_none());
        clock.advance(Duration::from_millis(60));
        assert!(det.check_energy(f32::NAN).is_none());
        clock.advance(Duration::from_millis(60));
        assert!(det.check_energy(LOUD).is_none());
        assert_eq!(det.stats().total_interruptions, 0);
    }

    #[test]
    fn test_four_frames_confirm_exactly_once() {
        let (det, clock) = detector(medium());
        det.start_speaking();

        let events = loud_burst(&det, &clock, 4);
        assert_eq!(events.len(), 1);
        let event = events[0];
        assert!((event.latency_ms - 120.0).abs() < 1.0);
        assert_eq!(event.confidence, 1.0);
        assert_eq!(event.energy, LOUD);
        assert_eq!(det.state(), BargeInState::Interrupting);

        // More loud frames change nothing until acknowledged
        assert!(loud_burst(&det, &clock, 6).is_empty());
        assert_eq!(det.stats().total_interruptions, 1);
    }

    #[test]
    fn test_dip_below_threshold_restarts_onset() {
        let (det, clock) = detector(medium());
        det.start_speaking();

        assert!(loud_burst(&det, &clock, 3).is_empty());
        clock.advance(FRAME);
        assert!(loud_burst(&det, &clock, 3).is_empty());
        assert_eq!(det.state(), BargeInState::Speaking);
    }

    #[test]
    fn test_only_confirms_while_speaking() {
        let (det, clock) = detector(medium());
        assert!(loud_burst(&det, &clock, 10).is_empty());

        det.start_listening().unwrap();
        assert!(loud_burst(&det, &clock, 10).is_empty());

        det.go_idle();
        assert!(loud_burst(&det, &clock, 10).is_empty());
        assert_eq!(det.stats().total_interruptions, 0);
    }

    #[test]
    fn test_disabled_never_confirms() {
        let (det, clock) = detector(BargeInConfig {
            enabled: false,
            ..medium()
        });
        det.start_speaking();
        assert!(loud_burst(&det, &clock, 10).is_empty());
    }

    #[test]
    fn test_cooldown_blocks_second_confirmation() {
        let (det, clock) = detector(medium());
        det.start_speaking();
        assert_eq!(loud_burst(&det, &clock, 4).len(), 1);

        det.acknowledge_interruption().unwrap();
        det.start_speaking();

        // Still inside the 1s cooldown (120ms burst + 300ms)
        assert!(loud_burst(&det, &clock, 10).is_empty());

        clock.advance(Duration::from_secs(1));
        assert_eq!(loud_burst(&det, &clock, 4).len(), 1);
        assert_eq!(det.stats().total_interruptions, 2);
    }

    #[test]
    fn test_leaving_speaking_clears_onset() {
        let (det, clock) = detector(medium());
        det.start_speaking();
        det.check_energy(LOUD);
        clock.advance(FRAME * 3);
        det.check_energy(LOUD);

        det.start_listening().unwrap();
        det.start_speaking();
        clock.advance(FRAME);
        // Onset was reset, so 30ms of loudness is not enough
        assert!(det.check_energy(LOUD).is_none());
    }

    #[test]
    fn test_invalid_transitions() {
        let (det, clock) = detector(medium());
        assert!(matches!(
            det.acknowledge_interruption(),
            Err(VoxbridgeError::InvalidTransition { .. })
        ));

        det.start_speaking();
        loud_burst(&det, &clock, 4);
        assert_eq!(det.state(), BargeInState::Interrupting);
        assert!(det.start_listening().is_err());

        det.acknowledge_interruption().unwrap();
        assert_eq!(det.state(), BargeInState::Listening);
    }

    #[test]
    fn test_stats_latency_target() {
        let (det, clock) = detector(BargeInConfig {
            max_latency_ms: 100,
            ..medium()
        });
        assert_eq!(det.stats().latency_target_met, None);

        det.start_speaking();
        loud_burst(&det, &clock, 4);
        let stats = det.stats();
        assert_eq!(stats.total_interruptions, 1);
        assert!((stats.average_latency_ms - 120.0).abs() < 1.0);
        assert_eq!(stats.latency_target_met, Some(false));
    }

    #[test]
    fn test_callbacks_run_and_panics_are_contained() {
        let (det, clock) = detector(medium());
        let calls = Arc::new(AtomicU64::new(0));

        det.on_interruption(|_| panic!("handler failure"));
        let counter = Arc::clone(&calls);
        det.on_interruption(move |event| {
            assert!(event.latency_ms >= 100.0);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        det.start_speaking();
        assert_eq!(loud_burst(&det, &clock, 4).len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_transition_detector() {
        let (det, clock) = detector(medium());
        let det = Arc::new(det);
        let weak = Arc::downgrade(&det);
        det.on_interruption(move |_| {
            if let Some(det) = weak.upgrade() {
                det.acknowledge_interruption().unwrap();
            }
        });

        det.start_speaking();
        assert_eq!(loud_burst(&det, &clock, 4).len(), 1);
        assert_eq!(det.state(), BargeInState::Listening);
    }

    #[test]
    fn test_energy_meter_scales_and_clamps() {
        let meter = EnergyMeter::new(10.0);
        assert_eq!(meter.level(), 0.0);

        meter.update_from_frame(&[0; 480]);
        assert_eq!(meter.level(), 0.0);

        // RMS of 1638/32767 ≈ 0.05, times 10 ≈ 0.5
        meter.update_from_frame(&[1638; 480]);
        assert!((meter.level() - 0.5).abs() < 0.01);

        meter.update_from_frame(&[i16::MAX; 480]);
        assert_eq!(meter.level(), 1.0);
    }

    #[test]
    fn test_energy_meter_treats_non_finite_as_silence() {
        let meter = EnergyMeter::new(10.0);
        meter.set(0.7);
        meter.set(f32::NAN);
        assert_eq!(meter.level(), 0.0);
        meter.set(f32::INFINITY);
        assert_eq!(meter.level(), 0.0);
        meter.set(-0.5);
        assert_eq!(meter.level(), 0.0);
    }

    #[test]
    fn test_confirmation_property_over_interleavings() {
        // Deterministic pseudo-random walk over energies and transitions
        let (det, clock) = detector(medium());
        let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
        let mut last_confirmation: Option<Instant> = None;

        for _ in 0..5000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;

            match seed % 20 {
                0 => det.go_idle(),
                1 => {
                    let _ = det.start_listening();
                }
                2 | 3 => det.start_speaking(),
                4 => {
                    let _ = det.acknowledge_interruption();
                }
                _ => {}
            }

            clock.advance(Duration::from_millis(10 + seed % 40));
            let state_before = det.state();
            let energy = if seed % 3 == 0 { QUIET } else { LOUD };

            if let Some(event) = det.check_energy(energy) {
                assert_eq!(state_before, BargeInState::Speaking);
                if let Some(last) = last_confirmation {
                    assert!(event.timestamp.duration_since(last) >= Duration::from_millis(1000));
                }
                last_confirmation = Some(event.timestamp);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_task_confirms_and_stops() {
        let meter = Arc::new(EnergyMeter::default());
        let clock = ManualClock::new();
        let det = Arc::new(
            BargeInDetector::new(medium(), Arc::clone(&meter) as Arc<dyn EnergySource>)
                .unwrap()
                .with_clock(Arc::new(clock.clone())),
        );
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        det.on_interruption(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        det.start_speaking();
        meter.set(LOUD);
        let handle = det.spawn();

        // Ticks at 0ms and 50ms record the onset
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Next tick sees 150ms of sustained energy
        clock.advance(Duration::from_millis(150));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(det.state(), BargeInState::Interrupting);

        // Further ticks stay quiet while interrupting
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        handle.join().await;
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_polling() {
        let det = Arc::new(BargeInDetector::new(medium(), Arc::new(EnergyMeter::default())).unwrap());
        let handle = det.spawn();
        assert!(!handle.is_finished());
        drop(handle);
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The task holds the only other reference to the detector
        assert_eq!(Arc::strong_count(&det), 1);
    }
}
