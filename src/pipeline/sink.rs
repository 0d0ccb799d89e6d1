use crate::audio::segmenter::SpeechSegment;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Consumer of finished speech segments (usually speech-to-text).
///
/// Called from the capture callback, so implementations must not block.
pub trait SegmentSink: Send + 'static {
    /// Takes ownership of a segment. Returns false if it was dropped.
    fn deliver(&mut self, segment: SpeechSegment) -> bool;

    /// Name for logging/debugging.
    fn name(&self) -> &'static str {
        "sink"
    }
}

/// Forwards segments over a bounded crossbeam channel.
///
/// A full channel drops the segment rather than stalling the audio thread.
pub struct ChannelSink {
    tx: Sender<SpeechSegment>,
    dropped: Arc<AtomicU64>,
}

impl ChannelSink {
    /// Creates a sink and the receiving end of its channel.
    pub fn bounded(capacity: usize) -> (Self, Receiver<SpeechSegment>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Handle to the count of segments dropped on a full or closed channel.
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }
}

impl SegmentSink for ChannelSink {
    fn deliver(&mut self, segment: SpeechSegment) -> bool {
        match self.tx.try_send(segment) {
            Ok(()) => true,
            Err(TrySendError::Full(segment)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    sequence = segment.sequence,
                    dropped,
                    "segment channel full, dropping segment"
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("segment receiver gone, dropping segment");
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

/// Keeps every segment in memory. Clones share the same storage.
#[derive(Clone, Default)]
pub struct CollectorSink {
    collected: Arc<Mutex<Vec<SpeechSegment>>>,
}

impl CollectorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Segments collected so far, oldest first.
    pub fn segments(&self) -> Vec<SpeechSegment> {
        self.collected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.collected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SegmentSink for CollectorSink {
    fn deliver(&mut self, segment: SpeechSegment) -> bool {
        self.collected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(segment);
        true
    }

    fn name(&self) -> &'static str {
        "collector"
    }
}

/// Discards segments.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl SegmentSink for NullSink {
    fn deliver(&mut self, _segment: SpeechSegment) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "null"
    }
}
