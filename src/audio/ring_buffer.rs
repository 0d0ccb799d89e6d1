//! Bounded frame queue shared between an audio callback and the rest of the pipeline.
//!
//! - Fixed capacity in frames, strict FIFO
//! - Non-blocking access for the audio thread (drop on full, `None` on empty)
//! - Optional blocking access with timeout for everyone else
//! - `clear()` discards everything queued, used to abort unplayed speech

use crate::audio::frame::Frame;
use crate::error::{Result, VoxbridgeError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Single-producer/single-consumer frame queue.
///
/// Callers must not multiplex several producers (or consumers) onto one
/// instance; ordering is only defined per producer.
pub struct SampleRingBuffer {
    frames: Mutex<VecDeque<Frame>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    dropped: AtomicU64,
}

impl SampleRingBuffer {
    /// Creates a buffer holding at most `capacity` frames.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(VoxbridgeError::invalid(
                "buffer_frames",
                "ring buffer capacity must be at least one frame",
            ));
        }
        Ok(Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            dropped: AtomicU64::new(0),
        })
    }

    // A panicking holder cannot leave the deque half-mutated, so a poisoned
    // lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, VecDeque<Frame>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues one frame.
    ///
    /// When the buffer is full a non-blocking write returns `false` at once and
    /// the frame is dropped. A blocking write waits for space, up to `timeout`
    /// (`None` waits indefinitely), and returns `false` if none appeared.
    pub fn write(&self, frame: Frame, blocking: bool, timeout: Option<Duration>) -> bool {
        let mut frames = self.lock();

        if frames.len() >= self.capacity {
            if !blocking {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            frames = match timeout {
                Some(timeout) => {
                    let (guard, result) = self
                        .not_full
                        .wait_timeout_while(frames, timeout, |f| f.len() >= self.capacity)
                        .unwrap_or_else(PoisonError::into_inner);
                    if result.timed_out() && guard.len() >= self.capacity {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return false;
                    }
                    guard
                }
                None => self
                    .not_full
                    .wait_while(frames, |f| f.len() >= self.capacity)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }

        frames.push_back(frame);
        drop(frames);
        self.not_empty.notify_one();
        true
    }

    /// Dequeues the oldest frame.
    ///
    /// Same blocking semantics as [`write`](Self::write): `None` means no frame
    /// arrived before the call gave up.
    pub fn read(&self, blocking: bool, timeout: Option<Duration>) -> Option<Frame> {
        let mut frames = self.lock();

        if frames.is_empty() {
            if !blocking {
                return None;
            }
            frames = match timeout {
                Some(timeout) => {
                    self.not_empty
                        .wait_timeout_while(frames, timeout, |f| f.is_empty())
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .not_empty
                    .wait_while(frames, |f| f.is_empty())
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }

        let frame = frames.pop_front();
        drop(frames);
        if frame.is_some() {
            self.not_full.notify_one();
        }
        frame
    }

    /// Discards every queued frame and returns how many were discarded.
    pub fn clear(&self) -> usize {
        let mut frames = self.lock();
        let discarded = frames.len();
        frames.clear();
        drop(frames);
        self.not_full.notify_all();
        discarded
    }

    /// Advisory: true if nothing is queued right now.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Advisory: true if a non-blocking write would fail right now.
    pub fn is_full(&self) -> bool {
        self.lock().len() >= self.capacity
    }

    /// Advisory: number of queued frames.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames rejected because the buffer was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn frame(tag: i16) -> Frame {
        vec![tag; 4]
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert!(SampleRingBuffer::new(0).is_err());
    }

    #[test]
    fn test_fifo_order() {
        let buffer = SampleRingBuffer::new(8).unwrap();
        for i in 0..5 {
            assert!(buffer.write(frame(i), false, None));
        }
        for i in 0..5 {
            assert_eq!(buffer.read(false, None), Some(frame(i)));
        }
        assert_eq!(buffer.read(false, None), None);
    }

    #[test]
    fn test_non_blocking_write_drops_when_full() {
        let buffer = SampleRingBuffer::new(2).unwrap();
        assert!(buffer.write(frame(1), false, None));
        assert!(buffer.write(frame(2), false, None));
        assert!(buffer.is_full());

        assert!(!buffer.write(frame(3), false, None));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.dropped_frames(), 1);

        // The dropped frame never shows up
        assert_eq!(buffer.read(false, None), Some(frame(1)));
        assert_eq!(buffer.read(false, None), Some(frame(2)));
        assert_eq!(buffer.read(false, None), None);
    }

    #[test]
    fn test_blocking_write_times_out_when_full() {
        let buffer = SampleRingBuffer::new(1).unwrap();
        assert!(buffer.write(frame(1), false, None));

        let start = Instant::now();
        let written = buffer.write(frame(2), true, Some(Duration::from_millis(30)));
        assert!(!written);
        assert!(start.elapsed() >= Duration::from_millis(25));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_blocking_read_times_out_when_empty() {
        let buffer = SampleRingBuffer::new(4).unwrap();
        let start = Instant::now();
        assert_eq!(buffer.read(true, Some(Duration::from_millis(30))), None);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_blocking_read_wakes_on_write() {
        let buffer = Arc::new(SampleRingBuffer::new(4).unwrap());
        let reader = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || buffer.read(true, Some(Duration::from_secs(2))))
        };

        thread::sleep(Duration::from_millis(20));
        assert!(buffer.write(frame(7), false, None));

        assert_eq!(reader.join().unwrap(), Some(frame(7)));
    }

    #[test]
    fn test_blocking_write_wakes_on_clear() {
        let buffer = Arc::new(SampleRingBuffer::new(1).unwrap());
        assert!(buffer.write(frame(1), false, None));

        let writer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || buffer.write(frame(2), true, Some(Duration::from_secs(2))))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(buffer.clear(), 1);

        assert!(writer.join().unwrap());
        assert_eq!(buffer.read(false, None), Some(frame(2)));
    }

    #[test]
    fn test_clear_empties_buffer() {
        let buffer = SampleRingBuffer::new(8).unwrap();
        for i in 0..6 {
            buffer.write(frame(i), false, None);
        }
        assert_eq!(buffer.clear(), 6);
        assert!(buffer.is_empty());
        assert_eq!(buffer.read(false, None), None);

        // New writes are visible again after a clear
        buffer.write(frame(42), false, None);
        assert_eq!(buffer.read(false, None), Some(frame(42)));
    }

    #[test]
    fn test_concurrent_producer_consumer_preserves_order_and_bound() {
        const CAPACITY: usize = 8;
        const COUNT: i16 = 2000;

        let buffer = Arc::new(SampleRingBuffer::new(CAPACITY).unwrap());

        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for i in 0..COUNT {
                    assert!(buffer.write(frame(i), true, Some(Duration::from_secs(5))));
                    assert!(buffer.len() <= CAPACITY);
                }
            })
        };

        let consumer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                let mut received = Vec::with_capacity(COUNT as usize);
                while received.len() < COUNT as usize {
                    if let Some(f) = buffer.read(true, Some(Duration::from_secs(5))) {
                        received.push(f[0]);
                    }
                    assert!(buffer.len() <= CAPACITY);
                }
                received
            })
        };

        producer.join().unwrap();
        let received = consumer.join().unwrap();
        let expected: Vec<i16> = (0..COUNT).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_lossy_producer_keeps_surviving_frames_in_order() {
        let buffer = Arc::new(SampleRingBuffer::new(4).unwrap());

        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                let mut accepted = Vec::new();
                for i in 0..500i16 {
                    if buffer.write(frame(i), false, None) {
                        accepted.push(i);
                    }
                }
                accepted
            })
        };

        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match buffer.read(false, None) {
                Some(f) => received.push(f[0]),
                None if producer.is_finished() && buffer.is_empty() => break,
                None => thread::yield_now(),
            }
            assert!(Instant::now() < deadline, "consumer did not finish");
        }

        let accepted = producer.join().unwrap();
        assert_eq!(received, accepted);
        assert_eq!(
            buffer.dropped_frames() as usize + accepted.len(),
            500,
            "every write is either accepted or counted as dropped"
        );
    }
}
