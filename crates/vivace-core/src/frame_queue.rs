//! Decoded-frame ring buffer between a decoder and its consumer.
//!
//! A small fixed ring (4 video / 8 audio slots) decouples decode speed from
//! presentation. In keep-last mode the most recently consumed frame stays in
//! its slot: the renderer re-examines the picture it just displayed when
//! rebasing the frame timer across a serial boundary and when deciding
//! whether to drop a late frame, without ever blocking the decoder out of
//! the remaining slots.
//!
//! Read-side positions:
//! - *last*    = `frames[read_index]`, valid once a frame has been shown
//! - *current* = `frames[(read_index + read_index_shown) % capacity]`
//! - *next*    = one past current
//!
//! Advancing while `read_index_shown == 0` only flips the shown flag; the
//! frame is freed on the following advance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::facade::{DecodedFrame, Rational};
use crate::packet::Serial;

/// Video ring capacity.
pub const VIDEO_FRAME_QUEUE_CAPACITY: usize = 4;
/// Audio ring capacity.
pub const AUDIO_FRAME_QUEUE_CAPACITY: usize = 8;

/// A decoded frame plus the presentation metadata the scheduler needs.
#[derive(Debug)]
pub struct Frame {
    pub payload: DecodedFrame,
    /// Presentation time in seconds; NaN when the stream never said.
    pub pts: f64,
    /// Nominal display/window duration in seconds.
    pub duration: f64,
    /// Source byte position, for byte-based seek targets.
    pub pos: Option<i64>,
    /// Serial of the packet this frame was decoded from.
    pub serial: Serial,
    pub width: u32,
    pub height: u32,
    pub sar: Rational,
    /// Set by the renderer once the picture has been uploaded.
    pub uploaded: bool,
}

/// Copy of the scheduling-relevant fields, cheap to take under the lock.
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    pub pts: f64,
    pub duration: f64,
    pub serial: Serial,
    pub pos: Option<i64>,
}

impl From<&Frame> for FrameInfo {
    fn from(frame: &Frame) -> Self {
        Self { pts: frame.pts, duration: frame.duration, serial: frame.serial, pos: frame.pos }
    }
}

struct Ring {
    slots: Vec<Option<Frame>>,
    read_index: usize,
    write_index: usize,
    count: usize,
    read_index_shown: usize,
}

impl Ring {
    fn current_index(&self) -> usize {
        (self.read_index + self.read_index_shown) % self.slots.len()
    }

    fn next_index(&self) -> usize {
        (self.read_index + self.read_index_shown + 1) % self.slots.len()
    }

    fn remaining(&self) -> usize {
        self.count - self.read_index_shown
    }
}

/// Fixed-capacity frame ring with keep-last support.
pub struct FrameQueue {
    ring: Mutex<Ring>,
    signal: Condvar,
    capacity: usize,
    keep_last: bool,
    /// The owning decoder's stop flag; every blocking wait observes it.
    stop: Arc<AtomicBool>,
}

impl FrameQueue {
    pub fn new(capacity: usize, keep_last: bool, stop: Arc<AtomicBool>) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            ring: Mutex::new(Ring {
                slots,
                read_index: 0,
                write_index: 0,
                count: 0,
                read_index_shown: 0,
            }),
            signal: Condvar::new(),
            capacity,
            keep_last,
            stop,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames available to the consumer (`count - read_index_shown`).
    pub fn remaining(&self) -> usize {
        self.ring.lock().remaining()
    }

    /// Blocks until a slot is writable, then moves `frame` in. Returns false
    /// if the stop flag was raised while waiting.
    pub fn push(&self, frame: Frame) -> bool {
        let mut ring = self.ring.lock();
        while ring.count >= self.capacity {
            if self.stop.load(Ordering::Acquire) {
                return false;
            }
            self.signal.wait_for(&mut ring, Duration::from_millis(100));
        }
        if self.stop.load(Ordering::Acquire) {
            return false;
        }
        let index = ring.write_index;
        ring.slots[index] = Some(frame);
        ring.write_index = (ring.write_index + 1) % self.capacity;
        ring.count += 1;
        self.signal.notify_all();
        true
    }

    /// Blocks up to `timeout` until a frame is readable. Returns false on
    /// timeout or stop.
    pub fn wait_readable(&self, timeout: Duration) -> bool {
        let mut ring = self.ring.lock();
        if ring.remaining() == 0 && !self.stop.load(Ordering::Acquire) {
            self.signal.wait_for(&mut ring, timeout);
        }
        ring.remaining() > 0 && !self.stop.load(Ordering::Acquire)
    }

    /// Metadata of the *current* frame, if any.
    pub fn current_info(&self) -> Option<FrameInfo> {
        let ring = self.ring.lock();
        if ring.remaining() == 0 {
            return None;
        }
        let index = ring.current_index();
        ring.slots[index].as_ref().map(FrameInfo::from)
    }

    /// Metadata of the frame after the current one, if any.
    pub fn next_info(&self) -> Option<FrameInfo> {
        let ring = self.ring.lock();
        if ring.remaining() < 2 {
            return None;
        }
        let index = ring.next_index();
        ring.slots[index].as_ref().map(FrameInfo::from)
    }

    /// Metadata of the *last* (kept) frame. Only meaningful once a frame has
    /// been shown.
    pub fn last_info(&self) -> Option<FrameInfo> {
        let ring = self.ring.lock();
        ring.slots[ring.read_index].as_ref().map(FrameInfo::from)
    }

    /// Runs `f` against the current frame under the lock (observer-consistent
    /// snapshot point for clock updates).
    pub fn with_current<R>(&self, f: impl FnOnce(&Frame) -> R) -> Option<R> {
        let ring = self.ring.lock();
        if ring.remaining() == 0 {
            return None;
        }
        let index = ring.current_index();
        ring.slots[index].as_ref().map(f)
    }

    /// Runs `f` against the last (kept) frame with mutable access — the
    /// renderer uses this to upload the picture and mark it uploaded.
    pub fn with_last_mut<R>(&self, f: impl FnOnce(&mut Frame) -> R) -> Option<R> {
        let mut ring = self.ring.lock();
        let index = ring.read_index;
        ring.slots[index].as_mut().map(f)
    }

    /// True once a frame has been shown (the *last* slot is valid).
    pub fn has_shown_frame(&self) -> bool {
        self.ring.lock().read_index_shown != 0
    }

    /// Advances the read side. With keep-last, the first advance after a
    /// fresh frame only marks it shown; the following advance frees the
    /// oldest slot and moves `read_index`.
    pub fn advance_read(&self) {
        let mut ring = self.ring.lock();
        if self.keep_last && ring.read_index_shown == 0 {
            ring.read_index_shown = 1;
            return;
        }
        let index = ring.read_index;
        ring.slots[index] = None;
        ring.read_index = (ring.read_index + 1) % self.capacity;
        ring.count -= 1;
        self.signal.notify_all();
    }

    /// Wakes every waiter so producers and consumers can observe the stop
    /// flag; part of the shutdown protocol.
    pub fn wake_all(&self) {
        self.signal.notify_all();
    }

    /// Drops every frame including the kept one. Used at teardown only — a
    /// seek never flushes the frame ring; stale frames are discarded by the
    /// consumers' serial checks.
    pub fn clear(&self) {
        let mut ring = self.ring.lock();
        for slot in ring.slots.iter_mut() {
            *slot = None;
        }
        ring.read_index = 0;
        ring.write_index = 0;
        ring.count = 0;
        ring.read_index_shown = 0;
        self.signal.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::{AudioFrameData, DecodedFrame};

    fn frame(pts: f64, serial: Serial) -> Frame {
        Frame {
            payload: DecodedFrame::Audio(AudioFrameData {
                pts: Some((pts * 1000.0) as i64),
                sample_rate: 48_000,
                channels: 2,
                nb_samples: 1024,
                samples: vec![0.0; 2048],
            }),
            pts,
            duration: 0.04,
            pos: None,
            serial,
            width: 0,
            height: 0,
            sar: Rational::new(0, 1),
            uploaded: false,
        }
    }

    fn queue(capacity: usize, keep_last: bool) -> FrameQueue {
        FrameQueue::new(capacity, keep_last, Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn empty_queue_has_nothing_readable() {
        let q = queue(4, true);
        assert_eq!(q.remaining(), 0);
        assert!(q.current_info().is_none());
        assert!(q.next_info().is_none());
    }

    #[test]
    fn keep_last_first_advance_marks_shown() {
        let q = queue(4, true);
        assert!(q.push(frame(0.0, 1)));
        assert_eq!(q.remaining(), 1);

        // First advance transitions shown 0 -> 1 without freeing.
        q.advance_read();
        assert_eq!(q.remaining(), 0);
        assert!(q.has_shown_frame());
        assert_eq!(q.last_info().unwrap().pts, 0.0);

        assert!(q.push(frame(0.04, 1)));
        assert_eq!(q.current_info().unwrap().pts, 0.04);
        // Second advance frees the 0.0 frame and keeps 0.04 as last.
        q.advance_read();
        assert_eq!(q.last_info().unwrap().pts, 0.04);
    }

    #[test]
    fn peek_last_is_current_shifted_by_one_advance() {
        let q = queue(4, true);
        let pts_values = [0.0, 0.04, 0.08, 0.12];
        let mut current_seen = Vec::new();
        let mut last_seen = Vec::new();

        for &pts in pts_values.iter() {
            assert!(q.push(frame(pts, 1)));
            current_seen.push(q.current_info().unwrap().pts);
            q.advance_read();
            last_seen.push(q.last_info().unwrap().pts);
        }

        // The last-sequence is the current-sequence: each displayed frame
        // becomes the kept frame after its advance.
        assert_eq!(current_seen, last_seen);
    }

    #[test]
    fn without_keep_last_advance_frees_immediately() {
        let q = queue(4, false);
        assert!(q.push(frame(1.0, 1)));
        assert_eq!(q.remaining(), 1);
        q.advance_read();
        assert_eq!(q.remaining(), 0);
        assert!(q.current_info().is_none());
    }

    #[test]
    fn count_never_exceeds_capacity() {
        let q = Arc::new(queue(3, true));
        let producer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                for i in 0..20 {
                    assert!(q.push(frame(i as f64 * 0.04, 1)));
                }
            })
        };
        let mut consumed = 0;
        while consumed < 20 {
            if q.wait_readable(Duration::from_millis(100)) {
                assert!(q.remaining() <= 3);
                q.advance_read();
                consumed += 1;
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn stop_flag_unblocks_producer() {
        let stop = Arc::new(AtomicBool::new(false));
        let q = Arc::new(FrameQueue::new(2, true, Arc::clone(&stop)));
        for i in 0..2 {
            assert!(q.push(frame(i as f64, 1)));
        }
        let blocked = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || q.push(frame(9.0, 1)))
        };
        std::thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::Release);
        q.wake_all();
        assert!(!blocked.join().unwrap());
    }

    #[test]
    fn next_info_requires_two_readable() {
        let q = queue(4, true);
        q.push(frame(0.0, 1));
        assert!(q.next_info().is_none());
        q.push(frame(0.04, 1));
        assert_eq!(q.next_info().unwrap().pts, 0.04);
    }
}
