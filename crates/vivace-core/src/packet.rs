//! Serial-stamped packet queue between the reader and a decoder.
//!
//! Each decoder owns one [`PacketQueue`] as its inbox. The reader pushes data
//! packets; two sentinels circulate alongside them:
//!
//! - a *null* packet signals stream EOF, putting the codec into drain mode
//! - a *flush* packet marks a serial boundary: pushing one bumps the queue's
//!   serial, and a decoder popping one resets its codec state
//!
//! Every packet is stamped with the serial current at push time, so a
//! consumer can tell pre-seek leftovers from post-seek data without any extra
//! coordination.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::facade::DemuxedPacket;

/// Monotonic queue generation counter, bumped by every flush packet.
pub type Serial = i32;

/// Per-entry bookkeeping overhead counted into the queue byte size, the
/// list-node share of the memory budget.
const ENTRY_OVERHEAD: usize = std::mem::size_of::<PacketEntry>();

/// A packet as it travels through the queue.
#[derive(Debug)]
pub enum QueuedPacket {
    /// A real compressed payload.
    Data(DemuxedPacket),
    /// Stream EOF marker for `stream_index`; the decoder drains its codec.
    Null { stream_index: usize },
    /// Serial boundary; the decoder resets its codec state.
    Flush,
}

impl QueuedPacket {
    fn payload_size(&self) -> usize {
        match self {
            QueuedPacket::Data(pkt) => pkt.payload.size(),
            _ => 0,
        }
    }

    fn duration(&self) -> i64 {
        match self {
            QueuedPacket::Data(pkt) => pkt.duration,
            _ => 0,
        }
    }
}

#[derive(Debug)]
pub struct PacketEntry {
    pub packet: QueuedPacket,
    pub serial: Serial,
}

struct QueueState {
    entries: VecDeque<PacketEntry>,
}

/// Wakes the reader when any decoder drains packets; shared across both
/// queues so one wait covers them.
pub struct DrainNotify {
    lock: Mutex<()>,
    cond: Condvar,
}

impl DrainNotify {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { lock: Mutex::new(()), cond: Condvar::new() })
    }

    pub fn notify(&self) {
        self.cond.notify_all();
    }

    /// Blocks up to `timeout` for a drain event.
    pub fn wait(&self, timeout: Duration) {
        let mut guard = self.lock.lock();
        self.cond.wait_for(&mut guard, timeout);
    }
}

impl Default for DrainNotify {
    fn default() -> Self {
        Self { lock: Mutex::new(()), cond: Condvar::new() }
    }
}

/// Bounded-by-budget FIFO of compressed packets with serial stamping.
///
/// One producer (the reader) and one consumer (the owning decoder); all
/// mutations happen under the internal lock. Aggregate counters are atomics
/// so the reader's backpressure check can read them lock-free; they are only
/// authoritative under the lock.
pub struct PacketQueue {
    state: Mutex<QueueState>,
    /// Raised on every push.
    added: Condvar,
    /// Raised whenever packets leave the queue; the reader throttles on it.
    drain: Arc<DrainNotify>,
    /// Current serial; bumped by flush pushes, shared with the stream clock.
    serial: Arc<AtomicI32>,
    /// Sum of payload bytes plus entry overhead.
    size: AtomicUsize,
    /// Sum of packet durations, in stream time-base units.
    duration: AtomicI64,
    packet_count: AtomicUsize,
    /// Unblocks any waiter; set at shutdown.
    aborted: AtomicBool,
}

impl PacketQueue {
    pub fn new(drain: Arc<DrainNotify>) -> Self {
        Self {
            state: Mutex::new(QueueState { entries: VecDeque::new() }),
            added: Condvar::new(),
            drain,
            serial: Arc::new(AtomicI32::new(0)),
            size: AtomicUsize::new(0),
            duration: AtomicI64::new(0),
            packet_count: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
        }
    }

    /// Pushes the initial flush packet so the consumer goes through its reset
    /// path before the first data packet.
    pub fn start(&self) {
        self.push(QueuedPacket::Flush);
    }

    /// Appends a packet, stamping it with the current serial. A flush packet
    /// increments the serial *before* being stamped, making it the first
    /// packet of the new generation.
    pub fn push(&self, packet: QueuedPacket) {
        let mut state = self.state.lock();
        let serial = if matches!(packet, QueuedPacket::Flush) {
            self.serial.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            self.serial.load(Ordering::Acquire)
        };
        self.size
            .fetch_add(packet.payload_size() + ENTRY_OVERHEAD, Ordering::AcqRel);
        self.duration.fetch_add(packet.duration(), Ordering::AcqRel);
        self.packet_count.fetch_add(1, Ordering::AcqRel);
        state.entries.push_back(PacketEntry { packet, serial });
        drop(state);
        self.added.notify_one();
    }

    /// Pushes a data packet.
    pub fn push_data(&self, packet: DemuxedPacket) {
        self.push(QueuedPacket::Data(packet));
    }

    /// Pushes the EOF sentinel for `stream_index`.
    pub fn push_null(&self, stream_index: usize) {
        self.push(QueuedPacket::Null { stream_index });
    }

    /// Pushes a flush packet, advancing the serial.
    pub fn push_flush(&self) {
        self.push(QueuedPacket::Flush);
    }

    /// Detaches the head packet without blocking.
    pub fn try_pop(&self) -> Option<PacketEntry> {
        let mut state = self.state.lock();
        let entry = state.entries.pop_front()?;
        self.account_removed(&entry);
        drop(state);
        self.drain.notify();
        Some(entry)
    }

    /// Detaches the head packet, blocking until one arrives, the timeout
    /// elapses, or the queue is aborted.
    pub fn pop_wait(&self, timeout: Duration) -> Option<PacketEntry> {
        let mut state = self.state.lock();
        if state.entries.is_empty() && !self.aborted.load(Ordering::Acquire) {
            self.added.wait_for(&mut state, timeout);
        }
        let entry = state.entries.pop_front()?;
        self.account_removed(&entry);
        drop(state);
        self.drain.notify();
        Some(entry)
    }

    fn account_removed(&self, entry: &PacketEntry) {
        self.size
            .fetch_sub(entry.packet.payload_size() + ENTRY_OVERHEAD, Ordering::AcqRel);
        self.duration
            .fetch_sub(entry.packet.duration(), Ordering::AcqRel);
        self.packet_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Drops every queued packet. The serial is left untouched; only flush
    /// *pushes* move it.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        self.size.store(0, Ordering::Release);
        self.duration.store(0, Ordering::Release);
        self.packet_count.store(0, Ordering::Release);
        drop(state);
        self.drain.notify();
    }

    /// Unblocks all waiters permanently; part of the shutdown protocol.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.added.notify_all();
        self.drain.notify();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Current serial. Lock-free; authoritative only under the lock.
    pub fn serial(&self) -> Serial {
        self.serial.load(Ordering::Acquire)
    }

    /// Shared handle on the serial counter, for clocks watching this queue.
    pub fn serial_ref(&self) -> Arc<AtomicI32> {
        Arc::clone(&self.serial)
    }

    /// Total byte size (payloads plus node overhead). Lock-free.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Total queued duration in stream time-base units. Lock-free.
    pub fn duration(&self) -> i64 {
        self.duration.load(Ordering::Acquire)
    }

    /// Number of queued packets. Lock-free.
    pub fn len(&self) -> usize {
        self.packet_count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::PacketPayload;

    fn data_packet(stream_index: usize, size: usize, duration: i64) -> DemuxedPacket {
        DemuxedPacket {
            stream_index,
            pts: Some(0),
            dts: Some(0),
            duration,
            pos: None,
            payload: PacketPayload::Bytes(vec![0u8; size]),
        }
    }

    fn new_queue() -> PacketQueue {
        PacketQueue::new(DrainNotify::new())
    }

    #[test]
    fn push_pop_conserves_size() {
        let queue = new_queue();
        assert_eq!(queue.size(), 0);

        queue.push_data(data_packet(0, 100, 40));
        queue.push_data(data_packet(0, 200, 40));
        let expected = 300 + 2 * ENTRY_OVERHEAD;
        assert_eq!(queue.size(), expected);
        assert_eq!(queue.duration(), 80);
        assert_eq!(queue.len(), 2);

        let first = queue.try_pop().unwrap();
        assert!(matches!(first.packet, QueuedPacket::Data(_)));
        assert_eq!(queue.size(), 200 + ENTRY_OVERHEAD);

        queue.try_pop().unwrap();
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.duration(), 0);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn serial_increments_only_on_flush() {
        let queue = new_queue();
        assert_eq!(queue.serial(), 0);

        queue.push_data(data_packet(0, 10, 1));
        queue.push_null(0);
        assert_eq!(queue.serial(), 0);

        queue.push_flush();
        assert_eq!(queue.serial(), 1);
        queue.push_flush();
        assert_eq!(queue.serial(), 2);
    }

    #[test]
    fn packets_stamped_with_push_time_serial() {
        let queue = new_queue();
        queue.push_data(data_packet(0, 10, 1));
        queue.push_flush();
        queue.push_data(data_packet(0, 10, 1));

        let old = queue.try_pop().unwrap();
        assert_eq!(old.serial, 0);
        let flush = queue.try_pop().unwrap();
        assert!(matches!(flush.packet, QueuedPacket::Flush));
        assert_eq!(flush.serial, 1);
        let fresh = queue.try_pop().unwrap();
        assert_eq!(fresh.serial, 1);
    }

    #[test]
    fn flush_clears_packets_but_not_serial() {
        let queue = new_queue();
        queue.push_flush();
        queue.push_data(data_packet(0, 64, 20));
        queue.push_data(data_packet(0, 64, 20));
        assert_eq!(queue.serial(), 1);

        queue.flush();
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.duration(), 0);
        assert_eq!(queue.serial(), 1);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn start_pushes_flush() {
        let queue = new_queue();
        queue.start();
        assert_eq!(queue.serial(), 1);
        let entry = queue.try_pop().unwrap();
        assert!(matches!(entry.packet, QueuedPacket::Flush));
    }

    #[test]
    fn pop_wait_times_out_empty() {
        let queue = new_queue();
        assert!(queue.pop_wait(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn abort_unblocks_waiter() {
        let queue = Arc::new(new_queue());
        let waiter = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.pop_wait(Duration::from_secs(30)))
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.abort();
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn cross_thread_ordering_preserved() {
        let queue = Arc::new(new_queue());
        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                for i in 0..100i64 {
                    queue.push_data(DemuxedPacket {
                        stream_index: 0,
                        pts: Some(i),
                        dts: Some(i),
                        duration: 1,
                        pos: None,
                        payload: PacketPayload::Bytes(vec![0u8; 8]),
                    });
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 100 {
            if let Some(entry) = queue.pop_wait(Duration::from_millis(100)) {
                if let QueuedPacket::Data(pkt) = entry.packet {
                    seen.push(pkt.pts.unwrap());
                }
            }
        }
        producer.join().unwrap();
        let expected: Vec<i64> = (0..100).collect();
        assert_eq!(seen, expected);
    }
}
