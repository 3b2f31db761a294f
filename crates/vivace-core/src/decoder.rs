//! Decode workers: one thread per decoded stream.
//!
//! A worker pulls packets from its [`PacketQueue`], feeds the codec through
//! the façade's send/receive protocol, and moves finished frames into its
//! [`FrameQueue`]. Serials rule everything here:
//!
//! - packets whose serial no longer matches the queue's are dropped unopened
//! - a flush packet resets codec state and the predicted-PTS chain
//! - `finished_serial` records the serial whose packets were fully drained at
//!   codec EOF, which is what the reader's loop/auto-exit check reads
//!
//! Video workers additionally drop frames that decode already behind the
//! master clock (early drop), before they ever occupy a ring slot.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::clock::NOSYNC_THRESHOLD;
use crate::facade::{
    rescale_ts, ts_to_seconds, DecodedFrame, Rational, ReceiveStatus, SendStatus, StreamDecoder,
    StreamInfo, StreamKind,
};
use crate::frame_queue::{Frame, FrameQueue};
use crate::packet::{PacketEntry, PacketQueue, QueuedPacket, Serial};
use crate::player::Shared;
use crate::settings::ReorderPts;

/// How long a worker sleeps when it has nothing to do (stream EOF, empty
/// packet queue).
const IDLE_WAIT: Duration = Duration::from_millis(10);

enum DecodeOutcome {
    Frame(DecodedFrame),
    /// The packet queue ran dry.
    MorePackets,
    /// The codec drained after EOF.
    EndOfStream,
    Stopped,
    Failed,
}

/// Shared handles for one decoded stream, wired between the reader, the
/// worker, and the consumers.
#[derive(Clone)]
pub(crate) struct StreamShared {
    pub info: StreamInfo,
    pub packets: Arc<PacketQueue>,
    pub frames: Arc<FrameQueue>,
    /// Worker stop flag; also owned by the frame queue for its waits.
    pub stop: Arc<AtomicBool>,
    /// Stream EOF: the codec drained and no packets remain. Cleared by the
    /// reader when a seek restarts the stream.
    pub eof: Arc<AtomicBool>,
    /// Serial whose packets were fully drained at codec EOF.
    pub finished_serial: Arc<AtomicI32>,
}

impl StreamShared {
    pub fn new(info: StreamInfo, packets: Arc<PacketQueue>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let capacity = match info.kind {
            StreamKind::Video => crate::frame_queue::VIDEO_FRAME_QUEUE_CAPACITY,
            StreamKind::Audio => crate::frame_queue::AUDIO_FRAME_QUEUE_CAPACITY,
        };
        let frames = Arc::new(FrameQueue::new(capacity, true, Arc::clone(&stop)));
        Self {
            info,
            packets,
            frames,
            stop,
            eof: Arc::new(AtomicBool::new(false)),
            finished_serial: Arc::new(AtomicI32::new(0)),
        }
    }

    /// True when every packet of the current serial has been decoded and
    /// consumed (the reader's drain condition).
    pub fn is_drained(&self) -> bool {
        self.finished_serial.load(Ordering::Acquire) == self.packets.serial()
            && self.frames.remaining() == 0
    }
}

struct DecodeWorker {
    decoder: Box<dyn StreamDecoder>,
    stream: StreamShared,
    shared: Arc<Shared>,
    pkt_serial: Serial,
    /// Packet retained after the codec reported try-again.
    pending: Option<PacketEntry>,
    /// Predicted PTS for audio frames that arrive without one.
    next_pts: Option<i64>,
    next_pts_tb: Rational,
    start_pts: Option<i64>,
    start_pts_tb: Rational,
    /// Seconds per frame at the container-reported rate; video only.
    nominal_frame_duration: f64,
}

impl DecodeWorker {
    fn stopped(&self) -> bool {
        self.stream.stop.load(Ordering::Acquire)
    }

    /// One pass of the send/receive protocol: drain ready frames first,
    /// then feed the next packet whose serial is still current.
    fn decode_one(&mut self) -> DecodeOutcome {
        loop {
            if self.stopped() {
                return DecodeOutcome::Stopped;
            }

            // Receive phase: only meaningful while our serial is current.
            if self.stream.packets.serial() == self.pkt_serial {
                loop {
                    if self.stopped() {
                        return DecodeOutcome::Stopped;
                    }
                    match self.decoder.receive_frame() {
                        Ok(ReceiveStatus::Frame(frame)) => {
                            return DecodeOutcome::Frame(self.rewrite_pts(frame));
                        }
                        Ok(ReceiveStatus::EndOfStream) => {
                            self.stream
                                .finished_serial
                                .store(self.pkt_serial, Ordering::Release);
                            self.decoder.flush();
                            return DecodeOutcome::EndOfStream;
                        }
                        Ok(ReceiveStatus::NeedsInput) => break,
                        Err(err) => {
                            tracing::error!("receive_frame failed: {err}");
                            return DecodeOutcome::Failed;
                        }
                    }
                }
            }

            // Fetch phase: pending packet first, then the queue, skipping
            // anything from a stale serial.
            let entry = loop {
                let entry = match self.pending.take() {
                    Some(entry) => entry,
                    None => match self.stream.packets.pop_wait(IDLE_WAIT) {
                        Some(entry) => entry,
                        None => return DecodeOutcome::MorePackets,
                    },
                };
                if entry.serial == self.stream.packets.serial() {
                    break entry;
                }
                tracing::trace!(
                    "dropping stale packet (serial {} != {})",
                    entry.serial,
                    self.stream.packets.serial()
                );
            };

            self.pkt_serial = entry.serial;
            match entry.packet {
                QueuedPacket::Flush => {
                    self.decoder.flush();
                    self.stream.finished_serial.store(0, Ordering::Release);
                    self.next_pts = self.start_pts;
                    self.next_pts_tb = self.start_pts_tb;
                }
                QueuedPacket::Null { .. } => {
                    if let Err(err) = self.decoder.send_eof() {
                        tracing::warn!("send_eof failed: {err}");
                    }
                }
                QueuedPacket::Data(packet) => match self.decoder.send_packet(&packet) {
                    Ok(SendStatus::Accepted) => {}
                    Ok(SendStatus::TryAgain) => {
                        self.pending = Some(PacketEntry {
                            packet: QueuedPacket::Data(packet),
                            serial: entry.serial,
                        });
                    }
                    Err(err) => {
                        tracing::error!("send_packet failed: {err}");
                        return DecodeOutcome::Failed;
                    }
                },
            }
        }
    }

    /// Applies the PTS policy: reorder handling for video, time-base rebase
    /// plus prediction for audio.
    fn rewrite_pts(&mut self, mut frame: DecodedFrame) -> DecodedFrame {
        match &mut frame {
            DecodedFrame::Video(video) => {
                video.pts = match self.shared.settings.reorder_pts {
                    ReorderPts::Auto => video.best_effort_pts,
                    ReorderPts::On => video.pts,
                    ReorderPts::Off => video.pkt_dts,
                };
            }
            DecodedFrame::Audio(audio) => {
                let sample_tb = Rational::new(1, audio.sample_rate as i32);
                let pts = match audio.pts {
                    Some(pts) => Some(rescale_ts(pts, self.stream.info.time_base, sample_tb)),
                    None => self
                        .next_pts
                        .map(|next| rescale_ts(next, self.next_pts_tb, sample_tb)),
                };
                audio.pts = pts;
                if let Some(pts) = pts {
                    self.next_pts = Some(pts + audio.nb_samples as i64);
                    self.next_pts_tb = sample_tb;
                }
            }
        }
        frame
    }

    /// Early drop check for a decoded video frame. True means discard.
    fn should_drop_early(&self, frame: &DecodedFrame) -> bool {
        let DecodedFrame::Video(video) = frame else {
            return false;
        };
        let master_is_video = self.shared.master_is_video();
        if !self.shared.settings.allows_frame_drop(master_is_video) {
            return false;
        }
        let Some(pts) = video.pts else {
            return false;
        };
        let dpts = ts_to_seconds(pts, self.stream.info.time_base);
        let diff = dpts - self.shared.master_clock();
        !diff.is_nan()
            && diff.abs() < NOSYNC_THRESHOLD
            && diff < 0.0
            && self.pkt_serial == self.shared.video_clock.serial()
            && !self.stream.packets.is_empty()
    }

    /// Wraps a decoded frame with presentation metadata and queues it.
    /// Returns false when the stop flag interrupted the hand-off.
    fn queue_frame(&self, frame: DecodedFrame) -> bool {
        let (pts, duration, pos, width, height, sar) = match &frame {
            DecodedFrame::Video(video) => (
                video
                    .pts
                    .map(|pts| ts_to_seconds(pts, self.stream.info.time_base))
                    .unwrap_or(f64::NAN),
                self.nominal_frame_duration,
                video.pos,
                video.width,
                video.height,
                video.sar,
            ),
            DecodedFrame::Audio(audio) => (
                audio
                    .pts
                    .map(|pts| pts as f64 / audio.sample_rate as f64)
                    .unwrap_or(f64::NAN),
                audio.nb_samples as f64 / audio.sample_rate as f64,
                None,
                0,
                0,
                Rational::new(0, 1),
            ),
        };
        self.stream.frames.push(Frame {
            payload: frame,
            pts,
            duration,
            pos,
            serial: self.pkt_serial,
            width,
            height,
            sar,
            uploaded: false,
        })
    }

    fn run(mut self) {
        let kind = self.stream.info.kind;
        tracing::debug!("{kind:?} decoder thread started");
        loop {
            if self.stopped() {
                break;
            }
            if self.stream.eof.load(Ordering::Acquire) {
                // Drained; the reader clears this on seek/loop.
                std::thread::sleep(IDLE_WAIT);
                continue;
            }
            match self.decode_one() {
                DecodeOutcome::Frame(frame) => {
                    if self.should_drop_early(&frame) {
                        self.shared.stats.add_frame_drop_early();
                        tracing::trace!(
                            "early frame drop ({}/{} total)",
                            self.shared.stats.frame_drops_early(),
                            self.shared.stats.frame_drops_late()
                        );
                        continue;
                    }
                    if !self.queue_frame(frame) {
                        break;
                    }
                }
                DecodeOutcome::EndOfStream => {
                    self.stream.eof.store(true, Ordering::Release);
                }
                DecodeOutcome::MorePackets => {
                    // Reader at EOF and nothing queued: this stream is done.
                    if self.shared.reader_eof.load(Ordering::Acquire)
                        && self.stream.packets.is_empty()
                    {
                        self.stream.eof.store(true, Ordering::Release);
                    }
                }
                DecodeOutcome::Stopped | DecodeOutcome::Failed => break,
            }
        }
        tracing::debug!("{kind:?} decoder thread stopped");
    }
}

/// Owning handle for one decode worker thread.
pub(crate) struct DecoderHandle {
    stream: StreamShared,
    thread: Option<JoinHandle<()>>,
}

impl DecoderHandle {
    /// Starts the worker: pushes the initial flush packet, then spawns the
    /// thread.
    pub fn spawn(
        decoder: Box<dyn StreamDecoder>,
        stream: StreamShared,
        shared: Arc<Shared>,
        start_pts: Option<i64>,
    ) -> Self {
        stream.packets.start();

        let nominal_frame_duration = {
            let rate = stream.info.avg_frame_rate;
            if rate.num != 0 && rate.den != 0 {
                rate.invert().as_f64()
            } else {
                0.0
            }
        };
        let worker = DecodeWorker {
            decoder,
            stream: stream.clone(),
            shared,
            pkt_serial: -1,
            pending: None,
            next_pts: start_pts,
            next_pts_tb: stream.info.time_base,
            start_pts,
            start_pts_tb: stream.info.time_base,
            nominal_frame_duration,
        };
        let name = format!("vivace-{:?}-decode", stream.info.kind).to_lowercase();
        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || worker.run())
            .expect("spawn decoder thread");
        Self { stream, thread: Some(thread) }
    }

    /// Stop protocol: raise the flag, wake every wait, join.
    pub fn stop(&mut self) {
        self.stream.stop.store(true, Ordering::Release);
        self.stream.packets.abort();
        self.stream.frames.wake_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.stream.packets.flush();
    }
}

impl Drop for DecoderHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
