//! The packet reader thread: sole producer of compressed packets.
//!
//! One loop iteration handles, in order: stop, pause transitions, a pending
//! seek, backpressure, loop/auto-exit, and finally one packet read + route.
//! Seeks are *published* by the player (any thread) and *enacted* here, so
//! the demuxer is only ever touched from this thread.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::decoder::StreamShared;
use crate::facade::{Demuxer, ReadOutcome, SeekFlags, StreamInfo, ts_to_seconds};
use crate::packet::DrainNotify;
use crate::player::Shared;
use crate::settings::LoopMode;

/// Aggregate byte budget across both packet queues before the reader
/// throttles.
pub const MAX_QUEUE_SIZE: usize = 16 * 1024 * 1024;

/// A queue with more packets than this (and over a second of buffered
/// duration) counts as full for the backpressure heuristic.
pub const MIN_PACKET_COUNT: usize = 25;

const READER_WAIT: Duration = Duration::from_millis(10);

/// Seek request published by the player, observed by the reader.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SeekRequest {
    pub pending: bool,
    /// Absolute target in microseconds, or bytes for byte seeks.
    pub target: i64,
    /// Relative distance of the request; decides search direction and the
    /// min/max window.
    pub rel: i64,
    pub by_bytes: bool,
}

/// True when `queue` holds enough of `stream` that reading more would only
/// burn memory.
fn stream_has_enough_packets(stream: Option<&StreamShared>) -> bool {
    let Some(stream) = stream else {
        return true;
    };
    if stream.info.attached_pic {
        return true;
    }
    let queue = &stream.packets;
    if queue.len() <= MIN_PACKET_COUNT {
        return false;
    }
    let duration = queue.duration();
    duration == 0 || ts_to_seconds(duration, stream.info.time_base) > 1.0
}

struct ReaderWorker {
    demuxer: Box<dyn Demuxer>,
    shared: Arc<Shared>,
    video: Option<StreamShared>,
    audio: Option<StreamShared>,
    wake: Arc<DrainNotify>,
    last_paused: bool,
    loops_left: LoopMode,
}

impl ReaderWorker {
    fn streams(&self) -> impl Iterator<Item = &StreamShared> {
        self.video.iter().chain(self.audio.iter())
    }

    fn handle_pause_transition(&mut self) {
        let paused = self.shared.is_paused();
        if paused == self.last_paused {
            return;
        }
        self.last_paused = paused;
        let result = if paused {
            self.demuxer.pause()
        } else {
            self.demuxer.play()
        };
        if let Err(err) = result {
            tracing::warn!("demuxer pause/play failed: {err}");
        }
    }

    /// Enacts a pending seek: façade seek, queue flush + flush packets,
    /// decoder wake, external clock reset.
    fn handle_seek(&mut self) {
        let request = {
            let mut seek = self.shared.seek.lock();
            if !seek.pending {
                return;
            }
            let taken = *seek;
            seek.pending = false;
            taken
        };

        let target = request.target;
        // Offset the window past the request origin so a backward seek can
        // not land on the frame we started from.
        let min = if request.rel > 0 { target - request.rel + 2 } else { i64::MIN };
        let max = if request.rel < 0 { target - request.rel - 2 } else { i64::MAX };
        let flags = SeekFlags {
            any: true,
            by_bytes: request.by_bytes,
            backward: request.rel < 0,
        };
        tracing::debug!(
            "seek to {} (window {min}..{max}, by_bytes={})",
            target,
            request.by_bytes
        );

        match self.demuxer.seek(min, target, max, flags) {
            Err(err) => {
                // Seek failures leave playback state untouched.
                tracing::warn!("seek failed: {err}");
            }
            Ok(()) => {
                for stream in self.video.iter().chain(self.audio.iter()) {
                    stream.packets.flush();
                    stream.packets.push_flush();
                    stream.eof.store(false, Ordering::Release);
                }
                if request.by_bytes {
                    self.shared.external_clock.set(f64::NAN, 0);
                } else {
                    self.shared
                        .external_clock
                        .set(target as f64 / 1_000_000.0, 0);
                }
            }
        }

        self.shared.reader_eof.store(false, Ordering::Release);
        if self.shared.is_paused() {
            // Show the post-seek position: run exactly one frame.
            self.shared.request_step();
        }
    }

    fn over_budget(&self) -> bool {
        if self.shared.infinite_buffer {
            return false;
        }
        let total: usize = self.streams().map(|s| s.packets.size()).sum();
        if total > MAX_QUEUE_SIZE {
            return true;
        }
        stream_has_enough_packets(self.video.as_ref())
            && stream_has_enough_packets(self.audio.as_ref())
    }

    /// True when every decoded stream has drained the current serial.
    fn playback_drained(&self) -> bool {
        if self.shared.is_paused() {
            return false;
        }
        self.streams().all(|s| s.is_drained())
    }

    fn route_packet(&mut self) -> RouteResult {
        let packet = match self.demuxer.read_packet() {
            Ok(ReadOutcome::Packet(packet)) => packet,
            Ok(ReadOutcome::EndOfFile) => {
                if !self.shared.reader_eof.load(Ordering::Acquire) {
                    for stream in self.streams() {
                        stream.packets.push_null(stream.info.index);
                    }
                    self.shared.reader_eof.store(true, Ordering::Release);
                }
                return RouteResult::Eof;
            }
            Err(err) => {
                tracing::error!("read_packet failed: {err}");
                self.shared.set_error(crate::error::PlayerError::Io(err.to_string()));
                return RouteResult::Fatal;
            }
        };
        self.shared.stats.add_packet_read();

        let in_play_range = match self.shared.settings.play_duration {
            None => true,
            Some(limit) => {
                let info = self.stream_info(packet.stream_index);
                match (info, packet.timestamp()) {
                    (Some(info), Some(ts)) => {
                        let start = info.start_time.unwrap_or(0);
                        ts_to_seconds(ts - start, info.time_base) <= limit
                    }
                    _ => true,
                }
            }
        };

        let routed = if !in_play_range {
            false
        } else if let Some(video) = self
            .video
            .as_ref()
            .filter(|s| s.info.index == packet.stream_index)
        {
            video.packets.push_data(packet);
            true
        } else if let Some(audio) = self
            .audio
            .as_ref()
            .filter(|s| s.info.index == packet.stream_index)
        {
            audio.packets.push_data(packet);
            true
        } else {
            false
        };
        if !routed {
            tracing::trace!("discarded packet outside selected streams/range");
        }
        RouteResult::Routed
    }

    fn stream_info(&self, index: usize) -> Option<&StreamInfo> {
        self.streams()
            .map(|s| &s.info)
            .find(|info| info.index == index)
    }

    fn run(mut self) {
        tracing::debug!("reader thread started");
        let mut skip_wait = true;
        loop {
            if !skip_wait {
                self.wake.wait(READER_WAIT);
            }
            skip_wait = false;

            if self.shared.reader_stop.load(Ordering::Acquire) {
                break;
            }

            self.handle_pause_transition();
            self.handle_seek();

            if self.over_budget() {
                // Throttle until a decoder drains something.
                self.wake.wait(READER_WAIT);
                skip_wait = true;
                continue;
            }

            if self.playback_drained() {
                match self.loops_left {
                    LoopMode::Infinite => {
                        self.shared.request_seek(0, 0, false);
                        continue;
                    }
                    LoopMode::Count(n) if n > 0 => {
                        self.loops_left = LoopMode::Count(n - 1);
                        self.shared.request_seek(0, 0, false);
                        continue;
                    }
                    _ => {
                        if self.shared.settings.auto_exit {
                            tracing::info!("playback drained, reader exiting");
                            self.shared.playback_finished.store(true, Ordering::Release);
                            break;
                        }
                    }
                }
            }

            match self.route_packet() {
                RouteResult::Routed => skip_wait = true,
                RouteResult::Eof => {
                    self.wake.wait(READER_WAIT);
                    skip_wait = true;
                }
                RouteResult::Fatal => break,
            }
        }
        tracing::debug!("reader thread stopped");
    }
}

enum RouteResult {
    Routed,
    Eof,
    Fatal,
}

/// Owning handle for the reader thread.
pub(crate) struct ReaderHandle {
    shared: Arc<Shared>,
    wake: Arc<DrainNotify>,
    thread: Option<JoinHandle<()>>,
}

impl ReaderHandle {
    pub fn spawn(
        demuxer: Box<dyn Demuxer>,
        shared: Arc<Shared>,
        video: Option<StreamShared>,
        audio: Option<StreamShared>,
        wake: Arc<DrainNotify>,
    ) -> Self {
        let worker = ReaderWorker {
            demuxer,
            shared: Arc::clone(&shared),
            video,
            audio,
            wake: Arc::clone(&wake),
            last_paused: false,
            loops_left: shared.settings.loop_mode,
        };
        let thread = std::thread::Builder::new()
            .name("vivace-reader".into())
            .spawn(move || worker.run())
            .expect("spawn reader thread");
        Self { shared, wake, thread: Some(thread) }
    }

    pub fn stop(&mut self) {
        self.shared.reader_stop.store(true, Ordering::Release);
        self.wake.notify();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
