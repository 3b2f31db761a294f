//! The player: stream selection, thread lifecycle, master clock, and the
//! control surface the host drives.
//!
//! A [`Player`] is created once per media source. Opening wires up the
//! packet/frame queues and the three clocks, spawns the reader and decoder
//! threads, and hands the caller an [`AudioCallback`] to mount on the audio
//! device. The main thread then drives [`Player::refresh`] at the baseline
//! cadence and forwards UI events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::audio::{AudioCallback, AudioSpec};
use crate::clock::{now_seconds, Clock, SyncSource};
use crate::decoder::{DecoderHandle, StreamShared};
use crate::error::PlayerError;
use crate::facade::{ContainerFlags, ContainerInfo, MediaSource, Resampler, StreamKind};
use crate::packet::{DrainNotify, PacketQueue};
use crate::reader::{ReaderHandle, SeekRequest};
use crate::renderer::Renderer;
use crate::scheduler::{VideoScheduler, REFRESH_RATE};
use crate::settings::Settings;
use crate::stats::{PlaybackSnapshot, PlaybackStats};

/// Arrow-key seek distance in seconds.
pub const SEEK_STEP_SECONDS: f64 = 5.0;

/// Bytes-per-second guess used to turn a relative seek into a byte offset
/// when the container only supports byte seeking.
const BYTE_SEEK_RATE: f64 = 180_000.0;

/// Host events the engine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiEvent {
    /// Space: pause/resume.
    TogglePause,
    /// F: fullscreen flag (the host applies it; the engine tracks state).
    ToggleFullscreen,
    /// Left arrow: seek back.
    SeekBackward,
    /// Right arrow: seek forward.
    SeekForward,
    /// Window resize; updates the viewport and forces a redraw.
    Resized { width: u32, height: u32 },
}

/// OSD values frozen at the moment of pausing.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PauseBook {
    pub clock: f64,
    pub frames: i64,
}

/// State shared between the player, the reader, the decode workers, the
/// refresh scheduler, and the audio callback.
pub(crate) struct Shared {
    pub settings: Settings,
    pub stats: PlaybackStats,
    pub media_name: String,
    pub video: Option<StreamShared>,
    pub audio: Option<StreamShared>,
    pub video_clock: Clock,
    pub audio_clock: Clock,
    pub external_clock: Clock,
    /// Container duration in seconds, if known.
    pub duration: Option<f64>,
    /// Master frame rate captured at open (video stream's, else audio's).
    pub master_frame_rate: f64,
    pub is_realtime: bool,
    pub infinite_buffer: bool,
    pub seek_by_bytes: bool,
    pub paused: AtomicBool,
    /// One frame is run while paused (seek-while-paused).
    pub step: AtomicBool,
    pub force_refresh: AtomicBool,
    pub reader_eof: AtomicBool,
    pub reader_stop: AtomicBool,
    /// Reader drained everything with looping off.
    pub playback_finished: AtomicBool,
    pub seek: Mutex<SeekRequest>,
    pub reader_wake: Arc<DrainNotify>,
    pub viewport: Mutex<(u32, u32)>,
    pub pause_book: Mutex<PauseBook>,
    pub error: Mutex<Option<PlayerError>>,
}

impl Shared {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Resolved master sync source, with the fallback chain: video master
    /// needs a video stream, audio master needs an audio stream.
    pub fn master_sync(&self) -> SyncSource {
        match self.settings.sync_source {
            SyncSource::Video if self.video.is_some() => SyncSource::Video,
            SyncSource::Video => SyncSource::Audio,
            SyncSource::Audio if self.audio.is_some() => SyncSource::Audio,
            SyncSource::Audio => SyncSource::External,
            SyncSource::External => SyncSource::External,
        }
    }

    pub fn master_is_video(&self) -> bool {
        self.master_sync() == SyncSource::Video
    }

    pub fn master_is_audio(&self) -> bool {
        self.master_sync() == SyncSource::Audio
    }

    pub fn master_is_external(&self) -> bool {
        self.master_sync() == SyncSource::External
    }

    /// Reads the master clock.
    pub fn master_clock(&self) -> f64 {
        match self.master_sync() {
            SyncSource::Video => self.video_clock.get(),
            SyncSource::Audio => self.audio_clock.get(),
            SyncSource::External => self.external_clock.get(),
        }
    }

    /// Publishes a seek for the reader to enact. A request already pending
    /// wins; this one is dropped.
    pub fn request_seek(&self, target: i64, rel: i64, by_bytes: bool) {
        {
            let mut seek = self.seek.lock();
            if seek.pending {
                return;
            }
            *seek = SeekRequest { pending: true, target, rel, by_bytes };
        }
        self.reader_wake.notify();
    }

    /// Resumes the clocks for a single stepped frame (seek while paused).
    pub fn request_step(&self) {
        if self.is_paused() {
            self.resume_clocks();
        }
        self.step.store(true, Ordering::Release);
    }

    pub fn step_requested(&self) -> bool {
        self.step.load(Ordering::Acquire)
    }

    pub fn consume_step(&self) -> bool {
        self.step.swap(false, Ordering::AcqRel)
    }

    /// Re-pause after a stepped frame has been displayed.
    pub fn pause_after_step(&self) {
        self.external_clock
            .set(self.external_clock.get(), self.external_clock.serial());
        self.set_all_paused(true);
        self.record_pause_book();
    }

    /// Unpauses the clocks, re-anchoring so no time is credited for the
    /// pause interval.
    fn resume_clocks(&self) {
        self.video_clock.set_paused(false);
        self.video_clock
            .set(self.video_clock.get(), self.video_clock.serial());
        self.external_clock
            .set(self.external_clock.get(), self.external_clock.serial());
        self.set_all_paused(false);
        self.reader_wake.notify();
    }

    fn set_all_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
        self.video_clock.set_paused(paused);
        self.audio_clock.set_paused(paused);
        self.external_clock.set_paused(paused);
    }

    /// Captures the OSD values shown while paused.
    fn record_pause_book(&self) {
        let rate = self.master_frame_rate.max(0.0);
        let mut clock = self.master_clock();
        if clock.is_nan() || clock < 0.0 {
            clock = 0.0;
        }
        let frames = if rate != 0.0 { (clock * rate) as i64 } else { 0 };
        *self.pause_book.lock() = PauseBook { clock, frames };
    }

    pub fn viewport(&self) -> (u32, u32) {
        *self.viewport.lock()
    }

    pub fn set_error(&self, error: PlayerError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub fn take_error(&self) -> Option<PlayerError> {
        self.error.lock().take()
    }
}

/// Audio device wiring handed to [`Player::open`]: the fixed output format
/// and a resampler that converts into it.
pub struct AudioWiring {
    pub spec: AudioSpec,
    pub resampler: Box<dyn Resampler>,
}

/// The playback engine for one media source.
pub struct Player {
    shared: Arc<Shared>,
    scheduler: VideoScheduler,
    reader: Option<ReaderHandle>,
    video_worker: Option<DecoderHandle>,
    audio_worker: Option<DecoderHandle>,
    /// Built at open; the host moves it onto the audio device.
    audio_callback: Option<AudioCallback>,
    container: ContainerInfo,
    fullscreen: bool,
}

/// Realtime predicate: container formats and URL schemes that deliver at
/// their own pace. HTTP is opt-in via [`Settings::realtime_http`].
fn is_realtime(container: &ContainerInfo, settings: &Settings) -> bool {
    if matches!(container.format_name.as_str(), "rtp" | "rtsp" | "sdp") {
        return true;
    }
    let url = container.url.as_str();
    if url.starts_with("rtp:") || url.starts_with("udp:") {
        return true;
    }
    settings.realtime_http && (url.starts_with("http:") || url.starts_with("https:"))
}

impl Player {
    /// Opens `source` and starts the pipeline threads.
    ///
    /// `audio` carries the device format and resampler; without it the audio
    /// stream is not decoded and the master clock falls back per the sync
    /// chain.
    pub fn open(
        source: MediaSource,
        audio: Option<AudioWiring>,
        settings: Settings,
    ) -> Result<Self, PlayerError> {
        let MediaSource { demuxer, video_decoder, audio_decoder } = source;
        let container = demuxer.container().clone();

        let reader_wake = DrainNotify::new();

        let video_stream = if settings.video_disabled {
            None
        } else {
            match (container.best_stream(StreamKind::Video), video_decoder) {
                (Some(info), Some(decoder)) => Some((info.clone(), decoder)),
                _ => None,
            }
        };
        let audio_stream = if settings.audio_disabled || audio.is_none() {
            None
        } else {
            match (container.best_stream(StreamKind::Audio), audio_decoder) {
                (Some(info), Some(decoder)) => Some((info.clone(), decoder)),
                _ => None,
            }
        };
        if video_stream.is_none() && audio_stream.is_none() {
            return Err(PlayerError::NoStreams);
        }

        let video_shared = video_stream.as_ref().map(|(info, _)| {
            StreamShared::new(info.clone(), Arc::new(PacketQueue::new(Arc::clone(&reader_wake))))
        });
        let audio_shared = audio_stream.as_ref().map(|(info, _)| {
            StreamShared::new(info.clone(), Arc::new(PacketQueue::new(Arc::clone(&reader_wake))))
        });

        // Each stream clock watches its packet queue's serial; the external
        // clock watches its own.
        let video_clock = match video_shared.as_ref() {
            Some(stream) => Clock::new(stream.packets.serial_ref()),
            None => Clock::self_referential(),
        };
        let audio_clock = match audio_shared.as_ref() {
            Some(stream) => Clock::new(stream.packets.serial_ref()),
            None => Clock::self_referential(),
        };
        let external_clock = Clock::self_referential();

        let master_frame_rate = video_shared
            .as_ref()
            .map(|s| s.info.avg_frame_rate)
            .filter(|r| r.den != 0 && r.num != 0)
            .or_else(|| {
                audio_shared
                    .as_ref()
                    .map(|s| s.info.avg_frame_rate)
                    .filter(|r| r.den != 0 && r.num != 0)
            })
            .map(|r| r.as_f64())
            .unwrap_or(0.0);

        let realtime = is_realtime(&container, &settings);
        // Timestamp-discontinuous containers get byte seeks and a tight cap
        // on plausible frame durations; ogg is the known exception.
        let ts_discont = container.flags.contains(ContainerFlags::TS_DISCONT);
        let seek_by_bytes = ts_discont && container.format_name != "ogg";
        let max_frame_duration = if ts_discont { 10.0 } else { 3600.0 };

        let media_name = container
            .url
            .rsplit('/')
            .next()
            .unwrap_or(container.url.as_str())
            .to_string();

        let shared = Arc::new(Shared {
            stats: PlaybackStats::new(),
            media_name,
            video: video_shared.clone(),
            audio: audio_shared.clone(),
            video_clock,
            audio_clock,
            external_clock,
            duration: container.duration,
            master_frame_rate,
            is_realtime: realtime,
            infinite_buffer: settings.infinite_buffer || realtime,
            seek_by_bytes,
            paused: AtomicBool::new(false),
            step: AtomicBool::new(false),
            force_refresh: AtomicBool::new(false),
            reader_eof: AtomicBool::new(false),
            reader_stop: AtomicBool::new(false),
            playback_finished: AtomicBool::new(false),
            seek: Mutex::new(SeekRequest::default()),
            reader_wake: Arc::clone(&reader_wake),
            viewport: Mutex::new((1280, 720)),
            pause_book: Mutex::new(PauseBook::default()),
            error: Mutex::new(None),
            settings,
        });

        if realtime {
            tracing::info!("realtime source detected: {}", container.url);
        }

        // Containers that cannot search need the audio PTS chain seeded from
        // the stream start.
        let audio_start_pts = audio_stream.as_ref().and_then(|(info, _)| {
            let unseekable = container.flags.contains(ContainerFlags::NO_BIN_SEARCH)
                || container.flags.contains(ContainerFlags::NO_GEN_SEARCH)
                || container.flags.contains(ContainerFlags::NO_BYTE_SEEK);
            if unseekable && !container.flags.contains(ContainerFlags::HAS_READ_SEEK) {
                info.start_time
            } else {
                None
            }
        });

        let video_worker = match (video_stream, video_shared.clone()) {
            (Some((_, decoder)), Some(stream)) => {
                Some(DecoderHandle::spawn(decoder, stream, Arc::clone(&shared), None))
            }
            _ => None,
        };
        let audio_worker = match (audio_stream, audio_shared.clone()) {
            (Some((_, decoder)), Some(stream)) => Some(DecoderHandle::spawn(
                decoder,
                stream,
                Arc::clone(&shared),
                audio_start_pts,
            )),
            _ => None,
        };

        let audio_callback = audio.map(|wiring| {
            AudioCallback::new(Arc::clone(&shared), wiring.spec, wiring.resampler)
        });
        let audio_callback = if audio_worker.is_some() { audio_callback } else { None };

        let reader = ReaderHandle::spawn(
            demuxer,
            Arc::clone(&shared),
            video_shared,
            audio_shared,
            reader_wake,
        );

        tracing::info!(
            "player open: {} (video={}, audio={}, duration={:?})",
            container.url,
            video_worker.is_some(),
            audio_worker.is_some(),
            container.duration,
        );

        Ok(Self {
            shared,
            scheduler: VideoScheduler::new(max_frame_duration),
            reader: Some(reader),
            video_worker,
            audio_worker,
            audio_callback,
            container,
            fullscreen: false,
        })
    }

    // =========================================================================
    // Main-loop surface
    // =========================================================================

    /// One presentation pass. Returns the suggested sleep before the next
    /// call, capped at the baseline cadence.
    pub fn refresh(&mut self, renderer: &mut dyn Renderer) -> Result<f64, PlayerError> {
        if let Some(error) = self.shared.take_error() {
            return Err(error);
        }
        let mut remaining_time = REFRESH_RATE;
        if !self.shared.is_paused()
            || self.shared.force_refresh.load(Ordering::Acquire)
            || self.shared.step_requested()
        {
            self.scheduler.refresh(&self.shared, renderer, &mut remaining_time)?;
        } else {
            // Keep the paused picture on screen.
            self.scheduler.re_present(&self.shared, renderer)?;
        }
        Ok(remaining_time)
    }

    /// Applies a host UI event.
    pub fn handle_event(&mut self, event: UiEvent) {
        match event {
            UiEvent::TogglePause => self.toggle_pause(),
            UiEvent::ToggleFullscreen => self.fullscreen = !self.fullscreen,
            UiEvent::SeekBackward => self.seek_relative(-SEEK_STEP_SECONDS),
            UiEvent::SeekForward => self.seek_relative(SEEK_STEP_SECONDS),
            UiEvent::Resized { width, height } => self.set_viewport(width, height),
        }
    }

    /// Pause/resume, re-anchoring every clock across the boundary.
    pub fn toggle_pause(&mut self) {
        let was_paused = self.shared.is_paused();
        if was_paused {
            // Credit the pause interval to the frame timer so the next frame
            // is not considered late.
            self.scheduler
                .add_pause_offset(now_seconds() - self.shared.video_clock.last_updated());
            self.shared.video_clock.set_paused(false);
            self.shared
                .video_clock
                .set(self.shared.video_clock.get(), self.shared.video_clock.serial());
        }
        self.shared
            .external_clock
            .set(self.shared.external_clock.get(), self.shared.external_clock.serial());
        self.shared.set_all_paused(!was_paused);
        if !was_paused {
            self.shared.record_pause_book();
        } else {
            self.shared.reader_wake.notify();
        }
        self.shared.step.store(false, Ordering::Release);
        tracing::debug!("pause toggled -> {}", !was_paused);
    }

    /// Runs exactly one frame while paused.
    pub fn step_to_next_frame(&mut self) {
        if self.shared.is_paused() {
            self.toggle_pause();
        }
        self.shared.step.store(true, Ordering::Release);
    }

    /// Seeks `incr` seconds relative to the master clock (bytes when the
    /// container only supports byte seeking).
    pub fn seek_relative(&mut self, incr: f64) {
        if self.shared.seek_by_bytes {
            let pos = self
                .shared
                .video
                .as_ref()
                .and_then(|v| v.frames.last_info())
                .and_then(|info| info.pos)
                .unwrap_or(0) as f64;
            let incr_bytes = incr * BYTE_SEEK_RATE;
            self.shared
                .request_seek((pos + incr_bytes) as i64, incr_bytes as i64, true);
            return;
        }

        let mut pos = self.shared.master_clock();
        if pos.is_nan() {
            pos = self.shared.seek.lock().target as f64 / 1_000_000.0;
        }
        pos += incr;
        if let Some(start) = self.container.start_time {
            if pos < start {
                pos = start;
            }
        }
        self.seek_to(pos, incr);
    }

    /// Seeks to an absolute position in seconds.
    pub fn seek_to(&mut self, seconds: f64, rel: f64) {
        let target = (seconds.max(0.0) * 1_000_000.0) as i64;
        self.shared
            .request_seek(target, (rel * 1_000_000.0) as i64, false);
    }

    /// Updates the viewport and forces a redraw.
    pub fn set_viewport(&mut self, width: u32, height: u32) {
        *self.shared.viewport.lock() = (width, height);
        self.shared.force_refresh.store(true, Ordering::Release);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn container(&self) -> &ContainerInfo {
        &self.container
    }

    pub fn is_paused(&self) -> bool {
        self.shared.is_paused()
    }

    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }

    pub fn is_realtime(&self) -> bool {
        self.shared.is_realtime
    }

    /// True once the reader drained everything with looping off.
    pub fn is_finished(&self) -> bool {
        self.shared.playback_finished.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &PlaybackStats {
        &self.shared.stats
    }

    /// Total bytes sitting in the packet queues; the reader throttles this
    /// under its 16 MiB budget.
    pub fn buffered_bytes(&self) -> usize {
        let video = self.shared.video.as_ref().map_or(0, |s| s.packets.size());
        let audio = self.shared.audio.as_ref().map_or(0, |s| s.packets.size());
        video + audio
    }

    /// Master clock reading; what the OSD calls the position.
    pub fn position(&self) -> f64 {
        if self.shared.is_paused() {
            self.shared.pause_book.lock().clock
        } else {
            self.shared.master_clock()
        }
    }

    /// The audio-device callback, available once per open.
    pub fn take_audio_callback(&mut self) -> Option<AudioCallback> {
        self.audio_callback.take()
    }

    /// Read-only state for the OSD.
    pub fn snapshot(&self) -> PlaybackSnapshot {
        let paused = self.shared.is_paused();
        let (position, frame_number) = if paused {
            let book = self.shared.pause_book.lock();
            (book.clock, book.frames)
        } else {
            let mut clock = self.shared.master_clock();
            if clock.is_nan() || clock < 0.0 {
                clock = 0.0;
            }
            let rate = self.shared.master_frame_rate;
            let frames = if rate != 0.0 { (clock * rate) as i64 } else { 0 };
            (clock, frames)
        };
        PlaybackSnapshot {
            media_name: self.shared.media_name.clone(),
            paused,
            position,
            duration: self.shared.duration,
            frame_number,
            frame_drops_early: self.shared.stats.frame_drops_early(),
            frame_drops_late: self.shared.stats.frame_drops_late(),
            frames_displayed: self.shared.stats.frames_displayed(),
            audio_underruns: self.shared.stats.audio_underruns(),
        }
    }

    fn stop(&mut self) {
        // Reader first so no new packets land, then the workers.
        if let Some(mut reader) = self.reader.take() {
            reader.stop();
        }
        if let Some(mut worker) = self.video_worker.take() {
            worker.stop();
        }
        if let Some(mut worker) = self.audio_worker.take() {
            worker.stop();
        }
        if let Some(video) = self.shared.video.as_ref() {
            video.frames.clear();
        }
        if let Some(audio) = self.shared.audio.as_ref() {
            audio.frames.clear();
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}
