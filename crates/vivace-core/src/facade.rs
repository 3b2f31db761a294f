//! Codec façade interfaces.
//!
//! The engine never talks to a concrete demuxer or codec library. It consumes
//! the capability traits in this module:
//!
//! - [`Demuxer`]: open input, pull interleaved compressed packets, seek,
//!   pause/resume for network inputs
//! - [`StreamDecoder`]: per-stream send-packet / receive-frame with the
//!   three-valued return (frame ready / needs input / end of stream)
//! - [`Resampler`]: audio conversion into the device output format
//! - [`Scaler`]: pixel format conversion for presentation
//!
//! Backends: [`crate::sim`] (deterministic synthetic media, always compiled,
//! used by tests and the demo fallback) and [`crate::ffmpeg`] (FFmpeg, behind
//! the `ffmpeg` feature).

use std::fmt;

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by façade backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FacadeError {
    /// Failed to open the input (file missing, unsupported container, I/O)
    OpenFailed(String),
    /// Decoder initialization failed
    DecoderInit(String),
    /// Frame decoding error
    DecodeFailed(String),
    /// Seek operation failed
    SeekFailed(String),
    /// Demuxer-level I/O error while reading packets
    Io(String),
}

impl fmt::Display for FacadeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FacadeError::OpenFailed(msg) => write!(f, "Failed to open input: {msg}"),
            FacadeError::DecoderInit(msg) => write!(f, "Decoder initialization failed: {msg}"),
            FacadeError::DecodeFailed(msg) => write!(f, "Frame decode failed: {msg}"),
            FacadeError::SeekFailed(msg) => write!(f, "Seek failed: {msg}"),
            FacadeError::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for FacadeError {}

// ============================================================================
// Time base & rationals
// ============================================================================

/// A stream time base or aspect ratio as a rational number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// The rational as a float; 0.0 when the denominator is zero.
    pub fn as_f64(self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    pub fn invert(self) -> Self {
        Self { num: self.den, den: self.num }
    }
}

/// Converts a timestamp in `tb` units to seconds.
pub fn ts_to_seconds(ts: i64, tb: Rational) -> f64 {
    ts as f64 * tb.as_f64()
}

/// Rescales a timestamp from one time base to another.
pub fn rescale_ts(ts: i64, from: Rational, to: Rational) -> i64 {
    if from.den == 0 || to.num == 0 {
        return ts;
    }
    let num = ts as i128 * from.num as i128 * to.den as i128;
    let den = from.den as i128 * to.num as i128;
    (num / den) as i64
}

// ============================================================================
// Streams & container
// ============================================================================

// Small internal helper giving `ContainerFlags` a bitflags surface without
// pulling the bitflags crate in for one type.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(
                $(#[$fmeta:meta])*
                const $flag:ident = $value:expr;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(pub $ty);

        impl $name {
            $(
                $(#[$fmeta])*
                pub const $flag: $name = $name($value);
            )*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }
    };
}

/// Kind of media carried by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

/// Per-stream description supplied by the demuxer at open.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: StreamKind,
    /// Time base of packet/frame timestamps on this stream.
    pub time_base: Rational,
    /// First timestamp of the stream, in `time_base` units, if known.
    pub start_time: Option<i64>,
    /// Average frame rate; denominator 0 when unknown.
    pub avg_frame_rate: Rational,
    /// Stream carries only an attached picture (cover art); such streams are
    /// considered fully buffered by the reader's backpressure heuristic.
    pub attached_pic: bool,
}

bitflags_like! {
    /// Container-level flags the engine reacts to.
    pub struct ContainerFlags: u32 {
        /// Timestamps may be discontinuous (MPEG-TS); enables byte seeking
        /// and shrinks the max plausible frame duration to 10 s.
        const TS_DISCONT = 1 << 0;
        /// No binary search based seeking.
        const NO_BIN_SEARCH = 1 << 1;
        /// No generic search based seeking.
        const NO_GEN_SEARCH = 1 << 2;
        /// Byte seeking is unavailable.
        const NO_BYTE_SEEK = 1 << 3;
        /// The format has a native read_seek implementation.
        const HAS_READ_SEEK = 1 << 4;
    }
}

/// Container description supplied by the demuxer at open.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    /// Short container format name (`"mp4"`, `"ogg"`, `"rtsp"`, ...).
    pub format_name: String,
    /// The URL or path the container was opened from.
    pub url: String,
    /// Total duration in seconds, if the container knows it.
    pub duration: Option<f64>,
    /// Container start time in seconds, if known.
    pub start_time: Option<f64>,
    pub flags: ContainerFlags,
    pub streams: Vec<StreamInfo>,
}

impl ContainerInfo {
    /// First stream of `kind`, the demuxer's notion of "best" ordering.
    pub fn best_stream(&self, kind: StreamKind) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.kind == kind)
    }
}

// ============================================================================
// Packets
// ============================================================================

/// Compressed payload, owned by whichever backend produced it.
pub enum PacketPayload {
    /// Raw compressed bytes (synthetic backend, tests).
    Bytes(Vec<u8>),
    #[cfg(feature = "ffmpeg")]
    /// An FFmpeg-owned packet buffer.
    Av(ffmpeg_next::packet::Packet),
}

impl PacketPayload {
    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        match self {
            PacketPayload::Bytes(b) => b.len(),
            #[cfg(feature = "ffmpeg")]
            PacketPayload::Av(p) => p.size(),
        }
    }
}

impl fmt::Debug for PacketPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketPayload({} bytes)", self.size())
    }
}

/// One demuxed compressed packet.
#[derive(Debug)]
pub struct DemuxedPacket {
    pub stream_index: usize,
    /// Presentation timestamp in stream time-base units; absent for some
    /// formats (DTS is the fallback).
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    /// Duration in stream time-base units (0 when unknown).
    pub duration: i64,
    /// Byte offset in the source, for byte-based seeking.
    pub pos: Option<i64>,
    pub payload: PacketPayload,
}

impl DemuxedPacket {
    /// PTS with DTS fallback, the timestamp used for play-range gating.
    pub fn timestamp(&self) -> Option<i64> {
        self.pts.or(self.dts)
    }
}

/// Demuxer read outcome.
pub enum ReadOutcome {
    Packet(DemuxedPacket),
    /// End of the container was reached.
    EndOfFile,
}

// ============================================================================
// Frames
// ============================================================================

/// Pixel formats the engine can describe; conversion targets are up to the
/// scaler and renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuv420p,
    Rgba,
    Bgra,
}

/// One plane of CPU-resident picture data.
#[derive(Debug, Clone)]
pub struct Plane {
    pub data: Vec<u8>,
    pub stride: usize,
}

/// CPU-resident picture.
#[derive(Debug, Clone)]
pub struct CpuPicture {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<Plane>,
}

/// A decoded video picture handed out of a [`StreamDecoder`].
#[derive(Debug)]
pub struct VideoFrameData {
    /// PTS in stream time-base units, already subject to the backend's
    /// ordering (the engine rewrites it per the reorder policy).
    pub pts: Option<i64>,
    /// Codec's best-effort reordered timestamp.
    pub best_effort_pts: Option<i64>,
    /// DTS of the packet that produced this frame.
    pub pkt_dts: Option<i64>,
    /// Byte position of that packet.
    pub pos: Option<i64>,
    pub width: u32,
    pub height: u32,
    /// Sample aspect ratio; num 0 when unknown.
    pub sar: Rational,
    pub picture: CpuPicture,
}

/// Decoded audio samples handed out of a [`StreamDecoder`].
///
/// Samples are interleaved f32 at the stream's native rate; the resampler
/// converts to the device format and applies drift compensation.
#[derive(Debug)]
pub struct AudioFrameData {
    /// PTS in stream time-base units.
    pub pts: Option<i64>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Sample frames (not individual samples) in this window.
    pub nb_samples: usize,
    /// Interleaved samples, `nb_samples * channels` long.
    pub samples: Vec<f32>,
}

/// Either kind of decoded frame.
#[derive(Debug)]
pub enum DecodedFrame {
    Video(VideoFrameData),
    Audio(AudioFrameData),
}

// ============================================================================
// Traits
// ============================================================================

/// Outcome of feeding a packet to a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The packet was consumed.
    Accepted,
    /// The codec wants frames drained first; retain the packet and retry.
    TryAgain,
}

/// Outcome of asking a decoder for a frame.
#[derive(Debug)]
pub enum ReceiveStatus {
    Frame(DecodedFrame),
    /// The codec needs more packets before it can emit a frame.
    NeedsInput,
    /// The codec has drained after a null packet; no more frames will come.
    EndOfStream,
}

/// Flags modifying [`Demuxer::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeekFlags {
    /// Seek to any frame, not only keyframes.
    pub any: bool,
    /// Positions are byte offsets, not timestamps.
    pub by_bytes: bool,
    /// Prefer positions at or before the target.
    pub backward: bool,
}

/// The demuxer half of the codec façade. One instance per open input, used
/// only from the reader thread.
pub trait Demuxer: Send {
    /// Container and stream description captured at open.
    fn container(&self) -> &ContainerInfo;

    /// Reads the next interleaved packet.
    fn read_packet(&mut self) -> Result<ReadOutcome, FacadeError>;

    /// Seeks so that subsequent reads start near `target`, constrained to
    /// `[min, max]`. All three are in microseconds (or bytes with
    /// `flags.by_bytes`).
    fn seek(&mut self, min: i64, target: i64, max: i64, flags: SeekFlags)
        -> Result<(), FacadeError>;

    /// Pauses network delivery; a no-op for local files.
    fn pause(&mut self) -> Result<(), FacadeError> {
        Ok(())
    }

    /// Resumes network delivery; a no-op for local files.
    fn play(&mut self) -> Result<(), FacadeError> {
        Ok(())
    }
}

/// The per-stream decoder half of the codec façade. One instance per decoded
/// stream, used only from that stream's decoder thread.
pub trait StreamDecoder: Send {
    /// Feeds a compressed packet.
    fn send_packet(&mut self, packet: &DemuxedPacket) -> Result<SendStatus, FacadeError>;

    /// Enters drain mode (the null-packet path at EOF).
    fn send_eof(&mut self) -> Result<(), FacadeError>;

    /// Pulls the next decoded frame if one is ready.
    fn receive_frame(&mut self) -> Result<ReceiveStatus, FacadeError>;

    /// Drops all internal codec state (crossing a flush packet).
    fn flush(&mut self);
}

/// Audio conversion into a fixed output format, with sample-count
/// compensation for drift correction.
pub trait Resampler: Send {
    /// Converts `frame` into interleaved bytes of the output format,
    /// stretching or squeezing to `wanted_samples` per channel. Returns the
    /// number of output sample frames written into `out`.
    fn convert(
        &mut self,
        frame: &AudioFrameData,
        wanted_samples: usize,
        out: &mut Vec<u8>,
    ) -> Result<usize, FacadeError>;
}

/// Pixel format conversion for presentation.
pub trait Scaler: Send {
    /// Converts `picture` to the target format agreed at construction.
    fn scale(&mut self, picture: &CpuPicture) -> Result<CpuPicture, FacadeError>;
}

/// Everything the engine needs from one opened media source.
pub struct MediaSource {
    pub demuxer: Box<dyn Demuxer>,
    /// Decoder for the selected video stream, if one exists and is enabled.
    pub video_decoder: Option<Box<dyn StreamDecoder>>,
    /// Decoder for the selected audio stream, if one exists and is enabled.
    pub audio_decoder: Option<Box<dyn StreamDecoder>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rational_conversions() {
        let tb = Rational::new(1, 1000);
        assert!((ts_to_seconds(2500, tb) - 2.5).abs() < 1e-9);
        assert_eq!(Rational::new(0, 0).as_f64(), 0.0);
    }

    #[test]
    fn rescale_between_time_bases() {
        // 90kHz -> milliseconds
        let ts = rescale_ts(90_000, Rational::new(1, 90_000), Rational::new(1, 1000));
        assert_eq!(ts, 1000);
    }

    #[test]
    fn container_flags_compose() {
        let mut flags = ContainerFlags::empty();
        flags.insert(ContainerFlags::TS_DISCONT);
        assert!(flags.contains(ContainerFlags::TS_DISCONT));
        assert!(!flags.contains(ContainerFlags::NO_BYTE_SEEK));
        let both = ContainerFlags::TS_DISCONT | ContainerFlags::NO_BYTE_SEEK;
        assert!(both.contains(ContainerFlags::NO_BYTE_SEEK));
    }

    #[test]
    fn best_stream_picks_first_of_kind() {
        let info = ContainerInfo {
            format_name: "matroska".into(),
            url: "test.mkv".into(),
            duration: Some(10.0),
            start_time: None,
            flags: ContainerFlags::empty(),
            streams: vec![
                StreamInfo {
                    index: 0,
                    kind: StreamKind::Audio,
                    time_base: Rational::new(1, 48_000),
                    start_time: None,
                    avg_frame_rate: Rational::new(0, 0),
                    attached_pic: false,
                },
                StreamInfo {
                    index: 1,
                    kind: StreamKind::Video,
                    time_base: Rational::new(1, 90_000),
                    start_time: None,
                    avg_frame_rate: Rational::new(25, 1),
                    attached_pic: false,
                },
            ],
        };
        assert_eq!(info.best_stream(StreamKind::Video).unwrap().index, 1);
        assert_eq!(info.best_stream(StreamKind::Audio).unwrap().index, 0);
    }
}
