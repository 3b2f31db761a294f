//! vivace-core: synchronized media playback engine.
//!
//! A demux→decode→present pipeline built around serial-stamped queues and
//! drift-corrected clocks:
//!
//! - Queueing: [`packet`] (compressed, with flush/null sentinels and
//!   serials), [`frame_queue`] (decoded, keep-last ring)
//! - Timing: [`clock`] (audio/video/external clocks), [`scheduler`]
//!   (frame pacing, drop policy, realtime drift control)
//! - Workers: [`reader`] (demux thread), [`decoder`] (per-stream decode
//!   threads), [`audio`] (device pull callback)
//! - Backends: [`facade`] traits with [`sim`] (synthetic, always available)
//!   and [`ffmpeg`] (behind the `ffmpeg` feature); audio output via cpal
//!   behind `audio-output`
//!
//! The engine is headless: rendering goes through the [`renderer::Renderer`]
//! contract and the host owns the window, the event loop, and the audio
//! device.

pub mod audio;
pub mod clock;
pub mod error;
pub mod facade;
pub mod frame_queue;
pub mod packet;
pub mod renderer;
pub mod scheduler;
pub mod settings;
pub mod sim;
pub mod stats;

mod decoder;
mod player;
mod reader;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

pub use audio::{AudioCallback, AudioSpec, SampleFormat};
#[cfg(feature = "audio-output")]
pub use audio::AudioOutput;
pub use clock::{Clock, SyncSource};
pub use error::PlayerError;
pub use facade::{ContainerInfo, FacadeError, MediaSource, StreamKind};
pub use player::{AudioWiring, Player, UiEvent, SEEK_STEP_SECONDS};
pub use renderer::{calculate_display_rect, DisplayRect, NullRenderer, Renderer};
pub use settings::{FrameDrop, LoopMode, ReorderPts, Settings};
pub use stats::{PlaybackSnapshot, PlaybackStats};
