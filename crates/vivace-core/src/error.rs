//! Engine-level errors.

use std::fmt;

use crate::facade::FacadeError;

/// Errors surfaced by the player. Only init-fatal conditions and shutdown
/// reach the caller; transient decode conditions are handled inside the
/// pipeline and show up as counters instead.
#[derive(Debug, Clone)]
pub enum PlayerError {
    /// The façade could not open or describe the input.
    Open(FacadeError),
    /// The input has neither a usable video nor audio stream.
    NoStreams,
    /// The audio device could not be opened.
    AudioDevice(String),
    /// The renderer rejected initialization or a frame.
    Render(String),
    /// The reader hit a fatal demuxer I/O error mid-playback.
    Io(String),
    /// Anything else.
    Generic(String),
}

impl fmt::Display for PlayerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerError::Open(err) => write!(f, "Failed to open media: {err}"),
            PlayerError::NoStreams => write!(f, "No video or audio stream found"),
            PlayerError::AudioDevice(msg) => write!(f, "Audio device error: {msg}"),
            PlayerError::Render(msg) => write!(f, "Render error: {msg}"),
            PlayerError::Io(msg) => write!(f, "I/O error: {msg}"),
            PlayerError::Generic(msg) => write!(f, "Player error: {msg}"),
        }
    }
}

impl std::error::Error for PlayerError {}

impl From<FacadeError> for PlayerError {
    fn from(err: FacadeError) -> Self {
        PlayerError::Open(err)
    }
}
