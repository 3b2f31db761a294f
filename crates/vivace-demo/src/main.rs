//! vivace demo player.
//!
//! `vivace-demo <media-path-or-url>` plays the input headlessly, printing an
//! OSD line once a second. With the `ffmpeg` feature the real façade decodes
//! the file; without it a synthetic test clip plays instead. Simple stdin
//! commands stand in for a window's key events:
//!
//! - `p` — toggle pause
//! - `f` — toggle fullscreen flag
//! - `a` / `d` — seek -5s / +5s
//! - `q` — quit

use std::io::BufRead;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use tracing_subscriber::EnvFilter;

use vivace_core::{NullRenderer, Player, Settings, UiEvent};

/// Maps one stdin line to a UI event; `None` quits.
fn parse_command(line: &str) -> Option<Option<UiEvent>> {
    match line.trim() {
        "p" => Some(Some(UiEvent::TogglePause)),
        "f" => Some(Some(UiEvent::ToggleFullscreen)),
        "a" => Some(Some(UiEvent::SeekBackward)),
        "d" => Some(Some(UiEvent::SeekForward)),
        "q" => None,
        _ => Some(None),
    }
}

/// Forwards stdin lines into a channel so the main loop never blocks on a
/// read.
fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = unbounded();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

#[cfg(feature = "ffmpeg")]
fn open_source(path: &str) -> Result<vivace_core::MediaSource, vivace_core::PlayerError> {
    Ok(vivace_core::ffmpeg::open(path)?)
}

#[cfg(not(feature = "ffmpeg"))]
fn open_source(path: &str) -> Result<vivace_core::MediaSource, vivace_core::PlayerError> {
    tracing::warn!(
        "built without the `ffmpeg` feature; playing a synthetic clip instead of {path}"
    );
    Ok(vivace_core::sim::open(vivace_core::sim::SimConfig {
        name: path.to_string(),
        duration: 10.0,
        ..Default::default()
    }))
}

fn run(path: &str) -> Result<(), vivace_core::PlayerError> {
    let source = open_source(path)?;

    // Audio device wiring: only with a real output device compiled in.
    #[cfg(feature = "audio-output")]
    let (audio_wiring, audio_spec) = {
        match vivace_core::AudioOutput::probe() {
            Ok(spec) => {
                #[cfg(feature = "ffmpeg")]
                let resampler = vivace_core::ffmpeg::resampler(&spec);
                #[cfg(not(feature = "ffmpeg"))]
                let resampler: Box<dyn vivace_core::facade::Resampler> =
                    Box::new(vivace_core::sim::SimResampler::new(spec.rate, spec.channels));
                (Some(vivace_core::AudioWiring { spec, resampler }), Some(spec))
            }
            Err(err) => {
                tracing::warn!("no audio output: {err}");
                (None, None)
            }
        }
    };
    #[cfg(not(feature = "audio-output"))]
    let (audio_wiring, audio_spec): (Option<vivace_core::AudioWiring>, Option<vivace_core::AudioSpec>) =
        (None, None);

    let mut player = Player::open(source, audio_wiring, Settings::default())?;

    #[cfg(feature = "audio-output")]
    let _audio_output = match (player.take_audio_callback(), audio_spec) {
        (Some(callback), Some(spec)) => Some(vivace_core::AudioOutput::start(spec, callback)?),
        _ => None,
    };
    #[cfg(not(feature = "audio-output"))]
    let _ = audio_spec;

    let mut renderer = NullRenderer::new();
    let commands = spawn_stdin_reader();
    let mut last_osd = Instant::now();

    loop {
        while let Ok(line) = commands.try_recv() {
            match parse_command(&line) {
                Some(Some(event)) => player.handle_event(event),
                Some(None) => {}
                None => {
                    tracing::info!("quit requested");
                    return Ok(());
                }
            }
        }

        if player.is_finished() {
            tracing::info!("end of stream");
            return Ok(());
        }

        let remaining = player.refresh(&mut renderer)?;
        if last_osd.elapsed() >= Duration::from_secs(1) {
            last_osd = Instant::now();
            println!("{}", player.snapshot());
        }
        if remaining > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(remaining));
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let Some(path) = std::env::args().nth(1) else {
        eprintln!("usage: vivace-demo <media-path-or-url>");
        return ExitCode::FAILURE;
    };

    match run(&path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fatal: {err}");
            ExitCode::FAILURE
        }
    }
}
