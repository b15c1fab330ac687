//! Cadence Player - headless playback driver
//!
//! Runs the playback engine against a simulated stream (or, with the `audio`
//! feature, a local audio file) and optionally replays a timed command
//! script. Events can be printed as JSON lines.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use cadence_core::audio::{AudioFormat, AudioSink};
use cadence_core::control::{Command, ControlHandle};
use cadence_core::decode::AudioDecoder;
use cadence_core::engine::{MediaSources, PlaybackEngine};
use cadence_core::options::PlaybackOptions;
use cadence_core::seek::{SeekKind, SeekPrecision};
use cadence_core::sim::SimDemuxer;
use cadence_core::thread_pool::ThreadPool;
use cadence_core::time::{MonotonicClock, TimeSource};
use cadence_core::video::VideoSource;

const SIM_SAMPLE_RATE: u32 = 48000;
const SIM_BLOCK_FRAMES: usize = 1024;
/// Script steps poll the stop flag at this interval
const SCRIPT_POLL: Duration = Duration::from_millis(50);

// ============================================================================
// Command Line
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
struct ScriptStep {
    at: f64,
    command: Command,
}

#[derive(Debug)]
struct AppOptions {
    options: Option<PathBuf>,
    input: Option<PathBuf>,
    duration: f64,
    fps: f64,
    audio: bool,
    video: bool,
    loop_file: bool,
    keep_open: bool,
    print_events: bool,
    script: Vec<ScriptStep>,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            options: None,
            input: None,
            duration: 10.0,
            fps: 25.0,
            audio: true,
            video: true,
            loop_file: false,
            keep_open: false,
            print_events: false,
            script: Vec::new(),
        }
    }
}

impl AppOptions {
    fn from_args(args: &[String]) -> Result<Self> {
        let mut app = Self::default();

        let mut i = 1;
        while i < args.len() {
            let arg = args[i].as_str();
            let value = || {
                args.get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("Missing value for {}", arg))
            };
            match arg {
                "--options" | "-o" => {
                    app.options = Some(PathBuf::from(value()?));
                    i += 2;
                }
                "--input" | "-i" => {
                    app.input = Some(PathBuf::from(value()?));
                    i += 2;
                }
                "--duration" | "-d" => {
                    let v = value()?;
                    app.duration = v
                        .parse::<f64>()
                        .map_err(|e| anyhow::anyhow!("Invalid duration {}: {}", v, e))?;
                    i += 2;
                }
                "--fps" => {
                    let v = value()?;
                    app.fps = v
                        .parse::<f64>()
                        .map_err(|e| anyhow::anyhow!("Invalid fps {}: {}", v, e))?;
                    if app.fps <= 0.0 {
                        anyhow::bail!("fps must be positive, got {}", v);
                    }
                    i += 2;
                }
                "--at" => {
                    app.script.push(parse_step(value()?)?);
                    i += 2;
                }
                "--no-audio" => {
                    app.audio = false;
                    i += 1;
                }
                "--no-video" => {
                    app.video = false;
                    i += 1;
                }
                "--loop" => {
                    app.loop_file = true;
                    i += 1;
                }
                "--keep-open" => {
                    app.keep_open = true;
                    i += 1;
                }
                "--events" => {
                    app.print_events = true;
                    i += 1;
                }
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                other => {
                    print_usage();
                    anyhow::bail!("Unknown argument {}", other);
                }
            }
        }

        if !app.audio && !app.video && app.input.is_none() {
            anyhow::bail!("Nothing to play: both audio and video are disabled");
        }
        app.script
            .sort_by(|a, b| a.at.partial_cmp(&b.at).unwrap_or(std::cmp::Ordering::Equal));
        Ok(app)
    }
}

/// `<seconds>:<command>`, e.g. `2.5:seek=+10` or `4:pause`
fn parse_step(step: &str) -> Result<ScriptStep> {
    let (at, cmd) = step
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("Script step {} is not <seconds>:<command>", step))?;
    let at = at
        .parse::<f64>()
        .map_err(|e| anyhow::anyhow!("Invalid step time {}: {}", at, e))?;
    Ok(ScriptStep {
        at,
        command: parse_command(cmd)?,
    })
}

fn parse_command(cmd: &str) -> Result<Command> {
    let (name, arg) = match cmd.split_once('=') {
        Some((name, arg)) => (name, Some(arg)),
        None => (cmd, None),
    };
    let number = |arg: Option<&str>| -> Result<f64> {
        let arg = arg.ok_or_else(|| anyhow::anyhow!("Missing value for {}", name))?;
        arg.trim_end_matches('%')
            .parse::<f64>()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {}: {}", name, arg, e))
    };

    let command = match name {
        "pause" => Command::Pause,
        "unpause" => Command::Unpause,
        "toggle" => Command::TogglePause,
        "step" => Command::FrameStep(1),
        "back" => Command::FrameStep(-1),
        "stop" | "quit" => Command::Stop,
        "speed" => Command::SetSpeed(number(arg)?),
        "seek" | "exact-seek" => {
            let raw = arg.unwrap_or_default();
            let amount = number(arg)?;
            let kind = if raw.ends_with('%') {
                SeekKind::Factor
            } else if raw.starts_with('+') || raw.starts_with('-') {
                SeekKind::Relative
            } else {
                SeekKind::Absolute
            };
            let amount = if kind == SeekKind::Factor {
                amount / 100.0
            } else {
                amount
            };
            let precision = if name == "exact-seek" {
                SeekPrecision::Exact
            } else {
                SeekPrecision::Default
            };
            Command::Seek {
                kind,
                amount,
                precision,
                immediate: false,
            }
        }
        other => anyhow::bail!("Unknown script command {}", other),
    };
    Ok(command)
}

fn print_usage() {
    println!("Usage: cadence [options]");
    println!();
    println!("Plays a simulated stream (or an audio file) through the sync engine.");
    println!();
    println!("Options:");
    println!("  -o, --options <file>   Playback options (JSON)");
    println!("  -i, --input <file>     Audio file to play (needs the `audio` feature)");
    println!("  -d, --duration <secs>  Length of the simulated stream (default 10)");
    println!("      --fps <n>          Simulated video frame rate (default 25)");
    println!("      --no-audio         Simulate without an audio track");
    println!("      --no-video         Simulate without a video track");
    println!("      --loop             Restart at the end of the file");
    println!("      --keep-open        Pause on the last frame instead of stopping");
    println!("      --events           Print engine events as JSON lines");
    println!("      --at <t>:<cmd>     Send a command t seconds after start. Commands:");
    println!("                         pause, unpause, toggle, step, back, stop,");
    println!("                         speed=<x>, seek=<t|+t|-t|p%>, exact-seek=<...>");
    println!("  -h, --help             Show this help");
}

// ============================================================================
// Sources
// ============================================================================

fn open_sources(app: &AppOptions, clock: &Arc<dyn TimeSource>) -> Result<MediaSources> {
    if let Some(path) = &app.input {
        return open_file(path);
    }

    let demuxer = SimDemuxer::new(app.duration);
    let audio = app.audio.then(|| {
        let format = AudioFormat::pcm(SIM_SAMPLE_RATE, 2);
        let decoder: Box<dyn AudioDecoder> =
            Box::new(demuxer.audio_decoder(format, SIM_BLOCK_FRAMES));
        // 200ms device buffer
        let sink: Box<dyn AudioSink> = Box::new(
            cadence_core::sim::SimSink::new(SIM_SAMPLE_RATE as usize / 5)
                .with_clock(Arc::clone(clock)),
        );
        (decoder, sink)
    });
    let video = app
        .video
        .then(|| Box::new(demuxer.video_source(app.fps)) as Box<dyn VideoSource>);

    tracing::info!(
        "Simulated stream: {:.1}s, audio: {}, video: {}",
        app.duration,
        app.audio,
        if app.video { format!("{} fps", app.fps) } else { "no".into() }
    );

    Ok(MediaSources {
        demuxer: Box::new(demuxer),
        audio,
        video,
        externals: Vec::new(),
    })
}

#[cfg(feature = "audio")]
fn open_file(path: &Path) -> Result<MediaSources> {
    use cadence_core::audio::CpalSink;
    use cadence_core::decode::SymphoniaSource;

    let (demuxer, decoder) = SymphoniaSource::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    tracing::info!("Playing {}", path.display());
    Ok(MediaSources {
        demuxer: Box::new(demuxer),
        audio: Some((Box::new(decoder), Box::new(CpalSink::new()))),
        video: None,
        externals: Vec::new(),
    })
}

#[cfg(not(feature = "audio"))]
fn open_file(path: &Path) -> Result<MediaSources> {
    anyhow::bail!(
        "Cannot play {}: built without the `audio` feature",
        path.display()
    )
}

// ============================================================================
// Script
// ============================================================================

fn run_script(script: Vec<ScriptStep>, control: ControlHandle, done: Arc<AtomicBool>) {
    let started = Instant::now();
    for step in script {
        loop {
            if done.load(Ordering::Acquire) {
                return;
            }
            let remaining = step.at - started.elapsed().as_secs_f64();
            if remaining <= 0.0 {
                break;
            }
            std::thread::sleep(SCRIPT_POLL.min(Duration::from_secs_f64(remaining)));
        }
        tracing::info!("[{:.2}s] {:?}", step.at, step.command);
        control.send(step.command);
    }
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let app = AppOptions::from_args(&args)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cadence=info,cadence_core=info")),
        )
        .init();

    tracing::info!("Cadence v{}", cadence_core::VERSION);

    let mut opts = match &app.options {
        Some(path) => PlaybackOptions::load(path)
            .with_context(|| format!("Failed to load options from {}", path.display()))?,
        None => PlaybackOptions::default(),
    };
    opts.loop_file |= app.loop_file;
    opts.keep_open |= app.keep_open;
    opts.validate()?;

    let clock: Arc<dyn TimeSource> = Arc::new(MonotonicClock::new());
    let mut engine = PlaybackEngine::new(Arc::new(opts), Arc::clone(&clock));

    if app.print_events {
        engine.subscribe(&[], |event| match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!("Failed to serialize event {:?}: {}", event, e),
        });
    }

    engine.load(open_sources(&app, &clock)?);

    // The script sleeps between steps, so it runs off the playback loop
    let pool = ThreadPool::new(1, 0, 1)?;
    let done = Arc::new(AtomicBool::new(false));
    if !app.script.is_empty() {
        let control = engine.control();
        let script = app.script.clone();
        let done = Arc::clone(&done);
        pool.run(move || run_script(script, control, done))?;
    }

    let started = Instant::now();
    let reason = engine.run();
    done.store(true, Ordering::Release);

    tracing::info!(
        "Playback stopped ({:?}) after {:.2}s at {:.3}",
        reason,
        started.elapsed().as_secs_f64(),
        engine.playback_time().unwrap_or(0.0)
    );

    let stats = engine.stats();
    tracing::info!(
        "Frames shown: {}, dropped: {}, audio played: {:.2}s",
        stats.frames_shown,
        stats.frames_dropped,
        stats.audio_played
    );

    engine.unload();
    drop(pool);
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("cadence")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_defaults() {
        let app = AppOptions::from_args(&args(&[])).unwrap();
        assert_eq!(app.duration, 10.0);
        assert!(app.audio && app.video);
        assert!(app.script.is_empty());
    }

    #[test]
    fn test_parse_script_sorted() {
        let app = AppOptions::from_args(&args(&[
            "--at", "3:unpause", "--at", "1.5:pause", "-d", "20",
        ]))
        .unwrap();
        assert_eq!(app.duration, 20.0);
        assert_eq!(app.script[0].at, 1.5);
        assert_eq!(app.script[0].command, Command::Pause);
        assert_eq!(app.script[1].command, Command::Unpause);
    }

    #[test]
    fn test_parse_seek_commands() {
        assert_eq!(
            parse_command("seek=+10").unwrap(),
            Command::Seek {
                kind: SeekKind::Relative,
                amount: 10.0,
                precision: SeekPrecision::Default,
                immediate: false,
            }
        );
        assert_eq!(
            parse_command("exact-seek=42.5").unwrap(),
            Command::Seek {
                kind: SeekKind::Absolute,
                amount: 42.5,
                precision: SeekPrecision::Exact,
                immediate: false,
            }
        );
        match parse_command("seek=50%").unwrap() {
            Command::Seek { kind, amount, .. } => {
                assert_eq!(kind, SeekKind::Factor);
                assert!((amount - 0.5).abs() < 1e-12);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(parse_command("back").unwrap(), Command::FrameStep(-1));
        assert_eq!(parse_command("speed=1.5").unwrap(), Command::SetSpeed(1.5));
    }

    #[test]
    fn test_parse_errors() {
        assert!(AppOptions::from_args(&args(&["--duration"])).is_err());
        assert!(AppOptions::from_args(&args(&["--fps", "0"])).is_err());
        assert!(AppOptions::from_args(&args(&["--no-audio", "--no-video"])).is_err());
        assert!(parse_step("pause").is_err());
        assert!(parse_command("rewind").is_err());
        assert!(parse_command("speed").is_err());
    }
}
