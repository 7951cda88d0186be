//! Duckmix headless host.
//!
//! Opens the default (or preferred) output and microphone, starts the music
//! loop and optionally replays a WAV file as the remote agent's voice so the
//! ducking behaviour can be heard end to end.
//!
//! ```text
//! duckmix [--settings PATH] [--music PATH] [--replay PATH]
//!         [--duration SECS] [--no-mic] [--list-devices] [--save-settings]
//! ```

mod settings;

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use duckmix_core::{
    audio::device::{list_input_devices, list_output_devices},
    mix::load_wav,
    AgentState, AudioBlock, AudioCapture, CpalBackend, DuckmixEngine, RemoteTap,
};
use settings::{default_settings_path, load_settings, save_settings};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

const REPLAY_BLOCK: Duration = Duration::from_millis(20);

#[derive(Debug, Default)]
struct CliArgs {
    settings_path: Option<PathBuf>,
    music_path: Option<PathBuf>,
    replay_path: Option<PathBuf>,
    duration: Option<Duration>,
    no_mic: bool,
    list_devices: bool,
    save_settings: bool,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<CliArgs> {
    let mut cli = CliArgs::default();
    while let Some(arg) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .with_context(|| format!("{flag} expects a value"))
        };
        match arg.as_str() {
            "--settings" => cli.settings_path = Some(value("--settings")?.into()),
            "--music" => cli.music_path = Some(value("--music")?.into()),
            "--replay" => cli.replay_path = Some(value("--replay")?.into()),
            "--duration" => {
                let raw = value("--duration")?;
                let secs: f32 = raw
                    .parse()
                    .with_context(|| format!("invalid --duration '{raw}'"))?;
                if !secs.is_finite() || secs <= 0.0 {
                    bail!("--duration must be positive");
                }
                cli.duration = Some(Duration::from_secs_f32(secs));
            }
            "--no-mic" => cli.no_mic = true,
            "--list-devices" => cli.list_devices = true,
            "--save-settings" => cli.save_settings = true,
            other => bail!("unknown argument '{other}'"),
        }
    }
    Ok(cli)
}

fn print_devices() {
    println!("Input devices:");
    for device in list_input_devices() {
        println!(
            "  {}{}{}",
            device.name,
            if device.is_default { " (default)" } else { "" },
            if device.is_loopback_like { " [loopback?]" } else { "" },
        );
    }
    println!("Output devices:");
    for device in list_output_devices() {
        println!(
            "  {}{}",
            device.name,
            if device.is_default { " (default)" } else { "" },
        );
    }
}

/// Split `block` into `REPLAY_BLOCK`-sized pieces.
fn split_blocks(block: &AudioBlock) -> anyhow::Result<Vec<AudioBlock>> {
    let planes = block.to_planar_f32()?;
    let step = ((block.sample_rate as u64 * REPLAY_BLOCK.as_millis() as u64) / 1000).max(1) as usize;
    let mut blocks = Vec::new();
    let mut start = 0;
    while start < block.frames {
        let end = (start + step).min(block.frames);
        let chunk = planes.iter().map(|p| p[start..end].to_vec()).collect();
        blocks.push(AudioBlock::planar_f32(block.sample_rate, chunk));
        start = end;
    }
    Ok(blocks)
}

/// Deliver `blocks` to `tap` at real-time pace, like a network transport.
fn replay(tap: &RemoteTap, blocks: Vec<AudioBlock>) {
    tap.set_agent_state(AgentState::Speaking);
    let started = Instant::now();
    let mut sent = Duration::ZERO;
    for block in blocks {
        sent += block.duration();
        tap.deliver(block);
        if let Some(wait) = sent.checked_sub(started.elapsed()) {
            thread::sleep(wait);
        }
    }
    tap.set_agent_state(AgentState::Listening);
    info!(secs = sent.as_secs_f32(), "remote replay finished");
}

fn spawn_event_logger(engine: &DuckmixEngine) -> anyhow::Result<()> {
    let mut ducking = engine.subscribe_ducking();
    let mut status = engine.subscribe_status();

    thread::Builder::new()
        .name("duckmix-status-log".into())
        .spawn(move || loop {
            match status.blocking_recv() {
                Ok(ev) => info!(status = ?ev.status, detail = ?ev.detail, "engine status"),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        })?;

    thread::Builder::new()
        .name("duckmix-ducking-log".into())
        .spawn(move || loop {
            match ducking.blocking_recv() {
                Ok(ev) => info!(
                    target_volume = ev.target_volume,
                    reason = ?ev.reason,
                    remote = ev.remote_level,
                    mic = ev.mic_level,
                    "ducking target changed"
                ),
                Err(RecvError::Lagged(n)) => warn!("ducking log lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        })?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "duckmix_app=info,duckmix_core=info".into()),
        )
        .init();

    let cli = parse_args(std::env::args().skip(1))?;
    if cli.list_devices {
        print_devices();
        return Ok(());
    }

    let settings_path = cli.settings_path.clone().unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&settings_path);
    if let Some(music) = cli.music_path.clone() {
        settings.engine.music_path = Some(music);
    }
    if let Some(replay) = cli.replay_path.clone() {
        settings.remote_replay_path = Some(replay);
    }
    if cli.no_mic {
        settings.capture_microphone = false;
    }
    settings.normalize();

    if cli.save_settings {
        save_settings(&settings_path, &settings)
            .with_context(|| format!("writing {}", settings_path.display()))?;
        info!(path = %settings_path.display(), "settings saved");
    }

    let backend = CpalBackend::new(settings.preferred_output_device.clone());
    let engine = DuckmixEngine::new(settings.engine.clone(), backend)?;
    spawn_event_logger(&engine)?;

    engine.configure();
    engine.start_music();

    // Capture must stay on this thread; the cpal stream is not Send.
    let capture = if settings.capture_microphone {
        match AudioCapture::open_with_preference(&engine, settings.preferred_input_device.as_deref())
        {
            Ok(capture) => {
                info!(
                    sample_rate = capture.sample_rate,
                    channels = capture.channels,
                    "microphone capture running"
                );
                Some(capture)
            }
            Err(e) => {
                warn!("microphone unavailable, continuing without it: {e}");
                None
            }
        }
    } else {
        None
    };

    let tap = engine.attach();
    let deadline = cli.duration.map(|d| Instant::now() + d);

    if let Some(path) = settings.remote_replay_path.as_deref() {
        let voice = load_wav(path).with_context(|| format!("loading {}", path.display()))?;
        let blocks = split_blocks(&voice)?;
        thread::sleep(Duration::from_secs_f32(settings.replay_lead_in_secs));
        replay(&tap, blocks);
    }

    match deadline {
        Some(deadline) => {
            while Instant::now() < deadline {
                thread::sleep(Duration::from_millis(100));
            }
        }
        None if settings.remote_replay_path.is_some() => thread::sleep(Duration::from_secs(2)),
        None => loop {
            thread::sleep(Duration::from_secs(5));
            info!(diagnostics = ?engine.diagnostics_snapshot(), "engine diagnostics");
        },
    }

    if let Some(capture) = capture.as_ref() {
        capture.stop();
    }
    engine.stop();
    info!(diagnostics = ?engine.diagnostics_snapshot(), "final diagnostics");
    engine.shutdown();
    Ok(())
}
