use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use duckmix_core::buffering::{AudioBlock, RenderFormat, SampleBuffer};
use duckmix_core::ducking::DuckReason;
use duckmix_core::error::Result;
use duckmix_core::gate::GatePhaseKind;
use duckmix_core::{
    DuckmixEngine, EngineConfig, EngineStatus, MusicAsset, NullBackend, OutputSink,
    PlaybackBackend, PlaybackStream,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

/// Backend that hands its sink to the test so rendered audio can be pulled.
struct ScriptedBackend {
    sample_rate: u32,
    sink: Arc<Mutex<Option<OutputSink>>>,
}

struct ScriptedStream {
    sink: Arc<Mutex<Option<OutputSink>>>,
}

impl PlaybackStream for ScriptedStream {
    fn stop(&mut self) {
        self.sink.lock().take();
    }
}

impl PlaybackBackend for ScriptedBackend {
    fn output_sample_rate(&mut self) -> Result<u32> {
        Ok(self.sample_rate)
    }

    fn open(&mut self, _format: RenderFormat, sink: OutputSink) -> Result<Box<dyn PlaybackStream>> {
        *self.sink.lock() = Some(sink);
        Ok(Box::new(ScriptedStream {
            sink: Arc::clone(&self.sink),
        }))
    }
}

fn recv_with_timeout<T: Clone>(
    rx: &mut broadcast::Receiver<T>,
    timeout: Duration,
    mut accept: impl FnMut(&T) -> bool,
) -> T {
    let start = Instant::now();
    loop {
        match rx.try_recv() {
            Ok(ev) if accept(&ev) => return ev,
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    panic!("timed out waiting for event");
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(TryRecvError::Closed) => panic!("event channel closed unexpectedly"),
        }
    }
}

fn write_music(path: &std::path::Path, value: f32, frames: usize) {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: 48_000,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
    for _ in 0..frames * 2 {
        writer.write_sample(value).expect("write sample");
    }
    writer.finalize().expect("finalize wav");
}

fn test_config() -> EngineConfig {
    EngineConfig {
        gate_delay_ms: 60,
        ..EngineConfig::default()
    }
}

#[test]
fn music_plays_at_idle_volume_and_ducks_under_remote_voice() {
    let dir = tempfile::tempdir().expect("tempdir");
    let music_path = dir.path().join("loop.wav");
    write_music(&music_path, 0.5, 4_800);

    let sink = Arc::new(Mutex::new(None));
    let backend = ScriptedBackend {
        sample_rate: 48_000,
        sink: Arc::clone(&sink),
    };
    let config = EngineConfig {
        music_path: Some(music_path),
        ..test_config()
    };
    let engine = DuckmixEngine::new(config, backend).expect("engine");
    let mut status = engine.subscribe_status();
    let mut ducking = engine.subscribe_ducking();

    engine.configure();
    engine.start_music();
    recv_with_timeout(&mut status, Duration::from_secs(2), |ev| {
        ev.status == EngineStatus::Running
    });

    // Give the ticker a few rounds to fill the render ring.
    thread::sleep(Duration::from_millis(100));
    let mut out = vec![0.0f32; 960];
    let filled = sink
        .lock()
        .as_mut()
        .expect("output stream open")
        .fill(&mut out);
    assert_eq!(filled, out.len());
    for sample in &out {
        assert!(
            (sample - 0.5 * 0.35).abs() < 1e-3,
            "music sample {sample} not at idle gain"
        );
    }

    let tap = engine.attach();
    for _ in 0..5 {
        tap.deliver(AudioBlock::interleaved_f32(24_000, 1, vec![0.05; 480]));
    }

    let event = recv_with_timeout(&mut ducking, Duration::from_secs(2), |ev| {
        ev.reason == DuckReason::Agent
    });
    assert!((event.target_volume - 0.10).abs() < 1e-6);

    let snapshot = engine.snapshot().expect("snapshot");
    assert!(snapshot.lifecycle.running);
    assert!(snapshot.music_loaded);
    assert!(snapshot.music_playing);
    assert_eq!(snapshot.gate, GatePhaseKind::Open);
    assert_eq!(snapshot.attached_generation, Some(tap.generation()));
    assert_eq!(snapshot.voice_blocks_scheduled, 5);
    assert_eq!(snapshot.converter_count, 1);

    engine.shutdown();
    assert!(engine.snapshot().is_none());
}

#[test]
fn reattach_discards_blocks_from_the_previous_tap() {
    let engine =
        DuckmixEngine::with_music(test_config(), NullBackend::default(), MusicAsset::none())
            .expect("engine");
    engine.start_music();

    let first = engine.attach();
    let second = engine.attach();
    assert!(second.generation() > first.generation());

    first.deliver(AudioBlock::interleaved_f32(48_000, 2, vec![0.2; 960]));
    second.deliver(AudioBlock::interleaved_f32(48_000, 2, vec![0.2; 960]));

    let snapshot = engine.snapshot().expect("snapshot");
    assert_eq!(snapshot.attached_generation, Some(second.generation()));
    assert_eq!(snapshot.gate, GatePhaseKind::Armed);
    assert_eq!(snapshot.gate_pending, 1);

    let diagnostics = engine.diagnostics_snapshot();
    assert_eq!(diagnostics.remote_blocks_received, 2);
    assert_eq!(diagnostics.remote_blocks_dropped, 1);
    assert_eq!(diagnostics.remote_blocks_gated, 1);
}

#[test]
fn intercept_silences_transport_playback() {
    let engine = DuckmixEngine::new(test_config(), NullBackend::default()).expect("engine");
    engine.start_music();
    let tap = engine.attach();

    let mut block = AudioBlock::interleaved_f32(48_000, 1, vec![0.3; 480]);
    tap.intercept(&mut block);
    assert_eq!(block.data, SampleBuffer::InterleavedF32(vec![0.0; 480]));

    let snapshot = engine.snapshot().expect("snapshot");
    assert_eq!(snapshot.gate_pending, 1);
}

#[test]
fn stop_returns_to_configured_and_ignores_late_blocks() {
    let engine = DuckmixEngine::new(test_config(), NullBackend::default()).expect("engine");
    let mut status = engine.subscribe_status();

    engine.start_music();
    let tap = engine.attach();
    engine.stop();
    tap.deliver(AudioBlock::interleaved_f32(48_000, 2, vec![0.2; 960]));

    let snapshot = engine.snapshot().expect("snapshot");
    assert!(snapshot.lifecycle.configured);
    assert!(!snapshot.lifecycle.running);
    assert_eq!(snapshot.attached_generation, None);
    assert_eq!(snapshot.gate, GatePhaseKind::Idle);
    assert_eq!(engine.status(), EngineStatus::Stopped);

    let seen: Vec<EngineStatus> = std::iter::from_fn(|| status.try_recv().ok())
        .map(|ev| ev.status)
        .collect();
    assert_eq!(
        seen,
        vec![
            EngineStatus::Configured,
            EngineStatus::Running,
            EngineStatus::Stopped
        ]
    );
}

#[test]
fn output_failure_reports_error_and_stays_configured() {
    let engine =
        DuckmixEngine::new(test_config(), NullBackend::failing(44_100)).expect("engine");
    engine.start_music();

    let snapshot = engine.snapshot().expect("snapshot");
    assert!(snapshot.lifecycle.configured);
    assert!(!snapshot.lifecycle.running);
    assert_eq!(
        snapshot.render_format,
        Some(RenderFormat::new(44_100, 2))
    );
    assert_eq!(engine.status(), EngineStatus::Error);
}

#[test]
fn missing_music_file_still_runs() {
    let config = EngineConfig {
        music_path: Some("/nonexistent/loop.wav".into()),
        ..test_config()
    };
    let engine = DuckmixEngine::new(config, NullBackend::default()).expect("engine");
    engine.start_music();

    let snapshot = engine.snapshot().expect("snapshot");
    assert!(snapshot.lifecycle.running);
    assert!(!snapshot.music_playing);
}

#[test]
fn malformed_remote_block_leaves_engine_responsive() {
    let engine = DuckmixEngine::new(test_config(), NullBackend::default()).expect("engine");
    engine.start_music();
    let tap = engine.attach();

    let mut broken = AudioBlock::interleaved_f32(48_000, 2, vec![0.4; 64]);
    broken.frames = usize::MAX / 2 + 1;
    tap.deliver(broken);

    let snapshot = engine.snapshot().expect("processing queue still answers");
    assert!(snapshot.lifecycle.running);
    assert_eq!(engine.diagnostics_snapshot().remote_blocks_dropped, 1);

    engine.stop();
    engine.start_music();
    assert!(engine.snapshot().expect("snapshot").lifecycle.running);
}
