//! `DuckmixEngine`: the owned handle to one mixing engine.
//!
//! ## Lifecycle
//!
//! ```text
//! DuckmixEngine::new()       → processing thread spawned, status = Idle
//!     └─► configure()        → render format bound, status = Configured
//!         └─► start_music()  → output open, loop + tick running, status = Running
//!             └─► attach()   → RemoteTap, voice gate armed
//!             └─► stop()     → everything transient reset, status = Stopped
//! ```
//!
//! ## Threading
//!
//! Every public operation is a non-blocking send onto one serial processing
//! queue (a dedicated thread). That thread owns all mutable engine state and
//! the playback stream; `cpal::Stream` is `!Send`, so the stream is opened and
//! dropped there. Realtime audio callbacks talk to the queue only through
//! SPSC rings.

pub mod input;
mod processor;

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    audio::playback::PlaybackBackend,
    buffering::{create_sample_ring, RenderFormat},
    ducking::{DuckReason, DuckingConfig, DuckingState},
    error::{DuckmixError, Result},
    gate::GatePhaseKind,
    ipc::events::{ActivityEvent, DuckingEvent, EngineStatus, EngineStatusEvent},
    mix::{EngineLifecycle, MusicAsset, FALLBACK_SAMPLE_RATE},
};

pub use input::{AgentState, MicInput, RemoteTap};
use processor::{Command, MicTap, ProcessorContext};

/// Broadcast channel capacity per event kind.
const BROADCAST_CAP: usize = 256;

/// How long `snapshot()` waits for the processing queue.
const SNAPSHOT_TIMEOUT: Duration = Duration::from_millis(500);

/// Configuration for `DuckmixEngine`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct EngineConfig {
    pub ducking: DuckingConfig,
    /// Low-pass α for the remote level. Higher reacts faster.
    pub remote_smoothing: f32,
    /// Low-pass α for the microphone level.
    pub mic_smoothing: f32,
    /// Warm-up window after `attach()` before remote audio is played.
    pub gate_delay_ms: u64,
    /// Ducking step and render period.
    pub tick_interval_ms: u64,
    /// Channel count of the render format.
    pub render_channels: u16,
    /// Render rate when the output device reports none.
    pub fallback_sample_rate: u32,
    /// Render-ahead bound. Must exceed the tick interval.
    pub output_latency_ms: u64,
    /// Minimum destination capacity for a converted block, in frames.
    pub min_conversion_frames: usize,
    /// WAV file looped as background music. `None` plays no music.
    pub music_path: Option<PathBuf>,
    /// Microphone ring size in samples.
    pub mic_ring_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ducking: DuckingConfig::default(),
            remote_smoothing: 0.3,
            mic_smoothing: 0.3,
            gate_delay_ms: 1_000,
            tick_interval_ms: 20,
            render_channels: 2,
            fallback_sample_rate: FALLBACK_SAMPLE_RATE,
            output_latency_ms: 60,
            min_conversion_frames: 1_024,
            music_path: None,
            mic_ring_capacity: 48_000,
        }
    }
}

impl EngineConfig {
    /// Clamp every field into a usable range.
    pub fn normalize(&mut self) {
        self.ducking.normalize();
        self.remote_smoothing = clamp_alpha(self.remote_smoothing);
        self.mic_smoothing = clamp_alpha(self.mic_smoothing);
        self.gate_delay_ms = self.gate_delay_ms.min(10_000);
        self.tick_interval_ms = self.tick_interval_ms.clamp(5, 200);
        self.render_channels = self.render_channels.clamp(1, 8);
        if !(8_000..=192_000).contains(&self.fallback_sample_rate) {
            self.fallback_sample_rate = FALLBACK_SAMPLE_RATE;
        }
        self.output_latency_ms = self
            .output_latency_ms
            .clamp(self.tick_interval_ms * 2, 1_000);
        self.min_conversion_frames = self.min_conversion_frames.clamp(1, 65_536);
        self.mic_ring_capacity = self.mic_ring_capacity.clamp(1_024, 1 << 20);
        if self
            .music_path
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            self.music_path = None;
        }
    }

    pub fn gate_delay(&self) -> Duration {
        Duration::from_millis(self.gate_delay_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn output_latency(&self) -> Duration {
        Duration::from_millis(self.output_latency_ms)
    }
}

fn clamp_alpha(v: f32) -> f32 {
    if v.is_finite() && v > 0.0 {
        v.min(1.0)
    } else {
        0.3
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Lifetime counters, shared between the handle, the taps and the queue.
#[derive(Debug, Default)]
pub struct EngineDiagnostics {
    pub remote_blocks_received: AtomicUsize,
    pub remote_blocks_gated: AtomicUsize,
    pub remote_blocks_scheduled: AtomicUsize,
    pub remote_blocks_dropped: AtomicUsize,
    pub conversion_errors: AtomicUsize,
    pub mic_blocks: AtomicUsize,
    pub mic_frames_dropped: AtomicUsize,
    pub ticks: AtomicUsize,
    pub frames_rendered: AtomicUsize,
    pub underruns: AtomicUsize,
}

impl EngineDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            remote_blocks_received: self.remote_blocks_received.load(Ordering::Relaxed),
            remote_blocks_gated: self.remote_blocks_gated.load(Ordering::Relaxed),
            remote_blocks_scheduled: self.remote_blocks_scheduled.load(Ordering::Relaxed),
            remote_blocks_dropped: self.remote_blocks_dropped.load(Ordering::Relaxed),
            conversion_errors: self.conversion_errors.load(Ordering::Relaxed),
            mic_blocks: self.mic_blocks.load(Ordering::Relaxed),
            mic_frames_dropped: self.mic_frames_dropped.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            frames_rendered: self.frames_rendered.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub remote_blocks_received: usize,
    pub remote_blocks_gated: usize,
    pub remote_blocks_scheduled: usize,
    pub remote_blocks_dropped: usize,
    pub conversion_errors: usize,
    pub mic_blocks: usize,
    pub mic_frames_dropped: usize,
    pub ticks: usize,
    pub frames_rendered: usize,
    pub underruns: usize,
}

/// Point-in-time view of the processing queue's state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub lifecycle: EngineLifecycle,
    pub render_format: Option<RenderFormat>,
    pub ducking: DuckingState,
    pub reason: DuckReason,
    pub remote_level: f32,
    pub mic_level: f32,
    pub gate: GatePhaseKind,
    pub gate_pending: usize,
    pub attached_generation: Option<u64>,
    pub converter_count: usize,
    pub music_loaded: bool,
    pub music_playing: bool,
    pub queued_voice_frames: usize,
    pub voice_blocks_scheduled: u64,
    pub applied_gain: f32,
}

// ---------------------------------------------------------------------------
// Status + event fan-out
// ---------------------------------------------------------------------------

/// Event senders and shared status, cloned into the processing queue.
#[derive(Clone)]
pub(crate) struct EngineSignals {
    status: Arc<Mutex<EngineStatus>>,
    status_tx: broadcast::Sender<EngineStatusEvent>,
    ducking_tx: broadcast::Sender<DuckingEvent>,
    activity_tx: broadcast::Sender<ActivityEvent>,
    seq: Arc<AtomicU64>,
    diagnostics: Arc<EngineDiagnostics>,
}

impl EngineSignals {
    pub(crate) fn new() -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (ducking_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (activity_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            status_tx,
            ducking_tx,
            activity_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(EngineDiagnostics::default()),
        }
    }

    pub(crate) fn set_status(&self, status: EngineStatus, detail: Option<String>) {
        *self.status.lock() = status;
        let _ = self.status_tx.send(EngineStatusEvent { status, detail });
    }

    pub(crate) fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn publish_ducking(&self, event: DuckingEvent) {
        let _ = self.ducking_tx.send(event);
    }

    pub(crate) fn publish_activity(&self, event: ActivityEvent) {
        let _ = self.activity_tx.send(event);
    }

    pub(crate) fn diagnostics(&self) -> &Arc<EngineDiagnostics> {
        &self.diagnostics
    }
}

// ---------------------------------------------------------------------------
// Engine handle
// ---------------------------------------------------------------------------

/// The top-level engine handle.
///
/// `DuckmixEngine` is `Send + Sync`. Construct one per process and pass it
/// (or an `Arc` of it) to whichever session component needs it.
pub struct DuckmixEngine {
    config: EngineConfig,
    commands: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Last attachment generation handed out.
    generation: AtomicU64,
    signals: EngineSignals,
}

impl DuckmixEngine {
    /// Spawn the processing queue. Music comes from `config.music_path`.
    ///
    /// # Errors
    /// `Io` if the processing thread cannot be spawned.
    pub fn new(config: EngineConfig, backend: impl PlaybackBackend) -> Result<Self> {
        let music = match &config.music_path {
            Some(path) => MusicAsset::from_path(path),
            None => MusicAsset::none(),
        };
        Self::with_music(config, backend, music)
    }

    /// Like `new`, with an explicit background loop.
    pub fn with_music(
        mut config: EngineConfig,
        backend: impl PlaybackBackend,
        music: MusicAsset,
    ) -> Result<Self> {
        config.normalize();
        let signals = EngineSignals::new();
        let (commands, rx) = unbounded();

        let ctx = ProcessorContext {
            config: config.clone(),
            backend: Box::new(backend),
            music,
            signals: signals.clone(),
        };
        let worker = std::thread::Builder::new()
            .name("duckmix-processing".into())
            .spawn(move || processor::run(ctx, rx))?;

        info!("engine created");
        Ok(Self {
            config,
            commands,
            worker: Mutex::new(Some(worker)),
            generation: AtomicU64::new(0),
            signals,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Bind the render format. Idempotent.
    pub fn configure(&self) {
        self.send(Command::Configure);
    }

    /// (Re)start output, the music loop and the ducking tick.
    pub fn start_music(&self) {
        self.send(Command::StartMusic);
    }

    /// Attach a new remote source. Ignored by the queue unless running.
    pub fn attach(&self) -> RemoteTap {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.send(Command::Attach { generation });
        RemoteTap::new(
            generation,
            self.commands.clone(),
            Arc::clone(self.signals.diagnostics()),
        )
    }

    pub fn set_agent_speaking(&self, speaking: bool) {
        self.send(Command::AgentSpeaking {
            generation: None,
            speaking,
        });
    }

    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    /// Create a microphone ring for a capture callback delivering
    /// `channels`-interleaved audio at `sample_rate`. Replaces any previous one.
    pub fn mic_input(&self, channels: u16, sample_rate: u32) -> MicInput {
        let channels = channels.max(1);
        let capacity = (self.config.mic_ring_capacity / channels as usize).max(1) * channels as usize;
        let (producer, consumer) = create_sample_ring(capacity);
        self.send(Command::InstallMicTap(MicTap {
            consumer,
            channels,
            sample_rate,
        }));
        MicInput::new(
            producer,
            channels,
            sample_rate,
            Arc::clone(self.signals.diagnostics()),
        )
    }

    /// Stop and join the processing thread. Later calls are no-ops.
    pub fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let _ = self.commands.send(Command::Shutdown);
        if worker.join().is_err() {
            warn!("processing thread panicked");
        }
        info!("engine shut down");
    }

    /// Current engine status (snapshot).
    pub fn status(&self) -> EngineStatus {
        self.signals.status()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.signals.status_tx.subscribe()
    }

    pub fn subscribe_ducking(&self) -> broadcast::Receiver<DuckingEvent> {
        self.signals.ducking_tx.subscribe()
    }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<ActivityEvent> {
        self.signals.activity_tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.signals.diagnostics().snapshot()
    }

    /// Ask the processing queue for its state. `None` if it does not
    /// answer in time or has shut down.
    pub fn snapshot(&self) -> Option<EngineSnapshot> {
        let (tx, rx) = bounded(1);
        self.commands.send(Command::Snapshot(tx)).ok()?;
        rx.recv_timeout(SNAPSHOT_TIMEOUT).ok()
    }

    fn send(&self, command: Command) {
        let sent = self
            .commands
            .send(command)
            .map_err(|_| DuckmixError::EngineGone);
        if let Err(e) = sent {
            warn!("command dropped: {e}");
        }
    }
}

impl Drop for DuckmixEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_deserializes_partial_json_with_defaults() {
        let json = r#"{ "gateDelayMs": 250, "ducking": { "idleVolume": 0.5 } }"#;
        let config: EngineConfig = serde_json::from_str(json).expect("parse config");
        assert_eq!(config.gate_delay(), Duration::from_millis(250));
        assert_eq!(config.ducking.idle_volume, 0.5);
        assert_eq!(config.ducking.ai_speaking_volume, 0.10);
        assert_eq!(config.tick_interval_ms, 20);
    }

    #[test]
    fn normalize_clamps_out_of_range_values() {
        let mut config = EngineConfig {
            remote_smoothing: f32::NAN,
            mic_smoothing: 4.0,
            tick_interval_ms: 0,
            output_latency_ms: 1,
            render_channels: 0,
            fallback_sample_rate: 7,
            music_path: Some(PathBuf::new()),
            ..EngineConfig::default()
        };
        config.normalize();
        assert_eq!(config.remote_smoothing, 0.3);
        assert_eq!(config.mic_smoothing, 1.0);
        assert_eq!(config.tick_interval_ms, 5);
        assert_eq!(config.output_latency_ms, 10);
        assert_eq!(config.render_channels, 1);
        assert_eq!(config.fallback_sample_rate, FALLBACK_SAMPLE_RATE);
        assert!(config.music_path.is_none());
    }

    #[test]
    fn diagnostics_snapshot_reads_counters() {
        let diagnostics = EngineDiagnostics::default();
        diagnostics.ticks.fetch_add(3, Ordering::Relaxed);
        diagnostics.conversion_errors.fetch_add(1, Ordering::Relaxed);
        let snap = diagnostics.snapshot();
        assert_eq!(snap.ticks, 3);
        assert_eq!(snap.conversion_errors, 1);
        assert_eq!(snap.mic_blocks, 0);
    }
}
