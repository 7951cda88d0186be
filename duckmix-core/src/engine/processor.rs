//! The serial processing queue.
//!
//! One thread, one `Processor`, one `select!` loop over three sources:
//!
//! ```text
//! commands ──► handle()     (configure / start / attach / blocks / stop ...)
//! ticker   ──► tick()       (drain mic ring → step ducking → render)
//! gate     ──► open_gate()  (one-shot, armed by attach)
//! ```
//!
//! Timers are derived from processor state after every event: the ticker
//! runs exactly while the graph is running, and the gate timer exists
//! exactly while the gate is armed. Stopping therefore cancels both without
//! any bookkeeping in `stop()` itself.

use std::sync::{atomic::Ordering, Arc};
use std::time::{Duration, Instant};

use crossbeam_channel::{after, never, select, tick, Receiver, Sender};
use tracing::{debug, error, info, warn};

use super::{EngineConfig, EngineSignals, EngineSnapshot};
use crate::{
    audio::{normalize::FormatNormalizer, playback::PlaybackBackend},
    buffering::{AudioBlock, Consumer, Observer, SampleConsumer},
    ducking::DuckingController,
    error::Result,
    gate::{Admission, GatePhase, PendingVoice, VoiceGate},
    ipc::events::{ActivityEvent, ActivitySource, DuckingEvent, EngineStatus},
    level::{ActivityLevel, LevelDetector, PeakRmsDetector},
    mix::{GraphSettings, MixGraph, MusicAsset},
};

pub(crate) enum Command {
    Configure,
    StartMusic,
    Attach {
        generation: u64,
    },
    RemoteBlock {
        generation: u64,
        block: AudioBlock,
    },
    /// `generation` is `Some` when the flag comes from a tap's agent state.
    AgentSpeaking {
        generation: Option<u64>,
        speaking: bool,
    },
    InstallMicTap(MicTap),
    Stop,
    Snapshot(Sender<EngineSnapshot>),
    Shutdown,
}

/// Consumer side of the microphone ring.
pub(crate) struct MicTap {
    pub consumer: SampleConsumer,
    pub channels: u16,
    pub sample_rate: u32,
}

/// Everything the processing thread needs, moved in as one value.
pub(crate) struct ProcessorContext {
    pub config: EngineConfig,
    pub backend: Box<dyn PlaybackBackend>,
    pub music: MusicAsset,
    pub signals: EngineSignals,
}

pub(crate) struct Processor {
    config: EngineConfig,
    graph: MixGraph,
    normalizer: Option<FormatNormalizer>,
    detector: Box<dyn LevelDetector>,
    remote_level: ActivityLevel,
    mic_level: ActivityLevel,
    ducking: DuckingController,
    gate: VoiceGate,
    /// Generation of the current attachment, if any.
    attached: Option<u64>,
    mic: Option<MicTap>,
    mic_scratch: Vec<f32>,
    music: MusicAsset,
    /// Bumped on every successful start; the loop re-arms its ticker on change.
    run_epoch: u64,
    signals: EngineSignals,
}

impl Processor {
    pub(crate) fn new(ctx: ProcessorContext) -> Self {
        let ProcessorContext {
            config,
            backend,
            music,
            signals,
        } = ctx;

        let graph = MixGraph::new(
            backend,
            GraphSettings {
                channels: config.render_channels,
                fallback_sample_rate: config.fallback_sample_rate,
                output_latency: config.output_latency(),
                initial_gain: config.ducking.idle_volume,
            },
        );

        Self {
            graph,
            normalizer: None,
            detector: Box::new(PeakRmsDetector::default()),
            remote_level: ActivityLevel::new(config.remote_smoothing),
            mic_level: ActivityLevel::new(config.mic_smoothing),
            ducking: DuckingController::new(config.ducking),
            gate: VoiceGate::new(config.gate_delay()),
            attached: None,
            mic: None,
            mic_scratch: Vec::new(),
            music,
            run_epoch: 0,
            signals,
            config,
        }
    }

    pub(crate) fn handle(&mut self, command: Command, now: Instant) {
        match command {
            Command::Configure => {
                // Failures are published as status; nothing to propagate.
                let _ = self.configure();
            }
            Command::StartMusic => self.start_music(),
            Command::Attach { generation } => self.attach(generation, now),
            Command::RemoteBlock { generation, block } => self.remote_block(generation, &block),
            Command::AgentSpeaking {
                generation,
                speaking,
            } => self.agent_speaking(generation, speaking),
            Command::InstallMicTap(tap) => {
                debug!(
                    channels = tap.channels,
                    sample_rate = tap.sample_rate,
                    "microphone tap installed"
                );
                self.mic = Some(tap);
            }
            Command::Stop => self.stop(),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => self.shutdown(),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Bind the render format and create the normalizer. Idempotent.
    fn configure(&mut self) -> Result<()> {
        if self.normalizer.is_some() {
            return Ok(());
        }
        match self.graph.configure() {
            Ok(format) => {
                self.normalizer = Some(FormatNormalizer::new(
                    format,
                    self.config.min_conversion_frames,
                ));
                self.signals.set_status(EngineStatus::Configured, None);
                Ok(())
            }
            Err(e) => {
                error!("engine configuration failed: {e}");
                self.signals
                    .set_status(EngineStatus::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    fn start_music(&mut self) {
        if self.graph.lifecycle().running {
            self.stop();
        }
        if self.configure().is_err() {
            return;
        }
        let music = match self.normalizer.as_ref() {
            Some(normalizer) => self.music.prepare(normalizer),
            None => None,
        };

        if let Err(e) = self.graph.start() {
            error!("failed to open output: {e}");
            self.signals
                .set_status(EngineStatus::Error, Some(e.to_string()));
            return;
        }

        match music.map(|m| self.graph.schedule_music(m)) {
            Some(Ok(true)) => debug!("music loop scheduled"),
            Some(Ok(false)) => {}
            Some(Err(e)) => warn!("music loop not scheduled: {e}"),
            None => debug!("running without background music"),
        }

        self.run_epoch += 1;
        self.signals.set_status(EngineStatus::Running, None);
        info!("engine running");
    }

    fn stop(&mut self) {
        let was_running = self.graph.lifecycle().running;

        self.attached = None;
        self.gate.reset();
        if let Some(normalizer) = self.normalizer.as_mut() {
            normalizer.clear();
        }
        self.graph.stop();
        self.remote_level.reset();
        self.mic_level.reset();
        self.ducking.reset();
        self.discard_mic();

        if was_running {
            self.signals.set_status(EngineStatus::Stopped, None);
            info!("engine stopped");
        }
    }

    fn shutdown(&mut self) {
        self.stop();
        self.mic = None;
    }

    // ── Remote source ────────────────────────────────────────────────────────

    fn attach(&mut self, generation: u64, now: Instant) {
        if !self.graph.lifecycle().running {
            debug!(generation, "attach ignored: engine not running");
            return;
        }
        if let Some(normalizer) = self.normalizer.as_mut() {
            normalizer.clear();
        }
        self.attached = Some(generation);
        self.discard_mic();
        let opens_at = self.gate.arm(generation, now);
        info!(
            generation,
            delay_ms = opens_at.saturating_duration_since(now).as_millis() as u64,
            "remote source attached, voice gate armed"
        );
    }

    fn remote_block(&mut self, generation: u64, block: &AudioBlock) {
        let diagnostics = Arc::clone(self.signals.diagnostics());
        if !self.graph.lifecycle().running || self.attached != Some(generation) {
            diagnostics
                .remote_blocks_dropped
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Some(normalizer) = self.normalizer.as_mut() else {
            diagnostics
                .remote_blocks_dropped
                .fetch_add(1, Ordering::Relaxed);
            return;
        };

        let level = self.detector.level(block);
        let converted = match normalizer.normalize(block) {
            Ok(converted) => converted,
            Err(e) => {
                debug!("dropping remote block: {e}");
                diagnostics.conversion_errors.fetch_add(1, Ordering::Relaxed);
                diagnostics
                    .remote_blocks_dropped
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match self.gate.admit(
            generation,
            PendingVoice {
                block: converted,
                level,
            },
        ) {
            Admission::Buffered => {
                diagnostics
                    .remote_blocks_gated
                    .fetch_add(1, Ordering::Relaxed);
            }
            Admission::PassThrough(voice) => self.enqueue_voice(voice),
            Admission::Rejected(_) => {
                diagnostics
                    .remote_blocks_dropped
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Open the gate for `generation` and drain it in arrival order.
    pub(crate) fn open_gate(&mut self, generation: u64, now: Instant) {
        if !self.graph.lifecycle().running {
            return;
        }
        if let Some(drained) = self.gate.open(generation, now) {
            info!(generation, blocks = drained.len(), "voice gate open");
            for voice in drained {
                self.enqueue_voice(voice);
            }
        }
    }

    fn enqueue_voice(&mut self, voice: PendingVoice) {
        let smoothed = self.remote_level.update(voice.level);
        self.signals.publish_activity(ActivityEvent {
            seq: self.signals.next_seq(),
            source: ActivitySource::Remote,
            level: voice.level,
            smoothed,
        });

        let diagnostics = self.signals.diagnostics();
        match self.graph.schedule_voice(voice.block) {
            Ok(()) => {
                diagnostics
                    .remote_blocks_scheduled
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                debug!("voice block not scheduled: {e}");
                diagnostics
                    .remote_blocks_dropped
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        self.update_target();
    }

    fn agent_speaking(&mut self, generation: Option<u64>, speaking: bool) {
        if generation.is_some() && generation != self.attached {
            return;
        }
        self.ducking.set_agent_speaking(speaking);
        self.update_target();
    }

    // ── Microphone ───────────────────────────────────────────────────────────

    /// Pull every whole frame out of the mic ring and level it. Audio is
    /// discarded unless running with a remote source attached.
    fn drain_mic(&mut self) {
        let Some(tap) = self.mic.as_mut() else {
            return;
        };
        let ch = tap.channels.max(1) as usize;
        let frames = tap.consumer.occupied_len() / ch;
        if frames == 0 {
            return;
        }
        self.mic_scratch.resize(frames * ch, 0.0);
        let popped = tap.consumer.pop_slice(&mut self.mic_scratch[..frames * ch]);
        let sample_rate = tap.sample_rate;
        let channels = tap.channels;

        if self.attached.is_none() || !self.graph.lifecycle().running {
            return;
        }
        let block = AudioBlock::interleaved_f32(
            sample_rate,
            channels,
            self.mic_scratch[..popped].to_vec(),
        );
        self.process_mic_block(&block);
    }

    fn process_mic_block(&mut self, block: &AudioBlock) {
        let Some(level) = self.graph.analyze_mic(block, self.detector.as_ref()) else {
            return;
        };
        let smoothed = self.mic_level.update(level);
        self.signals
            .diagnostics()
            .mic_blocks
            .fetch_add(1, Ordering::Relaxed);
        self.signals.publish_activity(ActivityEvent {
            seq: self.signals.next_seq(),
            source: ActivitySource::Microphone,
            level,
            smoothed,
        });
        self.update_target();
    }

    fn discard_mic(&mut self) {
        if let Some(tap) = self.mic.as_mut() {
            let pending = tap.consumer.occupied_len();
            tap.consumer.skip(pending);
        }
    }

    // ── Ducking ──────────────────────────────────────────────────────────────

    fn update_target(&mut self) {
        let remote = self.remote_level.value();
        let mic = self.mic_level.value();
        if self.ducking.update_target(remote, mic) {
            let state = self.ducking.state();
            self.signals.publish_ducking(DuckingEvent {
                seq: self.signals.next_seq(),
                target_volume: state.target_volume,
                current_volume: state.current_volume,
                reason: self.ducking.reason(),
                remote_level: remote,
                mic_level: mic,
            });
        }
    }

    /// One ducking step plus a render pass.
    pub(crate) fn tick(&mut self) {
        if !self.graph.lifecycle().running {
            return;
        }
        self.drain_mic();
        self.update_target();
        let volume = self.ducking.step();
        self.graph.set_music_gain(volume);
        self.graph.render();

        let diagnostics = self.signals.diagnostics();
        diagnostics.ticks.fetch_add(1, Ordering::Relaxed);
        diagnostics
            .frames_rendered
            .store(self.graph.frames_rendered() as usize, Ordering::Relaxed);
        diagnostics
            .underruns
            .store(self.graph.underruns(), Ordering::Relaxed);
    }

    // ── Timer derivation ─────────────────────────────────────────────────────

    /// `Some(epoch)` while the tick timer should run.
    pub(crate) fn tick_epoch(&self) -> Option<u64> {
        self.graph.lifecycle().running.then_some(self.run_epoch)
    }

    /// The pending gate-open deadline, if any.
    pub(crate) fn gate_deadline(&self) -> Option<(u64, Instant)> {
        match self.gate.phase() {
            GatePhase::Armed {
                generation,
                opens_at,
            } if self.graph.lifecycle().running => Some((generation, opens_at)),
            _ => None,
        }
    }

    pub(crate) fn tick_interval(&self) -> Duration {
        self.config.tick_interval()
    }

    pub(crate) fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            lifecycle: self.graph.lifecycle(),
            render_format: self.graph.render_format(),
            ducking: self.ducking.state(),
            reason: self.ducking.reason(),
            remote_level: self.remote_level.value(),
            mic_level: self.mic_level.value(),
            gate: self.gate.phase().kind(),
            gate_pending: self.gate.pending_len(),
            attached_generation: self.attached,
            converter_count: self
                .normalizer
                .as_ref()
                .map_or(0, FormatNormalizer::converter_count),
            music_loaded: self.music.is_loaded(),
            music_playing: self.graph.is_music_playing(),
            queued_voice_frames: self.graph.voice().queued_frames(),
            voice_blocks_scheduled: self.graph.voice().scheduled_blocks(),
            applied_gain: self.graph.applied_gain(),
        }
    }
}

/// Processing thread body. Returns after `Shutdown` or when every sender
/// is gone.
pub(crate) fn run(ctx: ProcessorContext, commands: Receiver<Command>) {
    let mut processor = Processor::new(ctx);
    info!("processing queue started");

    let mut ticker: Receiver<Instant> = never();
    let mut ticking: Option<u64> = None;
    let mut gate_timer: Receiver<Instant> = never();
    let mut gate_key: Option<(u64, Instant)> = None;

    loop {
        select! {
            recv(commands) -> msg => match msg {
                Ok(Command::Shutdown) | Err(_) => break,
                Ok(command) => processor.handle(command, Instant::now()),
            },
            recv(ticker) -> _ => processor.tick(),
            recv(gate_timer) -> _ => {
                // Cleared so an early wake-up re-arms below.
                if let Some((generation, _)) = gate_key.take() {
                    processor.open_gate(generation, Instant::now());
                }
            },
        }

        let want_tick = processor.tick_epoch();
        if want_tick != ticking {
            ticker = match want_tick {
                Some(_) => tick(processor.tick_interval()),
                None => never(),
            };
            ticking = want_tick;
        }

        let want_gate = processor.gate_deadline();
        if want_gate != gate_key {
            gate_timer = match want_gate {
                Some((_, opens_at)) => after(opens_at.saturating_duration_since(Instant::now())),
                None => never(),
            };
            gate_key = want_gate;
        }
    }

    processor.shutdown();
    info!("processing queue exited");
}
