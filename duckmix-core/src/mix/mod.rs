//! Mix graph: music loop + remote voice summed into one output, plus an
//! analysis-only microphone tap.
//!
//! ## Lifecycle
//!
//! ```text
//! Unconfigured ──configure()──► Configured ──start()──► Running
//!                                   ▲                      │
//!                                   └────────stop()────────┘
//! ```
//!
//! `configure()` binds the render format once and is a no-op afterwards.
//! `start()` on a running graph performs a full `stop()` first.
//!
//! ## Rendering
//!
//! The graph renders ahead into the output ring on the processing queue.
//! Each `render()` tops the ring up to its capacity, so the ring size
//! bounds output latency. The music gain is interpolated from the value
//! used for the previous span to the one most recently set through
//! `set_music_gain()`.

pub mod channels;
pub mod music;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::audio::playback::{OutputSink, PlaybackBackend, PlaybackStream};
use crate::buffering::{
    create_sample_ring, AudioBlock, Observer, Producer, RenderFormat, SampleProducer,
};
use crate::error::{DuckmixError, Result};
use crate::level::LevelDetector;

pub use channels::{AnalysisTap, MusicChannel, VoiceChannel};
pub use music::{load_wav, MusicAsset};

/// Render rate used when the output device does not report one.
pub const FALLBACK_SAMPLE_RATE: u32 = 48_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineLifecycle {
    /// Set once by `configure()`, never cleared.
    pub configured: bool,
    pub running: bool,
}

/// Output-side settings for the graph.
#[derive(Debug, Clone, Copy)]
pub struct GraphSettings {
    pub channels: u16,
    pub fallback_sample_rate: u32,
    /// Render-ahead bound; sizes the output ring.
    pub output_latency: Duration,
    /// Music gain right after configure or stop.
    pub initial_gain: f32,
}

pub struct MixGraph {
    backend: Box<dyn PlaybackBackend>,
    settings: GraphSettings,
    format: Option<RenderFormat>,
    lifecycle: EngineLifecycle,
    music: MusicChannel,
    voice: VoiceChannel,
    mic_tap: AnalysisTap,
    stream: Option<Box<dyn PlaybackStream>>,
    producer: Option<SampleProducer>,
    scratch: Vec<f32>,
    gain: f32,
    applied_gain: f32,
    underruns: Arc<AtomicUsize>,
    frames_rendered: u64,
}

impl MixGraph {
    pub fn new(backend: Box<dyn PlaybackBackend>, settings: GraphSettings) -> Self {
        Self {
            backend,
            settings,
            format: None,
            lifecycle: EngineLifecycle::default(),
            music: MusicChannel::default(),
            voice: VoiceChannel::default(),
            mic_tap: AnalysisTap::default(),
            stream: None,
            producer: None,
            scratch: Vec::new(),
            gain: settings.initial_gain,
            applied_gain: settings.initial_gain,
            underruns: Arc::new(AtomicUsize::new(0)),
            frames_rendered: 0,
        }
    }

    /// Bind the render format from the output device. Idempotent.
    ///
    /// # Errors
    /// `Configuration` if the device cannot be queried.
    pub fn configure(&mut self) -> Result<RenderFormat> {
        if let Some(format) = self.format {
            return Ok(format);
        }

        let reported = self
            .backend
            .output_sample_rate()
            .map_err(|e| DuckmixError::Configuration(e.to_string()))?;
        let sample_rate = if reported > 0 {
            reported
        } else {
            warn!(
                fallback = self.settings.fallback_sample_rate,
                "output device reported no sample rate"
            );
            self.settings.fallback_sample_rate
        };

        let format = RenderFormat::new(sample_rate, self.settings.channels.max(1));
        info!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            "render format bound"
        );
        self.format = Some(format);
        self.lifecycle.configured = true;
        self.gain = self.settings.initial_gain;
        self.applied_gain = self.settings.initial_gain;
        Ok(format)
    }

    /// Open the output stream and mark the graph running.
    ///
    /// # Errors
    /// `NotConfigured` before `configure()`; backend errors if the output
    /// cannot be opened, in which case the graph stays configured and stopped.
    pub fn start(&mut self) -> Result<()> {
        if self.lifecycle.running {
            self.stop();
        }
        let format = self.format.ok_or(DuckmixError::NotConfigured)?;

        let capacity =
            format.frames_for(self.settings.output_latency).max(1) * format.channels as usize;
        let (producer, consumer) = create_sample_ring(capacity);
        let sink = OutputSink::new(consumer, Arc::clone(&self.underruns));

        let stream = self.backend.open(format, sink)?;
        self.stream = Some(stream);
        self.producer = Some(producer);
        self.lifecycle.running = true;
        debug!(ring_samples = capacity, "output opened");
        Ok(())
    }

    /// Halt output and drop every scheduled buffer. Safe when not running.
    pub fn stop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
        }
        self.producer = None;
        self.music.stop();
        self.voice.reset();
        self.mic_tap.reset();
        self.gain = self.settings.initial_gain;
        self.applied_gain = self.settings.initial_gain;
        if self.lifecycle.running {
            debug!("mix graph stopped");
        }
        self.lifecycle.running = false;
    }

    /// Loop `buffer` on the music channel unless it is already playing.
    ///
    /// Returns `Ok(true)` if the loop was (re)scheduled.
    pub fn schedule_music(&mut self, buffer: Arc<AudioBlock>) -> Result<bool> {
        let format = self.running_format()?;
        if buffer.format() != format.block_format() {
            return Err(DuckmixError::UnsupportedFormat(format!(
                "music loop is {:?}, render format is {:?}",
                buffer.format(),
                format
            )));
        }
        buffer.validate()?;
        if self.music.is_playing() {
            return Ok(false);
        }
        self.music.schedule(buffer);
        Ok(true)
    }

    /// Queue a render-format voice block behind any already queued.
    pub fn schedule_voice(&mut self, block: AudioBlock) -> Result<()> {
        let format = self.running_format()?;
        if block.format() != format.block_format() {
            return Err(DuckmixError::UnsupportedFormat(format!(
                "voice block is {:?}, render format is {:?}",
                block.format(),
                format
            )));
        }
        block.validate()?;
        self.voice.schedule(block);
        Ok(())
    }

    /// Level a microphone block on the analysis tap. `None` when not running.
    pub fn analyze_mic(&mut self, block: &AudioBlock, detector: &dyn LevelDetector) -> Option<f32> {
        if !self.lifecycle.running {
            return None;
        }
        Some(self.mic_tap.analyze(block, detector))
    }

    /// Gain the music channel should reach by the end of the next render.
    pub fn set_music_gain(&mut self, gain: f32) {
        self.gain = gain.clamp(0.0, 1.0);
    }

    /// Render into the output ring until it is full. Returns frames rendered.
    pub fn render(&mut self) -> usize {
        if !self.lifecycle.running {
            return 0;
        }
        let Some(format) = self.format else {
            return 0;
        };
        let Some(producer) = self.producer.as_mut() else {
            return 0;
        };
        let channels = format.channels as usize;
        let frames = producer.vacant_len() / channels;
        if frames == 0 {
            return 0;
        }

        self.scratch.clear();
        self.scratch.resize(frames * channels, 0.0);
        self.music
            .mix_into(&mut self.scratch, channels, self.applied_gain, self.gain);
        self.voice.mix_into(&mut self.scratch, channels);
        for s in self.scratch.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }

        producer.push_slice(&self.scratch);
        self.applied_gain = self.gain;
        self.frames_rendered += frames as u64;
        frames
    }

    fn running_format(&self) -> Result<RenderFormat> {
        let format = self.format.ok_or(DuckmixError::NotConfigured)?;
        if !self.lifecycle.running {
            return Err(DuckmixError::NotRunning);
        }
        Ok(format)
    }

    pub fn lifecycle(&self) -> EngineLifecycle {
        self.lifecycle
    }

    pub fn render_format(&self) -> Option<RenderFormat> {
        self.format
    }

    pub fn is_music_playing(&self) -> bool {
        self.music.is_playing()
    }

    pub fn voice(&self) -> &VoiceChannel {
        &self.voice
    }

    pub fn mic_tap(&self) -> &AnalysisTap {
        &self.mic_tap
    }

    /// Gain used for the most recent render span.
    pub fn applied_gain(&self) -> f32 {
        self.applied_gain
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub fn underruns(&self) -> usize {
        self.underruns.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::playback::NullBackend;
    use crate::level::PeakRmsDetector;
    use approx::assert_relative_eq;

    fn settings() -> GraphSettings {
        GraphSettings {
            channels: 2,
            fallback_sample_rate: FALLBACK_SAMPLE_RATE,
            output_latency: Duration::from_millis(10),
            initial_gain: 0.35,
        }
    }

    fn graph(rate: u32) -> MixGraph {
        MixGraph::new(Box::new(NullBackend::new(rate)), settings())
    }

    #[test]
    fn configure_is_idempotent() {
        let mut g = graph(44_100);
        let first = g.configure().expect("configure");
        let second = g.configure().expect("configure again");
        assert_eq!(first, second);
        assert_eq!(first, RenderFormat::new(44_100, 2));
        assert!(g.lifecycle().configured);
        assert!(!g.lifecycle().running);
    }

    #[test]
    fn zero_reported_rate_falls_back() {
        let mut g = graph(0);
        assert_eq!(g.configure().expect("configure").sample_rate, FALLBACK_SAMPLE_RATE);
    }

    #[test]
    fn start_requires_configure() {
        let mut g = graph(48_000);
        assert!(matches!(g.start(), Err(DuckmixError::NotConfigured)));
    }

    #[test]
    fn failed_open_leaves_graph_configured_not_running() {
        let mut g = MixGraph::new(Box::new(NullBackend::failing(48_000)), settings());
        g.configure().expect("configure");
        assert!(g.start().is_err());
        assert_eq!(
            g.lifecycle(),
            EngineLifecycle {
                configured: true,
                running: false
            }
        );
    }

    #[test]
    fn nothing_is_scheduled_before_running() {
        let mut g = graph(48_000);
        let format = g.configure().expect("configure");
        let block = AudioBlock::silence(format, 16);
        assert!(matches!(
            g.schedule_voice(block.clone()),
            Err(DuckmixError::NotRunning)
        ));
        assert!(g.schedule_music(Arc::new(block)).is_err());
        assert_eq!(g.render(), 0);
    }

    #[test]
    fn music_is_scheduled_once() {
        let mut g = graph(48_000);
        let format = g.configure().expect("configure");
        g.start().expect("start");
        let loop_block = Arc::new(AudioBlock::silence(format, 64));
        assert!(g.schedule_music(Arc::clone(&loop_block)).expect("schedule"));
        assert!(!g.schedule_music(loop_block).expect("schedule again"));
        assert!(g.is_music_playing());
    }

    #[test]
    fn voice_must_match_render_format() {
        let mut g = graph(48_000);
        g.configure().expect("configure");
        g.start().expect("start");
        let wrong = AudioBlock::planar_f32(16_000, vec![vec![0.0; 16]; 2]);
        assert!(matches!(
            g.schedule_voice(wrong),
            Err(DuckmixError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn ragged_planar_blocks_are_refused() {
        let mut g = graph(48_000);
        g.configure().expect("configure");
        g.start().expect("start");

        let ragged = AudioBlock::planar_f32(48_000, vec![vec![0.1; 64], vec![0.1; 10]]);
        assert!(matches!(
            g.schedule_voice(ragged.clone()),
            Err(DuckmixError::MalformedBlock(_))
        ));
        assert!(matches!(
            g.schedule_music(Arc::new(ragged)),
            Err(DuckmixError::MalformedBlock(_))
        ));
        assert_eq!(g.voice().queued_frames(), 0);
        assert!(!g.is_music_playing());

        // Rendering with nothing queued stays safe.
        assert!(g.render() > 0);
    }

    #[test]
    fn render_fills_ring_and_applies_gain() {
        let mut g = graph(48_000);
        let format = g.configure().expect("configure");
        g.start().expect("start");
        let loop_block = Arc::new(AudioBlock::planar_f32(
            format.sample_rate,
            vec![vec![0.5; 32]; 2],
        ));
        g.schedule_music(loop_block).expect("schedule");
        g.set_music_gain(0.1);

        // 10 ms at 48 kHz.
        assert_eq!(g.render(), 480);
        assert_relative_eq!(g.applied_gain(), 0.1);
        // Ring is full; nothing more to render until the output drains.
        assert_eq!(g.render(), 0);
        assert_eq!(g.frames_rendered(), 480);
    }

    #[test]
    fn stop_clears_channels_and_gain() {
        let mut g = graph(48_000);
        let format = g.configure().expect("configure");
        g.start().expect("start");
        g.schedule_voice(AudioBlock::silence(format, 2_000)).expect("voice");
        g.set_music_gain(0.1);
        g.render();
        g.stop();
        assert_eq!(g.voice().queued_frames(), 0);
        assert!(!g.is_music_playing());
        assert_relative_eq!(g.applied_gain(), 0.35);
        assert!(g.lifecycle().configured);
        assert!(!g.lifecycle().running);
    }

    #[test]
    fn mic_tap_only_while_running() {
        let mut g = graph(48_000);
        g.configure().expect("configure");
        let block = AudioBlock::interleaved_f32(48_000, 1, vec![0.1; 48]);
        let detector = PeakRmsDetector::default();
        assert!(g.analyze_mic(&block, &detector).is_none());
        g.start().expect("start");
        assert!(g.analyze_mic(&block, &detector).is_some());
        assert_eq!(g.mic_tap().blocks(), 1);
    }
}
