//! Output side of the render graph.
//!
//! # Design constraints
//!
//! The platform output callback runs on an OS audio thread at elevated
//! priority. It **must not** allocate, block on a lock, or perform I/O. The
//! processing queue therefore renders ahead into an SPSC ring and the
//! callback only pops from it through [`OutputSink::fill`], padding any
//! shortfall with silence.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms. `PlaybackBackend::open` is
//! always called on the processing thread, and the returned
//! `PlaybackStream` is dropped on that same thread.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::{
    buffering::{Consumer, RenderFormat, SampleConsumer},
    error::{DuckmixError, Result},
};

/// Realtime-side reader of the render ring.
pub struct OutputSink {
    consumer: SampleConsumer,
    underruns: Arc<AtomicUsize>,
}

impl OutputSink {
    pub fn new(consumer: SampleConsumer, underruns: Arc<AtomicUsize>) -> Self {
        Self {
            consumer,
            underruns,
        }
    }

    /// Fill `out` with rendered interleaved samples, zero-padding on underrun.
    ///
    /// Lock-free and allocation-free. Returns the number of real samples.
    pub fn fill(&mut self, out: &mut [f32]) -> usize {
        let n = self.consumer.pop_slice(out);
        if n < out.len() {
            out[n..].fill(0.0);
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }
        n
    }

    /// Like [`fill`](Self::fill) for integer device formats: pops through
    /// `scratch` in chunks and converts each sample with `convert`.
    ///
    /// `scratch` is allocated once by the caller, so any callback size is
    /// served without allocating. Returns the number of real samples.
    pub fn fill_converted<T>(
        &mut self,
        scratch: &mut [f32],
        out: &mut [T],
        convert: impl Fn(f32) -> T,
    ) -> usize {
        if scratch.is_empty() {
            return 0;
        }
        let mut real = 0;
        for dst in out.chunks_mut(scratch.len()) {
            let chunk = &mut scratch[..dst.len()];
            let n = self.consumer.pop_slice(chunk);
            chunk[n..].fill(0.0);
            real += n;
            for (d, s) in dst.iter_mut().zip(chunk.iter()) {
                *d = convert(*s);
            }
        }
        if real < out.len() {
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }
        real
    }
}

/// Conversion buffer for integer output formats, allocated at stream open.
#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
const CONVERT_SCRATCH_SAMPLES: usize = 4096;

#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
fn i16_sample(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
fn u8_sample(s: f32) -> u8 {
    (s.clamp(-1.0, 1.0) * 127.0 + 128.0) as u8
}

/// An open output stream. Dropping it releases the device.
pub trait PlaybackStream {
    /// Halt output. Safe to call more than once.
    fn stop(&mut self);
}

/// Source of output streams for the mix graph.
pub trait PlaybackBackend: Send + 'static {
    /// Native sample rate of the output device, or 0 if unknown.
    fn output_sample_rate(&mut self) -> Result<u32>;

    /// Open an output stream in `format` that pulls from `sink`.
    fn open(&mut self, format: RenderFormat, sink: OutputSink) -> Result<Box<dyn PlaybackStream>>;
}

// ---------------------------------------------------------------------------
// Headless backend
// ---------------------------------------------------------------------------

/// Backend with no device. The sink is held but never drained, so the
/// render ring fills once and rendering idles.
#[derive(Debug, Clone)]
pub struct NullBackend {
    sample_rate: u32,
    fail_open: bool,
}

impl NullBackend {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            fail_open: false,
        }
    }

    /// A backend whose `open` always fails, for exercising error paths.
    pub fn failing(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            fail_open: true,
        }
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new(48_000)
    }
}

struct NullStream {
    _sink: OutputSink,
}

impl PlaybackStream for NullStream {
    fn stop(&mut self) {}
}

impl PlaybackBackend for NullBackend {
    fn output_sample_rate(&mut self) -> Result<u32> {
        Ok(self.sample_rate)
    }

    fn open(&mut self, _format: RenderFormat, sink: OutputSink) -> Result<Box<dyn PlaybackStream>> {
        if self.fail_open {
            return Err(DuckmixError::AudioStream("null backend open refused".into()));
        }
        Ok(Box::new(NullStream { _sink: sink }))
    }
}

// ---------------------------------------------------------------------------
// cpal backend
// ---------------------------------------------------------------------------

/// Output through cpal: preferred device by name, else the host default.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    preferred_device: Option<String>,
}

impl CpalBackend {
    pub fn new(preferred_device: Option<String>) -> Self {
        Self { preferred_device }
    }
}

#[cfg(feature = "audio-cpal")]
struct CpalStream {
    stream: cpal::Stream,
}

#[cfg(feature = "audio-cpal")]
impl PlaybackStream for CpalStream {
    fn stop(&mut self) {
        use cpal::traits::StreamTrait;
        if let Err(e) = self.stream.pause() {
            tracing::debug!("output stream pause failed: {e}");
        }
    }
}

#[cfg(feature = "audio-cpal")]
impl CpalBackend {
    fn resolve_device(&self) -> Result<cpal::Device> {
        use cpal::traits::{DeviceTrait, HostTrait};

        let host = cpal::default_host();
        if let Some(preferred_name) = self.preferred_device.as_deref() {
            match host.output_devices() {
                Ok(mut devices) => {
                    if let Some(device) = devices.find(|device| {
                        device
                            .name()
                            .map(|name| name == preferred_name)
                            .unwrap_or(false)
                    }) {
                        return Ok(device);
                    }
                    tracing::warn!(
                        "preferred output device '{}' not found, falling back",
                        preferred_name
                    );
                }
                Err(e) => {
                    tracing::warn!("failed to list output devices while resolving preference: {e}");
                }
            }
        }

        host.default_output_device()
            .ok_or(DuckmixError::NoDefaultOutputDevice)
    }
}

#[cfg(feature = "audio-cpal")]
impl PlaybackBackend for CpalBackend {
    fn output_sample_rate(&mut self) -> Result<u32> {
        use cpal::traits::DeviceTrait;

        let device = self.resolve_device()?;
        let supported = device
            .default_output_config()
            .map_err(|e| DuckmixError::AudioDevice(e.to_string()))?;
        Ok(supported.sample_rate().0)
    }

    fn open(&mut self, format: RenderFormat, mut sink: OutputSink) -> Result<Box<dyn PlaybackStream>> {
        use cpal::traits::{DeviceTrait, StreamTrait};
        use cpal::{SampleFormat, SampleRate, StreamConfig};
        use tracing::{error, info};

        let device = self.resolve_device()?;
        info!(
            device = device.name().unwrap_or_default().as_str(),
            sample_rate = format.sample_rate,
            channels = format.channels,
            "opening output device"
        );

        let supported = device
            .default_output_config()
            .map_err(|e| DuckmixError::AudioDevice(e.to_string()))?;

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = match supported.sample_format() {
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _info| {
                    sink.fill(data);
                },
                |err| error!("audio output stream error: {err}"),
                None,
            ),

            SampleFormat::I16 => {
                let mut scratch = vec![0.0f32; CONVERT_SCRATCH_SAMPLES];
                device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _info| {
                        sink.fill_converted(&mut scratch, data, i16_sample);
                    },
                    |err| error!("audio output stream error: {err}"),
                    None,
                )
            }

            SampleFormat::U8 => {
                let mut scratch = vec![0.0f32; CONVERT_SCRATCH_SAMPLES];
                device.build_output_stream(
                    &config,
                    move |data: &mut [u8], _info| {
                        sink.fill_converted(&mut scratch, data, u8_sample);
                    },
                    |err| error!("audio output stream error: {err}"),
                    None,
                )
            }

            fmt => {
                return Err(DuckmixError::AudioStream(format!(
                    "unsupported output sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| DuckmixError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| DuckmixError::AudioStream(e.to_string()))?;

        Ok(Box::new(CpalStream { stream }))
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl PlaybackBackend for CpalBackend {
    fn output_sample_rate(&mut self) -> Result<u32> {
        Err(DuckmixError::AudioDevice(
            "compiled without audio-cpal feature".into(),
        ))
    }

    fn open(&mut self, _format: RenderFormat, _sink: OutputSink) -> Result<Box<dyn PlaybackStream>> {
        Err(DuckmixError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}
