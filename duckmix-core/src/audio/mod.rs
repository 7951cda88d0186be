//! Platform audio I/O and format conversion.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not** block on a lock or perform I/O. Captured samples go
//! straight into a [`MicInput`](crate::engine::MicInput), whose ring push is lock-free.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `AudioCapture` must be created and dropped on the same thread.

pub mod device;
pub mod normalize;
pub mod playback;
pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{
    engine::DuckmixEngine,
    error::{DuckmixError, Result},
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

/// Handle to an active microphone capture stream feeding an engine.
///
/// **Not `Send`**: create and drop this type on the same OS thread.
pub struct AudioCapture {
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    running: Arc<AtomicBool>,
    /// Capture sample rate reported by the device (Hz).
    pub sample_rate: u32,
    /// Interleaved channel count delivered by the device.
    pub channels: u16,
}

impl AudioCapture {
    /// Open an input device by preferred name, otherwise the default input
    /// device, otherwise the first available one, and feed it into `engine`.
    #[cfg(feature = "audio-cpal")]
    pub fn open_with_preference(
        engine: &DuckmixEngine,
        preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let mut selected_device = None;

        if let Some(preferred_name) = preferred_device_name {
            match host.input_devices() {
                Ok(mut devices) => {
                    selected_device = devices.find(|device| {
                        device
                            .name()
                            .map(|name| name == preferred_name)
                            .unwrap_or(false)
                    });

                    if selected_device.is_none() {
                        warn!(
                            "preferred input device '{}' not found, falling back",
                            preferred_name
                        );
                    }
                }
                Err(e) => {
                    warn!("failed to list input devices while resolving preference: {e}");
                }
            }
        }

        let device = if let Some(device) = selected_device {
            device
        } else if let Some(default) = host.default_input_device() {
            default
        } else {
            let mut devices = host
                .input_devices()
                .map_err(|e| DuckmixError::AudioDevice(e.to_string()))?;
            let fallback = devices.next().ok_or(DuckmixError::NoDefaultInputDevice)?;
            warn!("no default input device, falling back to first available input");
            fallback
        };

        let name = device.name().unwrap_or_default();
        if device::is_loopback_like_name(&name) {
            warn!(
                device = name.as_str(),
                "input looks like a loopback device; music may duck itself"
            );
        }
        info!(device = name.as_str(), "opening input device");

        let supported = device
            .default_input_config()
            .map_err(|e| DuckmixError::AudioDevice(e.to_string()))?;

        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, "microphone config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let running = Arc::new(AtomicBool::new(true));
        let mut mic = engine.mic_input(channels, sample_rate);

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let running = Arc::clone(&running);
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _info| {
                        if running.load(Ordering::Relaxed) {
                            mic.push_f32(data);
                        }
                    },
                    |err| error!("audio input stream error: {err}"),
                    None,
                )
            }

            SampleFormat::I16 => {
                let running = Arc::clone(&running);
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        if running.load(Ordering::Relaxed) {
                            mic.push_i16(data);
                        }
                    },
                    |err| error!("audio input stream error: {err}"),
                    None,
                )
            }

            SampleFormat::U8 => {
                let running = Arc::clone(&running);
                device.build_input_stream(
                    &config,
                    move |data: &[u8], _info| {
                        if running.load(Ordering::Relaxed) {
                            mic.push_u8(data);
                        }
                    },
                    |err| error!("audio input stream error: {err}"),
                    None,
                )
            }

            fmt => {
                return Err(DuckmixError::AudioStream(format!(
                    "unsupported input sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| DuckmixError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| DuckmixError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
            channels,
        })
    }

    /// Open the system default microphone.
    ///
    /// # Errors
    /// `NoDefaultInputDevice` when no microphone is available, or
    /// `AudioStream` if cpal fails to build the stream.
    #[cfg(feature = "audio-cpal")]
    pub fn open_default(engine: &DuckmixEngine) -> Result<Self> {
        Self::open_with_preference(engine, None)
    }

    /// Signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open_with_preference(
        _engine: &DuckmixEngine,
        _preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        Err(DuckmixError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn open_default(engine: &DuckmixEngine) -> Result<Self> {
        Self::open_with_preference(engine, None)
    }
}
