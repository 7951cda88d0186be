//! # duckmix-core
//!
//! Conversation audio engine: a looping background track that ducks under a
//! remote voice agent and the local microphone.
//!
//! ## Architecture
//!
//! ```text
//! transport ── RemoteTap ──┐
//!                          ▼
//! mic callback ─ SPSC ─► processing queue (one thread)
//!                          │  level → normalize → voice gate
//!                          │  ducking controller (tick)
//!                          ▼
//!                      MixGraph ── SPSC ─► output callback
//!                 (music·gain + voice)
//! ```
//!
//! Realtime callbacks never lock or block. All engine state is owned by the
//! processing queue; public operations are fire-and-forget sends onto it.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod ducking;
pub mod engine;
pub mod error;
pub mod gate;
pub mod ipc;
pub mod level;
pub mod mix;

// Convenience re-exports for downstream crates
pub use audio::playback::{CpalBackend, NullBackend, OutputSink, PlaybackBackend, PlaybackStream};
pub use audio::AudioCapture;
pub use buffering::{AudioBlock, RenderFormat};
pub use ducking::{DuckingConfig, DuckingState};
pub use engine::{
    AgentState, DiagnosticsSnapshot, DuckmixEngine, EngineConfig, EngineSnapshot, MicInput,
    RemoteTap,
};
pub use error::DuckmixError;
pub use ipc::events::{
    ActivityEvent, ActivitySource, DuckingEvent, EngineStatus, EngineStatusEvent,
};
pub use mix::MusicAsset;
