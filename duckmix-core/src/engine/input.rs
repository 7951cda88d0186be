//! Handles through which collaborators feed audio into the engine.
//!
//! `RemoteTap` is handed to the transport on `attach()`. `MicInput` is owned
//! by a platform capture callback and must stay realtime-safe: its push
//! methods never lock, and only allocate when a callback delivers a larger
//! buffer than any before it.

use std::sync::{atomic::Ordering, Arc};

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::processor::Command;
use super::EngineDiagnostics;
use crate::buffering::{AudioBlock, Observer, Producer, SampleProducer};

/// Conversation state reported by the remote agent's transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Listening,
    Thinking,
    Speaking,
    Disconnected,
}

impl AgentState {
    pub fn is_speaking(self) -> bool {
        matches!(self, AgentState::Speaking)
    }
}

/// Delivery handle for one attachment of a remote audio source.
///
/// Every call is a non-blocking hand-off to the processing queue. Once a
/// newer `attach()` happens, this tap's blocks are discarded.
#[derive(Clone)]
pub struct RemoteTap {
    generation: u64,
    commands: Sender<Command>,
    diagnostics: Arc<EngineDiagnostics>,
}

impl RemoteTap {
    pub(crate) fn new(
        generation: u64,
        commands: Sender<Command>,
        diagnostics: Arc<EngineDiagnostics>,
    ) -> Self {
        Self {
            generation,
            commands,
            diagnostics,
        }
    }

    /// Attachment generation this tap belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Hand a remote block to the engine.
    pub fn deliver(&self, block: AudioBlock) {
        self.diagnostics
            .remote_blocks_received
            .fetch_add(1, Ordering::Relaxed);
        let sent = self.commands.send(Command::RemoteBlock {
            generation: self.generation,
            block,
        });
        if sent.is_err() {
            self.diagnostics
                .remote_blocks_dropped
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Copy `block` into the engine, then silence it in place so the
    /// transport's own playback path renders nothing.
    pub fn intercept(&self, block: &mut AudioBlock) {
        self.deliver(block.clone());
        block.zero_in_place();
    }

    /// Forward the transport's agent state; only `Speaking` ducks.
    pub fn set_agent_state(&self, state: AgentState) {
        let _ = self.commands.send(Command::AgentSpeaking {
            generation: Some(self.generation),
            speaking: state.is_speaking(),
        });
    }
}

/// Producer side of the microphone ring.
///
/// Samples are interleaved with the channel count given to
/// `DuckmixEngine::mic_input`; partial frames are never written, so the
/// processing queue always reads whole frames.
pub struct MicInput {
    producer: SampleProducer,
    channels: u16,
    sample_rate: u32,
    scratch: Vec<f32>,
    diagnostics: Arc<EngineDiagnostics>,
}

impl MicInput {
    pub(crate) fn new(
        producer: SampleProducer,
        channels: u16,
        sample_rate: u32,
        diagnostics: Arc<EngineDiagnostics>,
    ) -> Self {
        Self {
            producer,
            channels: channels.max(1),
            sample_rate,
            scratch: Vec::new(),
            diagnostics,
        }
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Push interleaved f32 samples. Returns the number of frames accepted.
    pub fn push_f32(&mut self, samples: &[f32]) -> usize {
        let ch = self.channels as usize;
        let frames = samples.len() / ch;
        let room = self.producer.vacant_len() / ch;
        let accepted = frames.min(room);
        self.producer.push_slice(&samples[..accepted * ch]);
        if accepted < frames {
            self.diagnostics
                .mic_frames_dropped
                .fetch_add(frames - accepted, Ordering::Relaxed);
            trace!("mic ring full: dropped {} frames", frames - accepted);
        }
        accepted
    }

    /// Push interleaved i16 samples.
    pub fn push_i16(&mut self, samples: &[i16]) -> usize {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        scratch.extend(samples.iter().map(|s| *s as f32 / 32768.0));
        let accepted = self.push_f32(&scratch);
        self.scratch = scratch;
        accepted
    }

    /// Push interleaved unsigned 8-bit samples.
    pub fn push_u8(&mut self, samples: &[u8]) -> usize {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        scratch.extend(samples.iter().map(|s| (*s as f32 - 128.0) / 128.0));
        let accepted = self.push_f32(&scratch);
        self.scratch = scratch;
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::{create_sample_ring, Consumer};

    #[test]
    fn mic_input_writes_whole_frames_only() {
        let (prod, mut cons) = create_sample_ring(5);
        let diagnostics = Arc::new(EngineDiagnostics::default());
        let mut mic = MicInput::new(prod, 2, 48_000, Arc::clone(&diagnostics));

        // 3 frames offered, room for 2 whole stereo frames.
        assert_eq!(mic.push_f32(&[0.1, 0.1, 0.2, 0.2, 0.3, 0.3]), 2);
        assert_eq!(cons.occupied_len(), 4);
        assert_eq!(diagnostics.snapshot().mic_frames_dropped, 1);

        let mut out = [0.0; 4];
        cons.pop_slice(&mut out);
        assert_eq!(out, [0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn integer_pushes_are_scaled() {
        let (prod, mut cons) = create_sample_ring(8);
        let mut mic = MicInput::new(prod, 1, 16_000, Arc::new(EngineDiagnostics::default()));
        assert_eq!(mic.push_i16(&[16384, -32768]), 2);
        assert_eq!(mic.push_u8(&[192]), 1);
        let mut out = [0.0; 3];
        cons.pop_slice(&mut out);
        assert_eq!(out, [0.5, -1.0, 0.5]);
    }

    #[test]
    fn intercept_zeroes_caller_buffer() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let tap = RemoteTap::new(3, tx, Arc::new(EngineDiagnostics::default()));
        let mut block = AudioBlock::interleaved_f32(24_000, 1, vec![0.4; 8]);
        tap.intercept(&mut block);

        assert!(block.data == crate::buffering::SampleBuffer::InterleavedF32(vec![0.0; 8]));
        match rx.try_recv().expect("command sent") {
            Command::RemoteBlock { generation, block } => {
                assert_eq!(generation, 3);
                assert_eq!(
                    block.data,
                    crate::buffering::SampleBuffer::InterleavedF32(vec![0.4; 8])
                );
            }
            _ => panic!("expected a remote block"),
        }
    }

    #[test]
    fn only_speaking_state_sets_flag() {
        assert!(AgentState::Speaking.is_speaking());
        assert!(!AgentState::Thinking.is_speaking());
        assert!(!AgentState::Listening.is_speaking());
    }
}
