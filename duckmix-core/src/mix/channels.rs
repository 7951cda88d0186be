//! The three logical channels of the mix graph.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::buffering::AudioBlock;
use crate::level::LevelDetector;

/// A render-format buffer played on an endless loop.
#[derive(Debug, Default)]
pub struct MusicChannel {
    buffer: Option<Arc<AudioBlock>>,
    position: usize,
    playing: bool,
}

impl MusicChannel {
    /// Start looping `buffer` from its beginning.
    pub fn schedule(&mut self, buffer: Arc<AudioBlock>) {
        self.buffer = Some(buffer);
        self.position = 0;
        self.playing = true;
    }

    pub fn stop(&mut self) {
        self.buffer = None;
        self.position = 0;
        self.playing = false;
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Add `frames` of the loop into interleaved `out`, ramping the gain
    /// linearly from `from_gain` to `to_gain` across the span.
    pub fn mix_into(&mut self, out: &mut [f32], channels: usize, from_gain: f32, to_gain: f32) {
        if !self.playing || channels == 0 {
            return;
        }
        let Some(buffer) = self.buffer.as_ref() else {
            return;
        };
        let len = buffer.frames;
        if len == 0 {
            return;
        }
        let frames = out.len() / channels;
        let step = if frames > 0 {
            (to_gain - from_gain) / frames as f32
        } else {
            0.0
        };
        let mix_channels = channels.min(buffer.channels as usize);

        for f in 0..frames {
            let gain = from_gain + step * (f + 1) as f32;
            let base = f * channels;
            for c in 0..mix_channels {
                if let Some(chan) = buffer.channel(c) {
                    out[base + c] += chan[self.position] * gain;
                }
            }
            self.position += 1;
            if self.position >= len {
                self.position = 0;
            }
        }
    }
}

/// Remote voice blocks played back-to-back in arrival order.
#[derive(Debug, Default)]
pub struct VoiceChannel {
    queue: VecDeque<AudioBlock>,
    /// Frames of the front block already rendered.
    offset: usize,
    queued_frames: usize,
    scheduled: u64,
}

impl VoiceChannel {
    pub fn schedule(&mut self, block: AudioBlock) {
        self.queued_frames += block.frames;
        self.scheduled += 1;
        self.queue.push_back(block);
    }

    /// Drop everything queued. The scheduled counter is kept.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.offset = 0;
        self.queued_frames = 0;
    }

    /// Frames scheduled but not yet rendered.
    pub fn queued_frames(&self) -> usize {
        self.queued_frames
    }

    /// Blocks scheduled since creation.
    pub fn scheduled_blocks(&self) -> u64 {
        self.scheduled
    }

    /// Add queued voice into interleaved `out` at unity gain.
    pub fn mix_into(&mut self, out: &mut [f32], channels: usize) {
        if channels == 0 {
            return;
        }
        let frames = out.len() / channels;
        let mut written = 0;
        while written < frames {
            let Some(front) = self.queue.front() else {
                break;
            };
            let available = front.frames.saturating_sub(self.offset);
            let take = available.min(frames - written);
            let mix_channels = channels.min(front.channels as usize);
            for c in 0..mix_channels {
                if let Some(chan) = front.channel(c) {
                    for i in 0..take {
                        out[(written + i) * channels + c] += chan[self.offset + i];
                    }
                }
            }
            written += take;
            self.offset += take;
            self.queued_frames = self.queued_frames.saturating_sub(take);
            if self.offset >= front.frames {
                self.queue.pop_front();
                self.offset = 0;
            }
        }
    }
}

/// Microphone tap. Measures blocks for ducking and never reaches the output.
#[derive(Debug, Default)]
pub struct AnalysisTap {
    blocks: u64,
    frames: u64,
    last_level: f32,
}

impl AnalysisTap {
    pub fn analyze(&mut self, block: &AudioBlock, detector: &dyn LevelDetector) -> f32 {
        let level = detector.level(block);
        self.blocks += 1;
        self.frames += block.frames as u64;
        self.last_level = level;
        level
    }

    pub fn reset(&mut self) {
        self.last_level = 0.0;
    }

    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn last_level(&self) -> f32 {
        self.last_level
    }
}
