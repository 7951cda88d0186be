//! Voice gate: time-delayed admission of freshly attached remote audio.
//!
//! ## State machine
//!
//! ```text
//! Idle ──arm()──► Armed ──open() after delay──► Open
//!   ▲               │                             │
//!   └────reset()────┴──────────reset()────────────┘
//! ```
//!
//! While `Armed`, every remote block (already normalized) plus its activity
//! sample is queued. `open()` hands the queue back in arrival order exactly
//! once; afterwards blocks pass straight through. Each `arm()` carries the
//! attachment generation, and anything tagged with another generation (late
//! blocks, stale open timers) is rejected.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::buffering::AudioBlock;

/// Default warm-up window after attach.
pub const DEFAULT_GATE_DELAY: Duration = Duration::from_secs(1);

/// A normalized remote block and the level measured from its source block.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingVoice {
    pub block: AudioBlock,
    pub level: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePhase {
    /// No source attached.
    Idle,
    /// Source attached, warm-up window running.
    Armed { generation: u64, opens_at: Instant },
    /// Warm-up finished; blocks bypass the queue.
    Open { generation: u64 },
}

/// Serialisable summary of `GatePhase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatePhaseKind {
    Idle,
    Armed,
    Open,
}

impl GatePhase {
    pub fn kind(&self) -> GatePhaseKind {
        match self {
            GatePhase::Idle => GatePhaseKind::Idle,
            GatePhase::Armed { .. } => GatePhaseKind::Armed,
            GatePhase::Open { .. } => GatePhaseKind::Open,
        }
    }
}

/// Outcome of offering a block to the gate.
#[derive(Debug, PartialEq)]
pub enum Admission {
    /// Held until the gate opens.
    Buffered,
    /// Gate is open: schedule immediately.
    PassThrough(PendingVoice),
    /// Wrong generation or no attachment; drop it.
    Rejected(PendingVoice),
}

#[derive(Debug)]
pub struct VoiceGate {
    delay: Duration,
    phase: GatePhase,
    pending: VecDeque<PendingVoice>,
    generation: u64,
}

impl VoiceGate {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            phase: GatePhase::Idle,
            pending: VecDeque::new(),
            generation: 0,
        }
    }

    /// Start attachment `generation`. Any undrained blocks from a previous
    /// one are discarded. Returns the instant the gate may open.
    pub fn arm(&mut self, generation: u64, now: Instant) -> Instant {
        let opens_at = now + self.delay;
        self.generation = generation;
        self.pending.clear();
        self.phase = GatePhase::Armed {
            generation,
            opens_at,
        };
        opens_at
    }

    /// Offer a block belonging to attachment `generation`.
    pub fn admit(&mut self, generation: u64, voice: PendingVoice) -> Admission {
        match self.phase {
            GatePhase::Armed { generation: g, .. } if g == generation => {
                self.pending.push_back(voice);
                Admission::Buffered
            }
            GatePhase::Open { generation: g } if g == generation => Admission::PassThrough(voice),
            _ => Admission::Rejected(voice),
        }
    }

    /// Open the gate for `generation` if its warm-up has elapsed at `now`.
    ///
    /// Returns the queued blocks in arrival order on the single transition
    /// to `Open`, or `None` if the generation is stale, the gate is not
    /// armed, or the deadline has not been reached.
    pub fn open(&mut self, generation: u64, now: Instant) -> Option<Vec<PendingVoice>> {
        match self.phase {
            GatePhase::Armed {
                generation: g,
                opens_at,
            } if g == generation && now >= opens_at => {
                self.phase = GatePhase::Open { generation: g };
                Some(std::mem::take(&mut self.pending).into())
            }
            _ => None,
        }
    }

    /// Detach: back to `Idle`, discarding anything still queued.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.phase = GatePhase::Idle;
    }

    pub fn phase(&self) -> GatePhase {
        self.phase
    }

    pub fn is_open(&self) -> bool {
        matches!(self.phase, GatePhase::Open { .. })
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// When the armed gate may open, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            GatePhase::Armed { opens_at, .. } => Some(opens_at),
            _ => None,
        }
    }
}

impl Default for VoiceGate {
    fn default() -> Self {
        Self::new(DEFAULT_GATE_DELAY)
    }
}
