//! Signal channels: one debounce state machine per monitored condition.
//!
//! A channel turns raw per-tick observations into confirmed transitions.
//! Each channel value is built fresh for every session and owned by that
//! session's monitor, so no timing state survives across sessions.
//!
//! ```text
//! IDLE ──present──▶ PENDING ──held ≥ confirm──▶ CONFIRMED (emit, cooldown armed)
//!  ▲                   │                             │
//!  └─────absent────────┘      cooldown expired ──────┴──▶ IDLE, or PENDING again
//!                                                        if still present
//! ```

pub mod audio;
pub mod face;
pub mod focus;
pub mod object;

use crate::config::EngineConfig;
use proctor_daemon_protocol::AlertKind;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub use audio::AudioChannel;
pub use face::FaceChannel;
pub use focus::FocusChannel;
pub use object::ObjectChannel;

/// A confirmed violation ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub kind: AlertKind,
    pub details: String,
}

impl Transition {
    pub fn new(kind: AlertKind, details: impl Into<String>) -> Self {
        Self {
            kind,
            details: details.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Pending,
    Confirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Pending { since: Instant },
    Confirmed { until: Instant },
}

/// Time-window debounce shared by the face, object and focus channels.
///
/// While CONFIRMED the latch holds until the cooldown expires, whether or not
/// the condition clears in between.
#[derive(Debug, Clone)]
pub struct Debouncer {
    confirm: Duration,
    cooldown: Duration,
    phase: Phase,
}

impl Debouncer {
    pub fn new(confirm: Duration, cooldown: Duration) -> Self {
        Self {
            confirm,
            cooldown,
            phase: Phase::Idle,
        }
    }

    pub fn from_millis(confirm_ms: u64, cooldown_ms: u64) -> Self {
        Self::new(
            Duration::from_millis(confirm_ms),
            Duration::from_millis(cooldown_ms),
        )
    }

    pub fn state(&self) -> ChannelState {
        match self.phase {
            Phase::Idle => ChannelState::Idle,
            Phase::Pending { .. } => ChannelState::Pending,
            Phase::Confirmed { .. } => ChannelState::Confirmed,
        }
    }

    pub fn is_latched(&self, now: Instant) -> bool {
        matches!(self.phase, Phase::Confirmed { until } if now < until)
    }

    /// Drops a pending timer. A running cooldown is left in place.
    pub fn clear_pending(&mut self) {
        if let Phase::Pending { .. } = self.phase {
            self.phase = Phase::Idle;
        }
    }

    /// Feeds one observation. Returns `true` only on the tick that confirms.
    pub fn observe(&mut self, present: bool, now: Instant) -> bool {
        if let Phase::Confirmed { until } = self.phase {
            if now < until {
                return false;
            }
            self.phase = Phase::Idle;
        }

        if !present {
            self.phase = Phase::Idle;
            return false;
        }

        let since = match self.phase {
            Phase::Pending { since } => since,
            _ => now,
        };

        if now.saturating_duration_since(since) >= self.confirm {
            self.phase = Phase::Confirmed {
                until: now + self.cooldown,
            };
            true
        } else {
            self.phase = Phase::Pending { since };
            false
        }
    }
}

/// All channels of one session, each behind its own lock so that the visual
/// tick, the audio tick and focus callbacks never race on the same fields.
pub struct ChannelSet {
    face: Mutex<FaceChannel>,
    object: Mutex<ObjectChannel>,
    audio: Mutex<AudioChannel>,
    focus: Mutex<FocusChannel>,
}

impl ChannelSet {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            face: Mutex::new(FaceChannel::new(&config.face)),
            object: Mutex::new(ObjectChannel::new(&config.object)),
            audio: Mutex::new(AudioChannel::new(&config.audio)),
            focus: Mutex::new(FocusChannel::new(&config.focus)),
        }
    }

    pub fn face(&self) -> MutexGuard<'_, FaceChannel> {
        self.face.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn object(&self) -> MutexGuard<'_, ObjectChannel> {
        self.object.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn audio(&self) -> MutexGuard<'_, AudioChannel> {
        self.audio.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn focus(&self) -> MutexGuard<'_, FocusChannel> {
        self.focus.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn format_secs(duration: Duration) -> String {
    format!("{}", duration.as_millis() as f64 / 1000.0)
}
