//! Focus / visibility channel.
//!
//! Event driven rather than polled. A loss notification confirms immediately.
//! The cooldown collapses the burst of duplicate OS notifications that a
//! single tab switch produces (blur + hidden).

use super::{ChannelState, Debouncer, Transition};
use crate::config::FocusConfig;
use crate::sensors::FocusNotification;
use proctor_daemon_protocol::AlertKind;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct FocusChannel {
    debouncer: Debouncer,
    away: bool,
}

impl FocusChannel {
    pub fn new(config: &FocusConfig) -> Self {
        Self {
            debouncer: Debouncer::from_millis(0, config.cooldown_ms),
            away: false,
        }
    }

    pub fn observe(&mut self, notification: FocusNotification, now: Instant) -> Option<Transition> {
        let lost = notification.is_loss();
        self.away = lost;
        if self.debouncer.observe(lost, now) {
            return Some(Transition::new(AlertKind::TabSwitch, notification.reason()));
        }
        None
    }

    pub fn is_away(&self) -> bool {
        self.away
    }

    pub fn state(&self) -> ChannelState {
        self.debouncer.state()
    }
}
