//! Face-count channel.
//!
//! One face-count observation feeds two mutually exclusive conditions with
//! separate latches: zero faces (`no_face`) and more than one (`multiple_faces`).
//! Exactly one face means both are absent.

use super::{format_secs, ChannelState, Debouncer, Transition};
use crate::config::FaceConfig;
use crate::sensors::FaceRegion;
use proctor_daemon_protocol::AlertKind;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct FaceChannel {
    min_confidence: f32,
    no_face_window: Duration,
    no_face: Debouncer,
    multiple: Debouncer,
}

impl FaceChannel {
    pub fn new(config: &FaceConfig) -> Self {
        Self {
            min_confidence: config.min_confidence,
            no_face_window: Duration::from_millis(config.no_face_confirm_ms),
            no_face: Debouncer::from_millis(config.no_face_confirm_ms, config.no_face_cooldown_ms),
            multiple: Debouncer::from_millis(
                config.multiple_faces_confirm_ms,
                config.multiple_faces_cooldown_ms,
            ),
        }
    }

    /// `None` means the observation failed; both conditions count as absent.
    pub fn observe(&mut self, regions: Option<&[FaceRegion]>, now: Instant) -> Option<Transition> {
        let count = regions.map(|regions| {
            regions
                .iter()
                .filter(|region| region.confidence >= self.min_confidence)
                .count()
        });
        self.observe_count(count, now)
    }

    pub fn observe_count(&mut self, count: Option<usize>, now: Instant) -> Option<Transition> {
        let zero = count == Some(0);
        let many = matches!(count, Some(n) if n > 1);

        let no_face_fired = self.no_face.observe(zero, now);
        let multiple_fired = self.multiple.observe(many, now);

        if no_face_fired {
            return Some(Transition::new(
                AlertKind::NoFace,
                format!(
                    "No face detected for > {}s",
                    format_secs(self.no_face_window)
                ),
            ));
        }
        if multiple_fired {
            return Some(Transition::new(
                AlertKind::MultipleFaces,
                format!("Detected {} faces in frame", count.unwrap_or_default()),
            ));
        }
        None
    }

    pub fn no_face_state(&self) -> ChannelState {
        self.no_face.state()
    }

    pub fn multiple_faces_state(&self) -> ChannelState {
        self.multiple.state()
    }
}
