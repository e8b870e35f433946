//! Detector poller: samples the sensors on each tick and feeds the channels.
//!
//! Failure policy: a detector error, a detector or frame source panic, or a
//! missing frame is logged and treated as "condition absent" for that tick. It never stops the
//! tick or touches any other channel.

use crate::channel::{ChannelSet, Transition};
use crate::error::ProctorError;
use crate::sensors::{FaceRegion, FocusNotification, Frame, ObjectPrediction, Sensors};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct PollCounters {
    visual_ticks: AtomicU64,
    audio_ticks: AtomicU64,
    missing_frames: AtomicU64,
    detector_failures: AtomicU64,
}

/// Point-in-time copy of the poller counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PollStats {
    pub visual_ticks: u64,
    pub audio_ticks: u64,
    pub missing_frames: u64,
    pub detector_failures: u64,
}

pub struct DetectorPoller {
    sensors: Sensors,
    channels: Arc<ChannelSet>,
    object_enabled: bool,
    audio_enabled: bool,
    counters: PollCounters,
}

impl DetectorPoller {
    pub fn new(
        sensors: Sensors,
        channels: Arc<ChannelSet>,
        object_enabled: bool,
        audio_enabled: bool,
    ) -> Self {
        Self {
            sensors,
            channels,
            object_enabled,
            audio_enabled,
            counters: PollCounters::default(),
        }
    }

    pub fn has_audio(&self) -> bool {
        self.audio_enabled && self.sensors.audio.is_some()
    }

    /// One visual tick: face and object channels share the same frame.
    pub fn visual_tick(&self, now: Instant) -> Vec<Transition> {
        self.counters.visual_ticks.fetch_add(1, Ordering::Relaxed);

        let frame = self
            .guarded("frame", || Ok(self.sensors.frames.current_frame()))
            .flatten();
        let (faces, objects) = match frame.as_ref() {
            Some(frame) => (self.detect_faces(frame), self.detect_objects(frame)),
            None => {
                self.counters.missing_frames.fetch_add(1, Ordering::Relaxed);
                debug!("No frame available; visual conditions treated as absent");
                (None, None)
            }
        };

        let mut transitions = Vec::new();
        if let Some(transition) = self.channels.face().observe(faces.as_deref(), now) {
            transitions.push(transition);
        }
        if self.object_enabled {
            if let Some(transition) = self.channels.object().observe(objects.as_deref(), now) {
                transitions.push(transition);
            }
        }
        transitions
    }

    pub fn audio_tick(&self, now: Instant) -> Option<Transition> {
        if !self.audio_enabled {
            return None;
        }
        let sampler = self.sensors.audio.as_ref()?;
        self.counters.audio_ticks.fetch_add(1, Ordering::Relaxed);

        let energy = self.guarded("audio", || sampler.current_energy());
        self.channels.audio().observe(energy, now)
    }

    pub fn focus(&self, notification: FocusNotification, now: Instant) -> Option<Transition> {
        self.channels.focus().observe(notification, now)
    }

    /// Recorded audio since the last call, for standalone evidence.
    pub fn take_audio_chunk(&self) -> Option<Vec<u8>> {
        let recorder = self.sensors.recorder.as_ref()?;
        self.guarded("recorder", || recorder.take_chunk()).flatten()
    }

    pub fn stats(&self) -> PollStats {
        PollStats {
            visual_ticks: self.counters.visual_ticks.load(Ordering::Relaxed),
            audio_ticks: self.counters.audio_ticks.load(Ordering::Relaxed),
            missing_frames: self.counters.missing_frames.load(Ordering::Relaxed),
            detector_failures: self.counters.detector_failures.load(Ordering::Relaxed),
        }
    }

    fn detect_faces(&self, frame: &Frame) -> Option<Vec<FaceRegion>> {
        self.guarded("face", || self.sensors.faces.detect_faces(frame))
    }

    fn detect_objects(&self, frame: &Frame) -> Option<Vec<ObjectPrediction>> {
        if !self.object_enabled {
            return None;
        }
        let detector = self.sensors.objects.as_ref()?;
        self.guarded("object", || detector.detect_objects(frame))
    }

    fn guarded<T, F>(&self, detector: &'static str, call: F) -> Option<T>
    where
        F: FnOnce() -> Result<T, String>,
    {
        let details = match panic::catch_unwind(AssertUnwindSafe(call)) {
            Ok(Ok(value)) => return Some(value),
            Ok(Err(details)) => details,
            Err(payload) => panic_message(payload.as_ref()),
        };
        self.counters
            .detector_failures
            .fetch_add(1, Ordering::Relaxed);
        let failure = ProctorError::DetectorTransientFailure { detector, details };
        warn!(detector, error = %failure, "Detector call failed; treating as absent");
        None
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}
