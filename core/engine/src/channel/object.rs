//! Suspicious-object channel.

use super::{ChannelState, Debouncer, Transition};
use crate::config::{ObjectConfig, ObjectPersistence};
use crate::sensors::ObjectPrediction;
use proctor_daemon_protocol::AlertKind;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct ObjectChannel {
    min_score: f32,
    labels: Vec<String>,
    persistence: ObjectPersistence,
    debouncer: Debouncer,
    tracked_class: Option<String>,
}

impl ObjectChannel {
    pub fn new(config: &ObjectConfig) -> Self {
        Self {
            min_score: config.min_score,
            labels: config
                .suspicious_labels
                .iter()
                .map(|label| label.trim().to_lowercase())
                .filter(|label| !label.is_empty())
                .collect(),
            persistence: config.persistence,
            debouncer: Debouncer::from_millis(config.confirm_ms, config.cooldown_ms),
            tracked_class: None,
        }
    }

    /// `None` means the detector failed this tick; treated as no object.
    pub fn observe(
        &mut self,
        predictions: Option<&[ObjectPrediction]>,
        now: Instant,
    ) -> Option<Transition> {
        let top = predictions.and_then(|predictions| self.top_suspicious(predictions));

        let Some((class, confidence)) = top else {
            self.tracked_class = None;
            self.debouncer.observe(false, now);
            return None;
        };

        if self.persistence == ObjectPersistence::SameClass
            && self.tracked_class.as_deref() != Some(class.as_str())
        {
            // A different class restarts the confirm window but never the cooldown.
            self.debouncer.clear_pending();
        }
        self.tracked_class = Some(class.clone());

        if self.debouncer.observe(true, now) {
            return Some(Transition::new(
                AlertKind::SuspiciousObject,
                format!("Detected {} ({:.2})", class, confidence),
            ));
        }
        None
    }

    pub fn state(&self) -> ChannelState {
        self.debouncer.state()
    }

    pub fn tracked_class(&self) -> Option<&str> {
        self.tracked_class.as_deref()
    }

    fn is_suspicious(&self, prediction: &ObjectPrediction) -> bool {
        if prediction.confidence < self.min_score {
            return false;
        }
        let label = prediction.label.to_lowercase();
        self.labels.iter().any(|fragment| label.contains(fragment))
    }

    fn top_suspicious(&self, predictions: &[ObjectPrediction]) -> Option<(String, f32)> {
        predictions
            .iter()
            .filter(|prediction| self.is_suspicious(prediction))
            .max_by(|left, right| left.confidence.total_cmp(&right.confidence))
            .map(|prediction| (prediction.label.to_lowercase(), prediction.confidence))
    }
}
