//! Alert dispatcher: turns confirmed transitions into alerts.
//!
//! Severity comes from a fixed table keyed by kind. Evidence is captured
//! before the alert is built so the frame matches the moment of
//! confirmation. Dispatch is fire-and-forget; ordering, retries and
//! publication to the live feed belong to the delivery worker.

use crate::channel::Transition;
use crate::config::EvidencePolicy;
use crate::delivery::{DeliveryJob, DeliverySender};
use crate::evidence::{CapturedEvidence, EvidenceCapture};
use crate::types::SessionId;
use chrono::{SecondsFormat, Utc};
use proctor_daemon_protocol::{Alert, AlertKind, Severity};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{error, info, warn};

pub const MANUAL_TEST_DETAILS: &str = "manual test";

pub fn severity_for(kind: AlertKind) -> Severity {
    match kind {
        AlertKind::NoFace | AlertKind::MultipleFaces | AlertKind::SuspiciousObject => {
            Severity::High
        }
        AlertKind::AudioActivity => Severity::Medium,
        AlertKind::TabSwitch | AlertKind::ManualTest => Severity::Low,
    }
}

pub struct AlertDispatcher {
    capture: EvidenceCapture,
    policy: EvidencePolicy,
    delivery: DeliverySender,
    confirmed: AtomicU32,
}

impl AlertDispatcher {
    pub fn new(capture: EvidenceCapture, policy: EvidencePolicy, delivery: DeliverySender) -> Self {
        Self {
            capture,
            policy,
            delivery,
            confirmed: AtomicU32::new(0),
        }
    }

    /// Dispatches a channel transition using the severity table and the
    /// evidence policy for its kind.
    pub fn dispatch_transition(&self, session_id: &SessionId, transition: Transition) -> Alert {
        let capture = self.policy.captures(transition.kind);
        self.dispatch(
            session_id,
            transition.kind,
            severity_for(transition.kind),
            transition.details,
            capture,
        )
    }

    pub fn dispatch(
        &self,
        session_id: &SessionId,
        kind: AlertKind,
        severity: Severity,
        details: String,
        capture_evidence: bool,
    ) -> Alert {
        let evidence = if capture_evidence {
            match self.capture.capture_frame(session_id) {
                Ok(evidence) => Some(evidence),
                Err(err) => {
                    warn!(
                        session_id = %session_id,
                        kind = kind.as_str(),
                        error = %err,
                        "Recording alert without evidence"
                    );
                    None
                }
            }
        } else {
            None
        };

        let alert = Alert {
            alert_id: ulid::Ulid::new().to_string(),
            session_id: session_id.to_string(),
            kind,
            severity,
            details,
            recorded_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            evidence_id: None,
        };
        self.confirmed.fetch_add(1, Ordering::SeqCst);
        info!(
            session_id = %session_id,
            alert_id = %alert.alert_id,
            kind = kind.as_str(),
            severity = severity.as_str(),
            details = %alert.details,
            with_evidence = evidence.is_some(),
            "Alert confirmed"
        );

        self.enqueue(DeliveryJob::Alert {
            alert: alert.clone(),
            evidence,
        });
        alert
    }

    /// Submits a recorded audio chunk as standalone evidence.
    pub fn submit_audio_chunk(&self, session_id: &SessionId, bytes: Vec<u8>) {
        if let Some(evidence) = self.capture.audio_chunk(session_id, bytes) {
            self.enqueue_evidence(evidence);
        }
    }

    /// Alerts confirmed locally during this session.
    pub fn confirmed_count(&self) -> u32 {
        self.confirmed.load(Ordering::SeqCst)
    }

    fn enqueue_evidence(&self, evidence: CapturedEvidence) {
        self.enqueue(DeliveryJob::Evidence(evidence));
    }

    fn enqueue(&self, job: DeliveryJob) {
        if !self.delivery.enqueue(job) {
            error!("Delivery worker is gone; job not queued");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryConfig;
    use crate::delivery::{DeliveryQueue, SharedStatus};
    use crate::feed::{FeedEvent, LiveFeed};
    use crate::sensors::{Frame, FrameSource};
    use crate::store::{MemorySessionStore, SessionStore};
    use std::collections::VecDeque;
    use std::sync::Arc;

    struct Frames(Option<Frame>);

    impl FrameSource for Frames {
        fn current_frame(&self) -> Option<Frame> {
            self.0.clone()
        }
    }

    fn setup(frame: Option<Frame>) -> (Arc<MemorySessionStore>, SessionId, DeliveryQueue, AlertDispatcher, LiveFeed) {
        let store = Arc::new(MemorySessionStore::new());
        let started = store.start_session("client").unwrap();
        let session_id = SessionId::new(started.session_id).unwrap();
        let feed = LiveFeed::new(16);
        let queue = DeliveryQueue::spawn(
            store.clone(),
            feed.clone(),
            DeliveryConfig::default(),
            VecDeque::new(),
            SharedStatus::default(),
        )
        .unwrap();
        let dispatcher = AlertDispatcher::new(
            EvidenceCapture::new(Arc::new(Frames(frame))),
            EvidencePolicy::default(),
            queue.sender(),
        );
        (store, session_id, queue, dispatcher, feed)
    }

    #[test]
    fn severity_table_is_fixed_by_kind() {
        assert_eq!(severity_for(AlertKind::NoFace), Severity::High);
        assert_eq!(severity_for(AlertKind::MultipleFaces), Severity::High);
        assert_eq!(severity_for(AlertKind::SuspiciousObject), Severity::High);
        assert_eq!(severity_for(AlertKind::AudioActivity), Severity::Medium);
        assert_eq!(severity_for(AlertKind::TabSwitch), Severity::Low);
        assert_eq!(severity_for(AlertKind::ManualTest), Severity::Low);
    }

    #[test]
    fn alert_links_captured_frame() {
        let (store, session_id, queue, dispatcher, _feed) =
            setup(Some(Frame::new(vec![0xFFu8, 0xD8, 0xFF], 1, 1)));
        let alert = dispatcher.dispatch_transition(
            &session_id,
            Transition::new(AlertKind::SuspiciousObject, "Detected laptop (0.80)"),
        );
        assert_eq!(alert.severity, Severity::High);
        assert!(queue.shutdown().is_empty());

        let report = store.report(session_id.as_str()).unwrap();
        assert_eq!(report.evidence.len(), 1);
        assert_eq!(
            report.alerts[0].evidence_id.as_deref(),
            Some(report.evidence[0].evidence_id.as_str())
        );
    }

    #[test]
    fn capture_failure_still_creates_alert() {
        let (store, session_id, queue, dispatcher, feed) = setup(None);
        let subscription = feed.subscribe();
        dispatcher.dispatch(
            &session_id,
            AlertKind::NoFace,
            Severity::High,
            "No face detected for > 4s".to_string(),
            true,
        );
        assert!(queue.shutdown().is_empty());

        let report = store.report(session_id.as_str()).unwrap();
        assert_eq!(report.alerts.len(), 1);
        assert!(report.alerts[0].evidence_id.is_none());
        assert!(report.evidence.is_empty());
        assert!(matches!(subscription.try_next(), Some(FeedEvent::Alert(_))));
        assert_eq!(dispatcher.confirmed_count(), 1);
    }

    #[test]
    fn tab_switch_skips_evidence_by_policy() {
        let (store, session_id, queue, dispatcher, _feed) =
            setup(Some(Frame::new(vec![1u8], 1, 1)));
        dispatcher.dispatch_transition(
            &session_id,
            Transition::new(AlertKind::TabSwitch, "window_blur"),
        );
        assert!(queue.shutdown().is_empty());
        assert!(store
            .report(session_id.as_str())
            .unwrap()
            .evidence
            .is_empty());
    }
}
