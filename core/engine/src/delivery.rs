//! Ordered, retrying delivery of alerts, evidence and deferred session closes
//! to the session store.
//!
//! A single worker thread drains an mpsc queue in FIFO order, so `dispatch`
//! never waits on the store. A job that exhausts its attempts moves to the
//! backlog; later jobs queue behind it so arrival order at the store matches
//! confirmation order. The backlog is retried on a fixed interval and on
//! demand, and is handed back to the caller when the worker shuts down.

use crate::config::DeliveryConfig;
use crate::error::{ProctorError, StoreError};
use crate::evidence::CapturedEvidence;
use crate::feed::{FeedEvent, LiveFeed};
use crate::store::SessionStore;
use proctor_daemon_protocol::Alert;
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryJob {
    /// Once the evidence is stored it is dropped from the job and its id is
    /// written into the alert, so a retry never uploads it twice.
    Alert {
        alert: Alert,
        evidence: Option<CapturedEvidence>,
    },
    Evidence(CapturedEvidence),
    /// A session end the store never acknowledged. The store still counts the
    /// session as active for this client until it is closed.
    EndSession { session_id: String },
}

impl DeliveryJob {
    fn label(&self) -> &'static str {
        match self {
            DeliveryJob::Alert { .. } => "alert delivery",
            DeliveryJob::Evidence(_) => "evidence delivery",
            DeliveryJob::EndSession { .. } => "session close",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStatus {
    pub delivered: u64,
    pub pending: usize,
    pub rejected: u64,
}

pub type SharedStatus = Arc<Mutex<DeliveryStatus>>;

enum Command {
    Deliver(DeliveryJob),
    Flush,
    Shutdown,
}

/// Delay before retry number `attempt` (1-based): doubling, capped, plus up
/// to 20% jitter.
pub fn backoff_delay(config: &DeliveryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = config
        .backoff_base_ms
        .saturating_mul(1u64 << exponent)
        .min(config.backoff_max_ms);
    let jitter = if delay >= 5 {
        rand::thread_rng().gen_range(0..=delay / 5)
    } else {
        0
    };
    Duration::from_millis(delay + jitter)
}

/// Runs `call` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent.
pub fn with_retry<T, F>(config: &DeliveryConfig, label: &str, mut call: F) -> Result<T, ProctorError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match call() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = backoff_delay(config, attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "{} failed; retrying",
                    label
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) if err.is_retryable() => {
                return Err(ProctorError::DispatchDeliveryFailure {
                    attempts: attempt,
                    source: err,
                })
            }
            Err(err) => return Err(ProctorError::Store(err)),
        }
    }
}

/// Cloneable enqueue handle held by the dispatcher.
#[derive(Clone)]
pub struct DeliverySender {
    sender: Sender<Command>,
}

impl DeliverySender {
    /// Returns `false` if the worker has already shut down.
    pub fn enqueue(&self, job: DeliveryJob) -> bool {
        self.sender.send(Command::Deliver(job)).is_ok()
    }
}

pub struct DeliveryQueue {
    sender: Sender<Command>,
    handle: Option<JoinHandle<VecDeque<DeliveryJob>>>,
}

impl DeliveryQueue {
    /// Starts a worker. `carryover` is the backlog left by a previous worker
    /// and is delivered before anything new.
    pub fn spawn(
        store: Arc<dyn SessionStore>,
        feed: LiveFeed,
        config: DeliveryConfig,
        carryover: VecDeque<DeliveryJob>,
        status: SharedStatus,
    ) -> Result<Self, ProctorError> {
        let (sender, receiver) = mpsc::channel();
        let worker = DeliveryWorker {
            store,
            feed,
            config,
            backlog: carryover,
            status,
        };
        let handle = thread::Builder::new()
            .name("proctor-delivery".to_string())
            .spawn(move || worker.run(receiver))
            .map_err(|err| ProctorError::Io {
                context: "spawning delivery worker".to_string(),
                source: err,
            })?;
        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    pub fn sender(&self) -> DeliverySender {
        DeliverySender {
            sender: self.sender.clone(),
        }
    }

    pub fn flush(&self) {
        let _ = self.sender.send(Command::Flush);
    }

    /// Delivers everything already queued, then stops the worker and returns
    /// whatever could not be delivered.
    pub fn shutdown(mut self) -> VecDeque<DeliveryJob> {
        self.stop()
    }

    fn stop(&mut self) -> VecDeque<DeliveryJob> {
        let Some(handle) = self.handle.take() else {
            return VecDeque::new();
        };
        let _ = self.sender.send(Command::Shutdown);
        match handle.join() {
            Ok(leftover) => leftover,
            Err(_) => {
                error!("Delivery worker panicked; queued jobs lost");
                VecDeque::new()
            }
        }
    }
}

impl Drop for DeliveryQueue {
    fn drop(&mut self) {
        let leftover = self.stop();
        if !leftover.is_empty() {
            warn!(
                count = leftover.len(),
                "Delivery queue dropped with undelivered jobs"
            );
        }
    }
}

/// Single-attempt pass over `jobs` on the calling thread. Returns what is
/// still undelivered.
pub(crate) fn flush_jobs(
    store: Arc<dyn SessionStore>,
    feed: LiveFeed,
    config: DeliveryConfig,
    jobs: VecDeque<DeliveryJob>,
    status: SharedStatus,
) -> VecDeque<DeliveryJob> {
    let mut worker = DeliveryWorker {
        store,
        feed,
        config,
        backlog: jobs,
        status,
    };
    worker.flush_backlog();
    worker.backlog
}

enum Outcome {
    Delivered,
    Rejected,
    Failed(DeliveryJob),
}

struct DeliveryWorker {
    store: Arc<dyn SessionStore>,
    feed: LiveFeed,
    config: DeliveryConfig,
    backlog: VecDeque<DeliveryJob>,
    status: SharedStatus,
}

impl DeliveryWorker {
    fn run(mut self, receiver: mpsc::Receiver<Command>) -> VecDeque<DeliveryJob> {
        let flush_interval = Duration::from_millis(self.config.flush_interval_ms.max(1));
        if !self.backlog.is_empty() {
            info!(count = self.backlog.len(), "Resuming delivery backlog");
            self.flush_backlog();
        }

        loop {
            match receiver.recv_timeout(flush_interval) {
                Ok(Command::Deliver(job)) => self.handle(job),
                Ok(Command::Flush) => self.flush_backlog(),
                Err(RecvTimeoutError::Timeout) => {
                    if !self.backlog.is_empty() {
                        self.flush_backlog();
                    }
                }
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    self.flush_backlog();
                    break;
                }
            }
        }

        if !self.backlog.is_empty() {
            warn!(
                count = self.backlog.len(),
                "Delivery worker stopping with undelivered jobs"
            );
        }
        self.backlog
    }

    fn handle(&mut self, job: DeliveryJob) {
        if !self.backlog.is_empty() {
            self.flush_backlog();
        }
        if !self.backlog.is_empty() {
            self.backlog.push_back(job);
            self.publish_pending();
            return;
        }

        if let Outcome::Failed(job) = self.process(job, true) {
            self.backlog.push_back(job);
            self.publish_pending();
        }
    }

    fn flush_backlog(&mut self) {
        if self.backlog.is_empty() {
            return;
        }
        while let Some(job) = self.backlog.pop_front() {
            if let Outcome::Failed(job) = self.process(job, false) {
                self.backlog.push_front(job);
                break;
            }
        }

        self.update_status(|status| status.pending = self.backlog.len());
        if self.backlog.is_empty() {
            info!("Delivery backlog drained");
            self.feed.publish(FeedEvent::DeliveryRestored);
        } else {
            debug!(count = self.backlog.len(), "Delivery backlog still pending");
        }
    }

    fn process(&mut self, mut job: DeliveryJob, retry: bool) -> Outcome {
        let config = if retry {
            self.config.clone()
        } else {
            DeliveryConfig {
                max_attempts: 1,
                ..self.config.clone()
            }
        };
        let store = Arc::clone(&self.store);
        let label = job.label();

        let result = with_retry(&config, label, || deliver_once(store.as_ref(), &mut job));
        match result {
            Ok(stored) => {
                self.update_status(|status| status.delivered += 1);
                if let Some(alert) = stored {
                    info!(
                        alert_id = %alert.alert_id,
                        session_id = %alert.session_id,
                        kind = alert.kind.as_str(),
                        "Alert delivered"
                    );
                    self.feed.publish(FeedEvent::Alert(alert));
                }
                Outcome::Delivered
            }
            Err(ProctorError::Store(err)) => {
                let (code, message) = match err {
                    StoreError::Rejected { code, message } => (code, message),
                    other => ("malformed".to_string(), other.to_string()),
                };
                error!(code = %code, message = %message, "{} rejected by session store", label);
                self.update_status(|status| status.rejected += 1);
                self.feed
                    .publish(FeedEvent::DeliveryRejected { code, message });
                Outcome::Rejected
            }
            Err(err) => {
                warn!(error = %err, "{} deferred to backlog", label);
                Outcome::Failed(job)
            }
        }
    }

    fn publish_pending(&self) {
        let backlog = self.backlog.len();
        self.update_status(|status| status.pending = backlog);
        self.feed.publish(FeedEvent::DeliveryPending { backlog });
    }

    fn update_status<F: FnOnce(&mut DeliveryStatus)>(&self, apply: F) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut status);
    }
}

fn deliver_once(store: &dyn SessionStore, job: &mut DeliveryJob) -> Result<Option<Alert>, StoreError> {
    match job {
        DeliveryJob::Alert { alert, evidence } => {
            let uploaded = evidence
                .as_ref()
                .map(|captured| store.submit_evidence(captured));
            match uploaded {
                Some(Ok(reference)) => {
                    alert.evidence_id = Some(reference.evidence_id);
                    *evidence = None;
                }
                Some(Err(err)) if err.is_retryable() => return Err(err),
                Some(Err(err)) => {
                    warn!(
                        alert_id = %alert.alert_id,
                        error = %err,
                        "Evidence rejected; delivering alert without it"
                    );
                    *evidence = None;
                }
                None => {}
            }
            store.submit_alert(alert).map(Some)
        }
        DeliveryJob::Evidence(captured) => store.submit_evidence(captured).map(|_| None),
        DeliveryJob::EndSession { session_id } => {
            let closed = store.end_session(session_id)?;
            info!(
                session_id = %closed.session_id,
                risk_score = closed.risk_score,
                already_ended = closed.already_ended,
                "Deferred session close delivered"
            );
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;
    use crate::types::SessionId;
    use chrono::Utc;
    use proctor_daemon_protocol::{
        AlertKind, EvidenceKind, EvidenceRef, SessionClosed, SessionStarted, Severity,
    };
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Wraps the in-memory store and fails transport calls while `down` is set.
    struct SwitchableStore {
        inner: MemorySessionStore,
        down: AtomicBool,
        evidence_calls: AtomicUsize,
        alert_calls: AtomicUsize,
    }

    impl SwitchableStore {
        fn new() -> Self {
            Self {
                inner: MemorySessionStore::new(),
                down: AtomicBool::new(false),
                evidence_calls: AtomicUsize::new(0),
                alert_calls: AtomicUsize::new(0),
            }
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    impl SessionStore for SwitchableStore {
        fn start_session(&self, client_id: &str) -> Result<SessionStarted, StoreError> {
            self.inner.start_session(client_id)
        }

        fn end_session(&self, session_id: &str) -> Result<SessionClosed, StoreError> {
            self.inner.end_session(session_id)
        }

        fn submit_alert(&self, alert: &Alert) -> Result<Alert, StoreError> {
            self.alert_calls.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            self.inner.submit_alert(alert)
        }

        fn submit_evidence(&self, evidence: &CapturedEvidence) -> Result<EvidenceRef, StoreError> {
            self.evidence_calls.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            self.inner.submit_evidence(evidence)
        }
    }

    /// Stores evidence, then fails every alert submission.
    struct AlertOutageStore {
        inner: MemorySessionStore,
        evidence_calls: AtomicUsize,
    }

    impl SessionStore for AlertOutageStore {
        fn start_session(&self, client_id: &str) -> Result<SessionStarted, StoreError> {
            self.inner.start_session(client_id)
        }

        fn end_session(&self, session_id: &str) -> Result<SessionClosed, StoreError> {
            self.inner.end_session(session_id)
        }

        fn submit_alert(&self, _alert: &Alert) -> Result<Alert, StoreError> {
            Err(StoreError::Unavailable("timeout".to_string()))
        }

        fn submit_evidence(&self, evidence: &CapturedEvidence) -> Result<EvidenceRef, StoreError> {
            self.evidence_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.submit_evidence(evidence)
        }
    }

    fn fast_config() -> DeliveryConfig {
        DeliveryConfig {
            max_attempts: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            flush_interval_ms: 60_000,
        }
    }

    fn make_alert(session_id: &str, details: &str) -> Alert {
        Alert {
            alert_id: ulid::Ulid::new().to_string(),
            session_id: session_id.to_string(),
            kind: AlertKind::TabSwitch,
            severity: Severity::Low,
            details: details.to_string(),
            recorded_at: Utc::now().to_rfc3339(),
            evidence_id: None,
        }
    }

    fn alert_job(alert: Alert) -> DeliveryJob {
        DeliveryJob::Alert {
            alert,
            evidence: None,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = DeliveryConfig::default();
        let first = backoff_delay(&config, 1).as_millis() as u64;
        let second = backoff_delay(&config, 2).as_millis() as u64;
        let late = backoff_delay(&config, 10).as_millis() as u64;
        assert!((250..=300).contains(&first));
        assert!((500..=600).contains(&second));
        assert!((2_000..=2_400).contains(&late));
    }

    #[test]
    fn retry_reports_attempts_for_transport_errors() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), ProctorError> = with_retry(&fast_config(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("down".to_string()))
        });
        assert!(matches!(
            result,
            Err(ProctorError::DispatchDeliveryFailure { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn rejected_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), ProctorError> = with_retry(&fast_config(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Rejected {
                code: "unknown_session".to_string(),
                message: "nope".to_string(),
            })
        });
        assert!(matches!(result, Err(ProctorError::Store(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delivers_in_order_and_publishes_after_acceptance() {
        let store = Arc::new(MemorySessionStore::new());
        let session = store.start_session("client").unwrap();
        let feed = LiveFeed::new(16);
        let subscription = feed.subscribe();
        let status = SharedStatus::default();

        let queue = DeliveryQueue::spawn(
            store.clone(),
            feed,
            fast_config(),
            VecDeque::new(),
            Arc::clone(&status),
        )
        .unwrap();
        let sender = queue.sender();
        for index in 0..5 {
            assert!(sender.enqueue(alert_job(make_alert(
                &session.session_id,
                &format!("alert-{}", index)
            ))));
        }
        let leftover = queue.shutdown();

        assert!(leftover.is_empty());
        let details: Vec<String> = store
            .report(&session.session_id)
            .unwrap()
            .alerts
            .into_iter()
            .map(|alert| alert.details)
            .collect();
        assert_eq!(details, vec!["alert-0", "alert-1", "alert-2", "alert-3", "alert-4"]);

        let published = subscription
            .drain()
            .into_iter()
            .filter(|event| matches!(event, FeedEvent::Alert(_)))
            .count();
        assert_eq!(published, 5);
        assert_eq!(status.lock().unwrap().delivered, 5);
    }

    #[test]
    fn outage_moves_jobs_to_backlog_and_flush_restores_order() {
        let store = Arc::new(SwitchableStore::new());
        let session = store.start_session("client").unwrap();
        let feed = LiveFeed::new(32);
        let subscription = feed.subscribe();
        let status = SharedStatus::default();

        store.down.store(true, Ordering::SeqCst);
        let queue = DeliveryQueue::spawn(
            store.clone(),
            feed.clone(),
            fast_config(),
            VecDeque::new(),
            Arc::clone(&status),
        )
        .unwrap();
        let sender = queue.sender();
        sender.enqueue(alert_job(make_alert(&session.session_id, "first")));
        sender.enqueue(alert_job(make_alert(&session.session_id, "second")));
        let leftover = queue.shutdown();

        assert_eq!(leftover.len(), 2);
        assert_eq!(status.lock().unwrap().pending, 2);
        let events = subscription.drain();
        assert!(events.contains(&FeedEvent::DeliveryPending { backlog: 1 }));
        assert!(events.contains(&FeedEvent::DeliveryPending { backlog: 2 }));
        assert!(!events.iter().any(|event| matches!(event, FeedEvent::Alert(_))));

        store.down.store(false, Ordering::SeqCst);
        let remaining = flush_jobs(
            store.clone(),
            feed,
            fast_config(),
            leftover,
            Arc::clone(&status),
        );
        assert!(remaining.is_empty());

        let details: Vec<String> = store
            .inner
            .report(&session.session_id)
            .unwrap()
            .alerts
            .into_iter()
            .map(|alert| alert.details)
            .collect();
        assert_eq!(details, vec!["first", "second"]);
        assert!(subscription.drain().contains(&FeedEvent::DeliveryRestored));
        assert_eq!(status.lock().unwrap().pending, 0);
        assert_eq!(status.lock().unwrap().delivered, 2);
    }

    #[test]
    fn carryover_is_delivered_before_new_jobs() {
        let store = Arc::new(MemorySessionStore::new());
        let session = store.start_session("client").unwrap();
        let carryover: VecDeque<DeliveryJob> =
            vec![alert_job(make_alert(&session.session_id, "old"))].into();

        let queue = DeliveryQueue::spawn(
            store.clone(),
            LiveFeed::new(8),
            fast_config(),
            carryover,
            SharedStatus::default(),
        )
        .unwrap();
        queue
            .sender()
            .enqueue(alert_job(make_alert(&session.session_id, "new")));
        assert!(queue.shutdown().is_empty());

        let details: Vec<String> = store
            .report(&session.session_id)
            .unwrap()
            .alerts
            .into_iter()
            .map(|alert| alert.details)
            .collect();
        assert_eq!(details, vec!["old", "new"]);
    }

    #[test]
    fn deferred_session_close_is_flushed_after_alerts() {
        let store = Arc::new(MemorySessionStore::new());
        let session = store.start_session("client").unwrap();
        let jobs: VecDeque<DeliveryJob> = vec![
            alert_job(make_alert(&session.session_id, "late")),
            DeliveryJob::EndSession {
                session_id: session.session_id.clone(),
            },
        ]
        .into();
        let status = SharedStatus::default();

        let remaining = flush_jobs(
            store.clone(),
            LiveFeed::new(8),
            fast_config(),
            jobs,
            Arc::clone(&status),
        );
        assert!(remaining.is_empty());
        assert_eq!(status.lock().unwrap().delivered, 2);

        let report = store.report(&session.session_id).unwrap();
        assert!(report.ended_at.is_some());
        assert_eq!(report.risk_score, 1);
        assert!(store.start_session("client").is_ok());
    }

    #[test]
    fn evidence_is_uploaded_once_across_retries() {
        let store = Arc::new(AlertOutageStore {
            inner: MemorySessionStore::new(),
            evidence_calls: AtomicUsize::new(0),
        });
        let session = store.start_session("client").unwrap();
        let session_id = SessionId::new(session.session_id.clone()).unwrap();
        let evidence = CapturedEvidence::new(&session_id, EvidenceKind::Image, vec![1, 2, 3]);
        let evidence_id = evidence.evidence_id.clone();

        let queue = DeliveryQueue::spawn(
            store.clone(),
            LiveFeed::new(8),
            fast_config(),
            VecDeque::new(),
            SharedStatus::default(),
        )
        .unwrap();
        queue.sender().enqueue(DeliveryJob::Alert {
            alert: make_alert(&session.session_id, "with frame"),
            evidence: Some(evidence),
        });
        let leftover = queue.shutdown();

        assert_eq!(store.evidence_calls.load(Ordering::SeqCst), 1);
        match leftover.front() {
            Some(DeliveryJob::Alert { alert, evidence }) => {
                assert!(evidence.is_none());
                assert_eq!(alert.evidence_id.as_deref(), Some(evidence_id.as_str()));
            }
            other => panic!("unexpected leftover: {:?}", other),
        }
    }

    #[test]
    fn rejected_job_is_counted_and_surfaced() {
        let store = Arc::new(MemorySessionStore::new());
        let feed = LiveFeed::new(8);
        let subscription = feed.subscribe();
        let status = SharedStatus::default();

        let queue = DeliveryQueue::spawn(
            store.clone(),
            feed,
            fast_config(),
            VecDeque::new(),
            Arc::clone(&status),
        )
        .unwrap();
        queue
            .sender()
            .enqueue(alert_job(make_alert("no-such-session", "orphan")));
        assert!(queue.shutdown().is_empty());

        assert_eq!(status.lock().unwrap().rejected, 1);
        assert!(subscription.drain().iter().any(|event| matches!(
            event,
            FeedEvent::DeliveryRejected { code, .. } if code == "unknown_session"
        )));
    }

    #[test]
    fn evidence_only_job_is_not_published_as_alert() {
        let store = Arc::new(SwitchableStore::new());
        let session = store.start_session("client").unwrap();
        let session_id = SessionId::new(session.session_id.clone()).unwrap();
        let feed = LiveFeed::new(8);
        let subscription = feed.subscribe();

        let queue = DeliveryQueue::spawn(
            store.clone(),
            feed,
            fast_config(),
            VecDeque::new(),
            SharedStatus::default(),
        )
        .unwrap();
        queue.sender().enqueue(DeliveryJob::Evidence(CapturedEvidence::new(
            &session_id,
            EvidenceKind::Audio,
            b"chunk".to_vec(),
        )));
        assert!(queue.shutdown().is_empty());

        assert!(subscription.drain().is_empty());
        assert_eq!(store.alert_calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            store.inner.report(&session.session_id).unwrap().evidence.len(),
            1
        );
    }
}
