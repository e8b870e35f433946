use proctor_engine::{
    AlertKind, AudioSampler, BoundingBox, CapturedEvidence, EngineConfig, FaceDetector,
    FaceRegion, FeedEvent, FocusNotification, Frame, FrameSource, LifecycleState, MediaProvider,
    MemorySessionStore, ObjectDetector, ObjectPrediction, ProctorEngine, ProctorError, Sensors,
    SessionStore, Severity, StoreError,
};
use proctor_daemon_protocol::{Alert, EvidenceRef, SessionClosed, SessionStarted};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ═════════════════════════════════════════════════════════════════════════════
// Scripted sensors
// ═════════════════════════════════════════════════════════════════════════════

struct Script {
    frame: Mutex<Option<Frame>>,
    frame_calls: AtomicUsize,
    /// 1-based `current_frame` call that panics; 0 never panics.
    frame_panic_on: AtomicUsize,
    faces: AtomicUsize,
    face_failure: AtomicBool,
    objects: Mutex<Vec<ObjectPrediction>>,
    energy: Mutex<f32>,
}

impl Script {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            frame: Mutex::new(Some(Frame::new(vec![0xFFu8, 0xD8, 0xFF, 0xE0], 4, 4))),
            frame_calls: AtomicUsize::new(0),
            frame_panic_on: AtomicUsize::new(0),
            faces: AtomicUsize::new(1),
            face_failure: AtomicBool::new(false),
            objects: Mutex::new(Vec::new()),
            energy: Mutex::new(0.0),
        })
    }

    fn set_faces(&self, count: usize) {
        self.faces.store(count, Ordering::SeqCst);
    }
}

impl FrameSource for Script {
    fn current_frame(&self) -> Option<Frame> {
        let call = self.frame_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.frame_panic_on.load(Ordering::SeqCst) {
            panic!("camera driver crashed");
        }
        self.frame.lock().unwrap().clone()
    }
}

impl FaceDetector for Script {
    fn detect_faces(&self, _frame: &Frame) -> Result<Vec<FaceRegion>, String> {
        if self.face_failure.load(Ordering::SeqCst) {
            return Err("face model not loaded".to_string());
        }
        let region = FaceRegion {
            bounding_box: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 32.0,
                height: 32.0,
            },
            confidence: 0.93,
        };
        Ok(vec![region; self.faces.load(Ordering::SeqCst)])
    }
}

impl ObjectDetector for Script {
    fn detect_objects(&self, _frame: &Frame) -> Result<Vec<ObjectPrediction>, String> {
        Ok(self.objects.lock().unwrap().clone())
    }
}

impl AudioSampler for Script {
    fn current_energy(&self) -> Result<f32, String> {
        Ok(*self.energy.lock().unwrap())
    }
}

struct FakeMedia {
    script: Arc<Script>,
    deny: AtomicBool,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl FakeMedia {
    fn new(script: Arc<Script>) -> Arc<Self> {
        Arc::new(Self {
            script,
            deny: AtomicBool::new(false),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        })
    }
}

impl MediaProvider for FakeMedia {
    fn acquire(&self) -> Result<Sensors, String> {
        if self.deny.load(Ordering::SeqCst) {
            return Err("camera permission denied".to_string());
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Sensors {
            frames: self.script.clone(),
            faces: self.script.clone(),
            objects: Some(self.script.clone()),
            audio: Some(self.script.clone()),
            recorder: None,
        })
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-memory store whose submissions and session closes can be switched off.
struct FlakyStore {
    inner: MemorySessionStore,
    down: AtomicBool,
    close_down: AtomicBool,
}

impl FlakyStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemorySessionStore::new(),
            down: AtomicBool::new(false),
            close_down: AtomicBool::new(false),
        })
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection reset".to_string()))
        } else {
            Ok(())
        }
    }
}

impl SessionStore for FlakyStore {
    fn start_session(&self, client_id: &str) -> Result<SessionStarted, StoreError> {
        self.inner.start_session(client_id)
    }

    fn end_session(&self, session_id: &str) -> Result<SessionClosed, StoreError> {
        if self.close_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        self.inner.end_session(session_id)
    }

    fn submit_alert(&self, alert: &Alert) -> Result<Alert, StoreError> {
        self.check()?;
        self.inner.submit_alert(alert)
    }

    fn submit_evidence(&self, evidence: &CapturedEvidence) -> Result<EvidenceRef, StoreError> {
        self.check()?;
        self.inner.submit_evidence(evidence)
    }
}

// ═════════════════════════════════════════════════════════════════════════════
// Helpers
// ═════════════════════════════════════════════════════════════════════════════

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.client_id = Some("exam-laptop-7".to_string());
    config.delivery.backoff_base_ms = 1;
    config.delivery.backoff_max_ms = 2;
    config
}

struct Harness {
    script: Arc<Script>,
    media: Arc<FakeMedia>,
    store: Arc<MemorySessionStore>,
    engine: ProctorEngine,
}

fn harness() -> Harness {
    let script = Script::new();
    let media = FakeMedia::new(script.clone());
    let store = Arc::new(MemorySessionStore::new());
    let engine = ProctorEngine::new(test_config(), media.clone(), store.clone());
    Harness {
        script,
        media,
        store,
        engine,
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// Drives visual ticks at the 700 ms cadence over `[from, until]`.
fn run_visual(engine: &ProctorEngine, t0: Instant, from: u64, until: u64) -> Vec<Alert> {
    (from..=until)
        .step_by(700)
        .flat_map(|at| engine.tick_visual(t0 + ms(at)))
        .collect()
}

fn kinds(alerts: &[Alert]) -> Vec<AlertKind> {
    alerts.iter().map(|alert| alert.kind).collect()
}

// ═════════════════════════════════════════════════════════════════════════════
// End-to-end scenarios
// ═════════════════════════════════════════════════════════════════════════════

#[test]
fn scenario_a_missing_face_raises_one_high_alert() {
    let h = harness();
    let session_id = h.engine.start_manual().unwrap();
    h.script.set_faces(0);

    let t0 = Instant::now();
    let alerts = run_visual(&h.engine, t0, 0, 5_000);
    assert_eq!(kinds(&alerts), vec![AlertKind::NoFace]);
    assert_eq!(alerts[0].severity, Severity::High);
    assert_eq!(alerts[0].details, "No face detected for > 4s");

    let outcome = h.engine.end().unwrap();
    assert_eq!(outcome.risk_score, 1);
    assert_eq!(outcome.undelivered, 0);

    let report = h.store.report(session_id.as_str()).unwrap();
    assert_eq!(report.alerts.len(), 1);
    assert_eq!(report.risk_score, 1);
    assert_eq!(report.evidence.len(), 1);
    assert_eq!(
        report.alerts[0].evidence_id.as_deref(),
        Some(report.evidence[0].evidence_id.as_str())
    );
}

#[test]
fn scenario_b_two_faces_alert_once_without_gap() {
    let h = harness();
    h.engine.start_manual().unwrap();
    h.script.set_faces(2);

    let t0 = Instant::now();
    let first = run_visual(&h.engine, t0, 0, 1_500);
    assert_eq!(kinds(&first), vec![AlertKind::MultipleFaces]);
    assert_eq!(first[0].details, "Detected 2 faces in frame");

    let continued = run_visual(&h.engine, t0, 2_100, 3_000);
    assert!(continued.is_empty());
    h.engine.end().unwrap();
}

#[test]
fn scenario_c_capture_failure_keeps_alert_without_evidence() {
    let h = harness();
    let session_id = h.engine.start_manual().unwrap();
    *h.script.frame.lock().unwrap() = Some(Frame::new(Vec::new(), 0, 0));
    h.script.set_faces(0);

    let alerts = run_visual(&h.engine, Instant::now(), 0, 5_000);
    assert_eq!(kinds(&alerts), vec![AlertKind::NoFace]);
    h.engine.end().unwrap();

    let report = h.store.report(session_id.as_str()).unwrap();
    assert_eq!(report.alerts.len(), 1);
    assert!(report.alerts[0].evidence_id.is_none());
    assert!(report.evidence.is_empty());
}

#[test]
fn scenario_d_store_end_is_idempotent_engine_end_is_strict() {
    let h = harness();
    let session_id = h.engine.start_manual().unwrap();
    h.engine.end().unwrap();

    let again = h.store.end_session(session_id.as_str()).unwrap();
    assert!(again.already_ended);

    let err = h.engine.end().unwrap_err();
    assert!(matches!(err, ProctorError::SessionStateViolation(_)));
    assert_eq!(h.engine.state(), LifecycleState::Ended);
}

// ═════════════════════════════════════════════════════════════════════════════
// Lifecycle
// ═════════════════════════════════════════════════════════════════════════════

#[test]
fn end_before_start_is_a_state_violation() {
    let h = harness();
    assert!(matches!(
        h.engine.end(),
        Err(ProctorError::SessionStateViolation(_))
    ));
    assert_eq!(h.engine.state(), LifecycleState::None);
}

#[test]
fn second_start_while_active_is_refused() {
    let h = harness();
    h.engine.start_manual().unwrap();
    assert!(matches!(
        h.engine.start_manual(),
        Err(ProctorError::SessionStateViolation(_))
    ));
    assert_eq!(h.media.acquired.load(Ordering::SeqCst), 1);
    h.engine.end().unwrap();
}

#[test]
fn denied_media_never_reaches_active() {
    let h = harness();
    h.media.deny.store(true, Ordering::SeqCst);

    let err = h.engine.start_manual().unwrap_err();
    assert!(matches!(err, ProctorError::DetectorUnavailable(_)));
    assert_eq!(h.engine.state(), LifecycleState::None);
    assert!(h.store.list_sessions().is_empty());

    h.media.deny.store(false, Ordering::SeqCst);
    assert!(h.engine.start_manual().is_ok());
    h.engine.end().unwrap();
}

#[test]
fn end_releases_media_and_stops_ticks() {
    let h = harness();
    h.engine.start_manual().unwrap();
    h.engine.end().unwrap();
    assert_eq!(h.media.released.load(Ordering::SeqCst), 1);

    h.script.set_faces(0);
    assert!(run_visual(&h.engine, Instant::now(), 0, 9_000).is_empty());
    assert!(h
        .engine
        .notify_focus(FocusNotification::FocusLost)
        .is_none());
}

#[test]
fn channel_state_does_not_leak_across_sessions() {
    let h = harness();
    let t0 = Instant::now();

    h.engine.start_manual().unwrap();
    h.script.set_faces(0);
    assert!(run_visual(&h.engine, t0, 0, 3_500).is_empty());
    h.engine.end().unwrap();

    h.engine.start_manual().unwrap();
    assert!(run_visual(&h.engine, t0, 4_200, 4_900).is_empty());
    let alerts = run_visual(&h.engine, t0, 5_600, 8_400);
    assert_eq!(kinds(&alerts), vec![AlertKind::NoFace]);
    h.engine.end().unwrap();
}

#[test]
fn focus_listener_is_inert_after_end() {
    let h = harness();
    h.engine.start_manual().unwrap();
    let listener = h.engine.focus_listener().expect("listener");
    let t0 = Instant::now();

    let alert = listener
        .notify_at(FocusNotification::VisibilityHidden, t0)
        .expect("tab switch");
    assert_eq!(alert.kind, AlertKind::TabSwitch);
    assert_eq!(alert.severity, Severity::Low);
    assert_eq!(alert.details, "visibility_hidden");
    assert!(listener
        .notify_at(FocusNotification::FocusLost, t0 + ms(50))
        .is_none());

    h.engine.end().unwrap();
    assert!(listener
        .notify_at(FocusNotification::FocusLost, t0 + ms(10_000))
        .is_none());
}

#[test]
fn manual_test_requires_active_session() {
    let h = harness();
    assert!(matches!(
        h.engine.raise_manual_test(None),
        Err(ProctorError::SessionStateViolation(_))
    ));

    let session_id = h.engine.start_manual().unwrap();
    let alert = h.engine.raise_manual_test(None).unwrap();
    assert_eq!(alert.kind, AlertKind::ManualTest);
    assert_eq!(alert.severity, Severity::Low);
    assert_eq!(alert.details, "manual test");
    h.engine.end().unwrap();

    let report = h.store.report(session_id.as_str()).unwrap();
    assert_eq!(report.alerts.len(), 1);
    assert_eq!(report.evidence.len(), 1);
}

// ═════════════════════════════════════════════════════════════════════════════
// Channel behaviour through the engine
// ═════════════════════════════════════════════════════════════════════════════

#[test]
fn face_flicker_shorter_than_window_never_alerts() {
    let h = harness();
    h.engine.start_manual().unwrap();
    let t0 = Instant::now();
    let mut alerts = Vec::new();

    for (step, faces) in [1, 0, 0, 0, 1, 0, 0, 1, 1, 0].iter().enumerate() {
        h.script.set_faces(*faces);
        alerts.extend(h.engine.tick_visual(t0 + ms(step as u64 * 700)));
    }
    assert!(alerts.is_empty());
    h.engine.end().unwrap();
}

#[test]
fn detector_failure_on_one_tick_is_contained() {
    let h = harness();
    h.engine.start_manual().unwrap();
    h.script.set_faces(2);
    let t0 = Instant::now();

    assert!(h.engine.tick_visual(t0).is_empty());
    h.script.face_failure.store(true, Ordering::SeqCst);
    assert!(h.engine.tick_visual(t0 + ms(1_400)).is_empty());
    h.script.face_failure.store(false, Ordering::SeqCst);

    assert!(h.engine.tick_visual(t0 + ms(2_100)).is_empty());
    assert!(h.engine.tick_visual(t0 + ms(2_800)).is_empty());
    let alerts = h.engine.tick_visual(t0 + ms(3_500));
    assert_eq!(kinds(&alerts), vec![AlertKind::MultipleFaces]);
    assert_eq!(h.engine.poll_stats().unwrap().detector_failures, 1);
    h.engine.end().unwrap();
}

#[test]
fn suspicious_object_realerts_after_cooldown() {
    let h = harness();
    h.engine.start_manual().unwrap();
    *h.script.objects.lock().unwrap() = vec![ObjectPrediction {
        label: "cell phone".to_string(),
        confidence: 0.77,
    }];

    let alerts = run_visual(&h.engine, Instant::now(), 0, 8_400);
    assert_eq!(
        kinds(&alerts),
        vec![AlertKind::SuspiciousObject, AlertKind::SuspiciousObject]
    );
    assert_eq!(alerts[0].details, "Detected cell phone (0.77)");
    h.engine.end().unwrap();
}

#[test]
fn alternating_audio_energy_never_alerts_but_sustained_noise_does() {
    let h = harness();
    h.engine.start_manual().unwrap();
    let t0 = Instant::now();

    let mut alerts = Vec::new();
    for step in 0..20u64 {
        *h.script.energy.lock().unwrap() = if step % 2 == 0 { 0.3 } else { 0.01 };
        alerts.extend(h.engine.tick_audio(t0 + ms(step * 200)));
    }
    assert!(alerts.is_empty());

    *h.script.energy.lock().unwrap() = 0.3;
    for step in 20..23u64 {
        alerts.extend(h.engine.tick_audio(t0 + ms(step * 200)));
    }
    assert_eq!(kinds(&alerts), vec![AlertKind::AudioActivity]);
    assert_eq!(alerts[0].severity, Severity::Medium);
    h.engine.end().unwrap();
}

// ═════════════════════════════════════════════════════════════════════════════
// Live feed and delivery
// ═════════════════════════════════════════════════════════════════════════════

#[test]
fn feed_sees_session_bracketed_alerts() {
    let h = harness();
    let feed = h.engine.subscribe();
    h.engine.start_manual().unwrap();
    h.engine.raise_manual_test(Some("proctor check")).unwrap();
    h.engine.end().unwrap();

    let events = feed.drain();
    assert!(matches!(events.first(), Some(FeedEvent::SessionStarted { .. })));
    assert!(matches!(
        events.get(1),
        Some(FeedEvent::Alert(alert)) if alert.details == "proctor check"
    ));
    assert!(matches!(
        events.last(),
        Some(FeedEvent::SessionEnded { risk_score: 1, .. })
    ));
}

#[test]
fn outage_keeps_alerts_pending_until_flushed() {
    let script = Script::new();
    let media = FakeMedia::new(script.clone());
    let store = FlakyStore::new();
    let engine = ProctorEngine::new(test_config(), media, store.clone());
    let feed = engine.subscribe();

    let session_id = engine.start_manual().unwrap();
    store.down.store(true, Ordering::SeqCst);
    engine
        .notify_focus_at(FocusNotification::FocusLost, Instant::now())
        .expect("tab switch");
    let outcome = engine.end().unwrap();

    assert_eq!(outcome.risk_score, 1);
    assert_eq!(outcome.undelivered, 1);
    assert!(outcome.store_closed);
    assert_eq!(engine.delivery_status().pending, 1);
    let events = feed.drain();
    assert!(events.contains(&FeedEvent::DeliveryPending { backlog: 1 }));
    assert!(!events.iter().any(|event| matches!(event, FeedEvent::Alert(_))));

    store.down.store(false, Ordering::SeqCst);
    engine.flush_pending();

    let status = engine.delivery_status();
    assert_eq!(status.pending, 0);
    assert_eq!(status.delivered, 1);
    let report = store.inner.report(session_id.as_str()).unwrap();
    assert_eq!(report.alerts.len(), 1);
    assert_eq!(report.risk_score, 1);

    let events = feed.drain();
    assert!(matches!(events.first(), Some(FeedEvent::Alert(_))));
    assert!(events.contains(&FeedEvent::DeliveryRestored));
}

#[test]
fn unacknowledged_end_is_closed_by_flush() {
    let script = Script::new();
    let store = FlakyStore::new();
    let engine = ProctorEngine::new(test_config(), FakeMedia::new(script), store.clone());
    let feed = engine.subscribe();

    let first = engine.start_manual().unwrap();
    store.close_down.store(true, Ordering::SeqCst);
    let outcome = engine.end().unwrap();
    assert!(!outcome.store_closed);
    assert_eq!(engine.delivery_status().pending, 1);
    assert!(feed
        .drain()
        .contains(&FeedEvent::DeliveryPending { backlog: 1 }));

    store.close_down.store(false, Ordering::SeqCst);
    engine.flush_pending();
    assert_eq!(engine.delivery_status().pending, 0);
    let report = store.inner.report(first.as_str()).unwrap();
    assert!(report.ended_at.is_some());

    let second = engine.start_manual().unwrap();
    assert_ne!(first, second);
    engine.end().unwrap();
}

#[test]
fn unacknowledged_end_is_closed_before_next_start() {
    let script = Script::new();
    let store = FlakyStore::new();
    let engine = ProctorEngine::new(test_config(), FakeMedia::new(script), store.clone());

    let first = engine.start_manual().unwrap();
    engine.raise_manual_test(None).unwrap();
    store.close_down.store(true, Ordering::SeqCst);
    assert!(!engine.end().unwrap().store_closed);
    assert!(store.inner.report(first.as_str()).unwrap().ended_at.is_none());

    store.close_down.store(false, Ordering::SeqCst);
    let second = engine.start_manual().unwrap();
    let report = store.inner.report(first.as_str()).unwrap();
    assert!(report.ended_at.is_some());
    assert_eq!(report.risk_score, 1);
    assert_eq!(engine.delivery_status().pending, 0);

    assert_eq!(engine.active_session(), Some(second));
    engine.end().unwrap();
}

#[test]
fn slow_feed_subscriber_never_blocks_dispatch() {
    let mut config = test_config();
    config.feed.capacity = 2;
    let script = Script::new();
    let engine = ProctorEngine::new(
        config,
        FakeMedia::new(script),
        Arc::new(MemorySessionStore::new()),
    );
    let feed = engine.subscribe();

    engine.start_manual().unwrap();
    for _ in 0..5 {
        engine.raise_manual_test(None).unwrap();
    }
    engine.end().unwrap();

    let events = feed.drain();
    assert_eq!(events.len(), 2);
    assert!(feed.dropped_count() >= 5);
    assert!(matches!(events.last(), Some(FeedEvent::SessionEnded { .. })));
}

// ═════════════════════════════════════════════════════════════════════════════
// Timer-driven session
// ═════════════════════════════════════════════════════════════════════════════

#[test]
fn timers_drive_detection_until_end() {
    let script = Script::new();
    script.set_faces(0);
    let media = FakeMedia::new(script.clone());
    let store = Arc::new(MemorySessionStore::new());

    let mut config = test_config();
    config.visual.tick_interval_ms = 10;
    config.audio.sample_interval_ms = 10;
    config.face.no_face_confirm_ms = 40;
    let engine = ProctorEngine::new(config, media.clone(), store.clone());
    let feed = engine.subscribe();

    let session_id = engine.start().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut saw_alert = false;
    while Instant::now() < deadline {
        match feed.next_timeout(Duration::from_millis(100)) {
            Some(FeedEvent::Alert(alert)) => {
                assert_eq!(alert.kind, AlertKind::NoFace);
                saw_alert = true;
                break;
            }
            Some(_) | None => continue,
        }
    }
    assert!(saw_alert, "no alert delivered by timer-driven ticks");

    let outcome = engine.end().unwrap();
    assert!(outcome.risk_score >= 1);
    assert_eq!(media.released.load(Ordering::SeqCst), 1);

    let stored = store.report(session_id.as_str()).unwrap().alerts.len();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(store.report(session_id.as_str()).unwrap().alerts.len(), stored);
    assert_eq!(stored as u32, outcome.risk_score);
}

#[test]
fn frame_source_panic_does_not_stop_visual_timer() {
    let script = Script::new();
    script.frame_panic_on.store(2, Ordering::SeqCst);
    let media = FakeMedia::new(script.clone());

    let mut config = test_config();
    config.visual.tick_interval_ms = 10;
    let engine = ProctorEngine::new(config, media, Arc::new(MemorySessionStore::new()));
    engine.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while script.frame_calls.load(Ordering::SeqCst) < 6 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(script.frame_calls.load(Ordering::SeqCst) >= 6);
    assert_eq!(engine.state(), LifecycleState::Active);
    let stats = engine.poll_stats().expect("active session");
    assert!(stats.visual_ticks >= 6);
    assert_eq!(stats.detector_failures, 1);
    engine.end().unwrap();
}
