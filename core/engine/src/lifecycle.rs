//! Session lifecycle: owns the active session, its timers and its media.
//!
//! States are `None -> Active -> Ended`. Starting builds a fresh monitor
//! (channels, poller, dispatcher and delivery worker) so nothing carries over
//! between sessions except undelivered jobs. Ending is strict, while the
//! store's `end_session` stays idempotent.
//!
//! Shutdown order on `end()`:
//! 1. Stop the monitor; waits for any in-flight tick or focus callback.
//! 2. Cancel and join the timers.
//! 3. Release media.
//! 4. Drain the delivery worker; leftovers become the carry-over backlog.
//! 5. Close the session in the store and publish `SessionEnded`. If the store
//!    is unreachable the close joins the carry-over backlog and is retried by
//!    `flush_pending()` or before the next session starts.

use crate::channel::ChannelSet;
use crate::config::EngineConfig;
use crate::delivery::{
    flush_jobs, with_retry, DeliveryJob, DeliveryQueue, DeliveryStatus, SharedStatus,
};
use crate::dispatcher::{severity_for, AlertDispatcher, MANUAL_TEST_DETAILS};
use crate::error::{ProctorError, Result, StoreError};
use crate::evidence::EvidenceCapture;
use crate::feed::{FeedEvent, LiveFeed, Subscription};
use crate::poller::{DetectorPoller, PollStats};
use crate::sensors::{FocusNotification, MediaProvider, Sensors};
use crate::store::SessionStore;
use crate::timer::RepeatingTimer;
use crate::types::{LifecycleState, SessionId};
use chrono::{SecondsFormat, Utc};
use proctor_daemon_protocol::{Alert, AlertKind};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Final record of a session, returned by `end()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionOutcome {
    pub session_id: String,
    pub started_at: String,
    pub ended_at: String,
    /// Number of alerts confirmed during the session.
    pub risk_score: u32,
    /// Jobs still waiting for the store when the session ended.
    pub undelivered: usize,
    /// Whether the store acknowledged the end of the session.
    pub store_closed: bool,
}

/// Per-session monitor shared by the timers and focus listeners.
struct Monitor {
    session_id: SessionId,
    running: RwLock<bool>,
    poller: DetectorPoller,
    dispatcher: AlertDispatcher,
}

impl Monitor {
    fn visual_tick(&self, now: Instant) -> Vec<Alert> {
        let running = self.running.read().unwrap_or_else(PoisonError::into_inner);
        if !*running {
            return Vec::new();
        }
        self.poller
            .visual_tick(now)
            .into_iter()
            .map(|transition| self.dispatcher.dispatch_transition(&self.session_id, transition))
            .collect()
    }

    fn audio_tick(&self, now: Instant) -> Option<Alert> {
        let running = self.running.read().unwrap_or_else(PoisonError::into_inner);
        if !*running {
            return None;
        }
        let transition = self.poller.audio_tick(now)?;
        Some(self.dispatcher.dispatch_transition(&self.session_id, transition))
    }

    fn focus(&self, notification: FocusNotification, now: Instant) -> Option<Alert> {
        let running = self.running.read().unwrap_or_else(PoisonError::into_inner);
        if !*running {
            return None;
        }
        let transition = self.poller.focus(notification, now)?;
        Some(self.dispatcher.dispatch_transition(&self.session_id, transition))
    }

    fn audio_chunk(&self) {
        let running = self.running.read().unwrap_or_else(PoisonError::into_inner);
        if !*running {
            return;
        }
        if let Some(bytes) = self.poller.take_audio_chunk() {
            debug!(session_id = %self.session_id, bytes = bytes.len(), "Audio chunk recorded");
            self.dispatcher.submit_audio_chunk(&self.session_id, bytes);
        }
    }

    fn manual_test(&self, details: String, capture: bool) -> Option<Alert> {
        let running = self.running.read().unwrap_or_else(PoisonError::into_inner);
        if !*running {
            return None;
        }
        Some(self.dispatcher.dispatch(
            &self.session_id,
            AlertKind::ManualTest,
            severity_for(AlertKind::ManualTest),
            details,
            capture,
        ))
    }

    /// Blocks until in-flight callbacks finish; none run afterwards.
    fn stop(&self) {
        let mut running = self.running.write().unwrap_or_else(PoisonError::into_inner);
        *running = false;
    }
}

/// Handle given to the host's focus/visibility notifications.
///
/// Holds the monitor weakly, so a listener that outlives its session turns
/// into a no-op.
#[derive(Clone)]
pub struct FocusListener {
    monitor: Weak<Monitor>,
}

impl FocusListener {
    pub fn notify(&self, notification: FocusNotification) -> Option<Alert> {
        self.notify_at(notification, Instant::now())
    }

    pub fn notify_at(&self, notification: FocusNotification, now: Instant) -> Option<Alert> {
        let monitor = self.monitor.upgrade()?;
        monitor.focus(notification, now)
    }
}

struct ActiveSession {
    monitor: Arc<Monitor>,
    timers: Vec<RepeatingTimer>,
    queue: DeliveryQueue,
    started_at: String,
}

enum Lifecycle {
    None,
    Active(ActiveSession),
    Ended(SessionOutcome),
}

pub struct ProctorEngine {
    config: EngineConfig,
    client_id: String,
    media: Arc<dyn MediaProvider>,
    store: Arc<dyn SessionStore>,
    feed: LiveFeed,
    delivery_status: SharedStatus,
    carryover: Mutex<VecDeque<DeliveryJob>>,
    state: Mutex<Lifecycle>,
}

impl ProctorEngine {
    pub fn new(
        config: EngineConfig,
        media: Arc<dyn MediaProvider>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let client_id = config
            .client_id
            .clone()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| ulid::Ulid::new().to_string());
        let feed = LiveFeed::new(config.feed.capacity);
        Self {
            config,
            client_id,
            media,
            store,
            feed,
            delivery_status: SharedStatus::default(),
            carryover: Mutex::new(VecDeque::new()),
            state: Mutex::new(Lifecycle::None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts a session driven by the engine's own timers.
    pub fn start(&self) -> Result<SessionId> {
        self.start_with(true)
    }

    /// Starts a session without timers. The caller drives `tick_visual`,
    /// `tick_audio` and `tick_audio_chunk`, e.g. for replays and tests.
    pub fn start_manual(&self) -> Result<SessionId> {
        self.start_with(false)
    }

    fn start_with(&self, spawn_timers: bool) -> Result<SessionId> {
        let mut state = self.lock_state();
        if let Lifecycle::Active(active) = &*state {
            return Err(ProctorError::SessionStateViolation(format!(
                "session {} is already active",
                active.monitor.session_id
            )));
        }

        let sensors = self.media.acquire().map_err(|details| {
            warn!(error = %details, "Media acquisition failed; session not started");
            ProctorError::DetectorUnavailable(details)
        })?;

        let active = match self.open_session(sensors, spawn_timers) {
            Ok(active) => active,
            Err(err) => {
                self.media.release();
                return Err(err);
            }
        };

        let session_id = active.monitor.session_id.clone();
        info!(
            session_id = %session_id,
            client_id = %self.client_id,
            timers = active.timers.len(),
            "Session started"
        );
        self.feed.publish(FeedEvent::SessionStarted {
            session_id: session_id.to_string(),
            started_at: active.started_at.clone(),
        });
        *state = Lifecycle::Active(active);
        Ok(session_id)
    }

    fn open_session(&self, sensors: Sensors, spawn_timers: bool) -> Result<ActiveSession> {
        // A previous session the store never saw closed blocks this client.
        if self.has_pending_close() {
            self.flush_carryover();
        }
        let started = with_retry(&self.config.delivery, "session start", || {
            self.store.start_session(&self.client_id)
        })?;
        let session_id = SessionId::new(started.session_id).ok_or_else(|| {
            ProctorError::Store(StoreError::Malformed(
                "session store returned an empty session id".to_string(),
            ))
        })?;

        let carryover = std::mem::take(&mut *self.lock_carryover());
        let queue = DeliveryQueue::spawn(
            Arc::clone(&self.store),
            self.feed.clone(),
            self.config.delivery.clone(),
            carryover,
            Arc::clone(&self.delivery_status),
        )?;

        let channels = Arc::new(ChannelSet::new(&self.config));
        let dispatcher = AlertDispatcher::new(
            EvidenceCapture::new(Arc::clone(&sensors.frames)),
            self.config.evidence.clone(),
            queue.sender(),
        );
        let has_recorder = sensors.recorder.is_some();
        let poller = DetectorPoller::new(
            sensors,
            channels,
            self.config.object.enabled,
            self.config.audio.enabled,
        );
        let monitor = Arc::new(Monitor {
            session_id: session_id.clone(),
            running: RwLock::new(true),
            poller,
            dispatcher,
        });

        let timers = if spawn_timers {
            match self.spawn_timers(&monitor, has_recorder) {
                Ok(timers) => timers,
                Err(err) => {
                    monitor.stop();
                    let leftover = queue.shutdown();
                    self.lock_carryover().extend(leftover);
                    if let Err(end_err) = self.store.end_session(session_id.as_str()) {
                        warn!(session_id = %session_id, error = %end_err, "Failed to close aborted session");
                        if end_err.is_retryable() {
                            self.defer_close(&session_id);
                        }
                    }
                    return Err(err);
                }
            }
        } else {
            Vec::new()
        };

        Ok(ActiveSession {
            monitor,
            timers,
            queue,
            started_at: started.started_at,
        })
    }

    fn spawn_timers(&self, monitor: &Arc<Monitor>, has_recorder: bool) -> Result<Vec<RepeatingTimer>> {
        let io_error = |context: &str| {
            let context = context.to_string();
            move |source: std::io::Error| ProctorError::Io { context, source }
        };
        let mut timers = Vec::new();

        let visual = Arc::clone(monitor);
        timers.push(
            RepeatingTimer::start("visual", self.config.visual.tick_interval(), move |now| {
                visual.visual_tick(now);
            })
            .map_err(io_error("starting visual timer"))?,
        );

        if monitor.poller.has_audio() {
            let audio = Arc::clone(monitor);
            timers.push(
                RepeatingTimer::start("audio", self.config.audio.sample_interval(), move |now| {
                    audio.audio_tick(now);
                })
                .map_err(io_error("starting audio timer"))?,
            );
        }

        if has_recorder && self.config.audio.chunk_interval_ms > 0 {
            let chunks = Arc::clone(monitor);
            timers.push(
                RepeatingTimer::start(
                    "audio-chunk",
                    std::time::Duration::from_millis(self.config.audio.chunk_interval_ms),
                    move |_| chunks.audio_chunk(),
                )
                .map_err(io_error("starting audio chunk timer"))?,
            );
        }

        Ok(timers)
    }

    /// Ends the active session. Fails with `SessionStateViolation` when no
    /// session is active, including a second call after a successful end.
    pub fn end(&self) -> Result<SessionOutcome> {
        let mut state = self.lock_state();
        let active = match std::mem::replace(&mut *state, Lifecycle::None) {
            Lifecycle::Active(active) => active,
            other => {
                let message = match &other {
                    Lifecycle::Ended(outcome) => {
                        format!("session {} has already ended", outcome.session_id)
                    }
                    _ => "no session is active".to_string(),
                };
                *state = other;
                warn!(error = %message, "Rejected end() outside an active session");
                return Err(ProctorError::SessionStateViolation(message));
            }
        };

        let ActiveSession {
            monitor,
            timers,
            queue,
            started_at,
        } = active;
        let session_id = monitor.session_id.clone();

        monitor.stop();
        for timer in timers {
            timer.cancel();
        }
        self.media.release();

        let leftover = queue.shutdown();
        let undelivered = leftover.len();
        self.lock_carryover().extend(leftover);

        let risk_score = monitor.dispatcher.confirmed_count();
        let (ended_at, store_closed) = match with_retry(&self.config.delivery, "session end", || {
            self.store.end_session(session_id.as_str())
        }) {
            Ok(closed) => (closed.ended_at, true),
            Err(err) => {
                let deferred = matches!(err, ProctorError::DispatchDeliveryFailure { .. });
                warn!(
                    session_id = %session_id,
                    error = %err,
                    deferred,
                    "Session store did not acknowledge end"
                );
                if deferred {
                    self.defer_close(&session_id);
                }
                (Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true), false)
            }
        };

        let outcome = SessionOutcome {
            session_id: session_id.to_string(),
            started_at,
            ended_at,
            risk_score,
            undelivered,
            store_closed,
        };
        info!(
            session_id = %session_id,
            risk_score,
            undelivered,
            store_closed,
            "Session ended"
        );
        self.feed.publish(FeedEvent::SessionEnded {
            session_id: session_id.to_string(),
            risk_score,
        });
        *state = Lifecycle::Ended(outcome.clone());
        Ok(outcome)
    }

    pub fn state(&self) -> LifecycleState {
        match &*self.lock_state() {
            Lifecycle::None => LifecycleState::None,
            Lifecycle::Active(_) => LifecycleState::Active,
            Lifecycle::Ended(_) => LifecycleState::Ended,
        }
    }

    pub fn active_session(&self) -> Option<SessionId> {
        match &*self.lock_state() {
            Lifecycle::Active(active) => Some(active.monitor.session_id.clone()),
            _ => None,
        }
    }

    pub fn last_outcome(&self) -> Option<SessionOutcome> {
        match &*self.lock_state() {
            Lifecycle::Ended(outcome) => Some(outcome.clone()),
            _ => None,
        }
    }

    pub fn tick_visual(&self, now: Instant) -> Vec<Alert> {
        match self.active_monitor() {
            Some(monitor) => monitor.visual_tick(now),
            None => Vec::new(),
        }
    }

    pub fn tick_audio(&self, now: Instant) -> Option<Alert> {
        self.active_monitor()?.audio_tick(now)
    }

    pub fn tick_audio_chunk(&self) {
        if let Some(monitor) = self.active_monitor() {
            monitor.audio_chunk();
        }
    }

    /// Feeds a focus/visibility notification. Ignored when no session is active.
    pub fn notify_focus(&self, notification: FocusNotification) -> Option<Alert> {
        self.notify_focus_at(notification, Instant::now())
    }

    pub fn notify_focus_at(&self, notification: FocusNotification, now: Instant) -> Option<Alert> {
        match self.active_monitor() {
            Some(monitor) => monitor.focus(notification, now),
            None => {
                debug!(reason = notification.reason(), "Focus notification outside a session");
                None
            }
        }
    }

    /// Listener bound to the current session, for host notification threads.
    pub fn focus_listener(&self) -> Option<FocusListener> {
        self.active_monitor().map(|monitor| FocusListener {
            monitor: Arc::downgrade(&monitor),
        })
    }

    pub fn raise_manual_test(&self, details: Option<&str>) -> Result<Alert> {
        let monitor = self.active_monitor().ok_or_else(|| {
            ProctorError::SessionStateViolation("no session is active".to_string())
        })?;
        let details = details
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(MANUAL_TEST_DETAILS)
            .to_string();
        let capture = self.config.evidence.captures(AlertKind::ManualTest);
        monitor.manual_test(details, capture).ok_or_else(|| {
            ProctorError::SessionStateViolation("session is ending".to_string())
        })
    }

    pub fn subscribe(&self) -> Subscription {
        self.feed.subscribe()
    }

    pub fn delivery_status(&self) -> DeliveryStatus {
        *self
            .delivery_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn poll_stats(&self) -> Option<PollStats> {
        self.active_monitor().map(|monitor| monitor.poller.stats())
    }

    /// Retries the delivery backlog now. During a session the worker does
    /// it; otherwise the carried-over backlog is retried on this thread.
    pub fn flush_pending(&self) {
        let state = self.lock_state();
        if let Lifecycle::Active(active) = &*state {
            active.queue.flush();
            return;
        }

        self.flush_carryover();
        drop(state);
    }

    fn flush_carryover(&self) {
        let jobs = std::mem::take(&mut *self.lock_carryover());
        if jobs.is_empty() {
            return;
        }
        let remaining = flush_jobs(
            Arc::clone(&self.store),
            self.feed.clone(),
            self.config.delivery.clone(),
            jobs,
            Arc::clone(&self.delivery_status),
        );
        self.lock_carryover().extend(remaining);
    }

    /// Queues a store-side close behind any undelivered jobs of the session.
    fn defer_close(&self, session_id: &SessionId) {
        let backlog = {
            let mut carryover = self.lock_carryover();
            carryover.push_back(DeliveryJob::EndSession {
                session_id: session_id.to_string(),
            });
            carryover.len()
        };
        self.delivery_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending = backlog;
        self.feed.publish(FeedEvent::DeliveryPending { backlog });
    }

    fn has_pending_close(&self) -> bool {
        self.lock_carryover()
            .iter()
            .any(|job| matches!(job, DeliveryJob::EndSession { .. }))
    }

    fn active_monitor(&self) -> Option<Arc<Monitor>> {
        match &*self.lock_state() {
            Lifecycle::Active(active) => Some(Arc::clone(&active.monitor)),
            _ => None,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, Lifecycle> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_carryover(&self) -> MutexGuard<'_, VecDeque<DeliveryJob>> {
        self.carryover.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ProctorEngine {
    fn drop(&mut self) {
        if matches!(&*self.lock_state(), Lifecycle::Active(_)) {
            warn!("Engine dropped with an active session; ending it");
            if let Err(err) = self.end() {
                warn!(error = %err, "Failed to end session on drop");
            }
        }
    }
}
