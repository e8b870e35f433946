//! Drives one session through the engine on simulated time.
//!
//! Visual ticks, audio samples, focus notifications and manual tests are
//! merged into a single schedule and fed to a manually ticked engine. Alerts
//! are written as JSON lines as the live feed reports them, followed by the
//! session outcome.

use proctor_engine::{
    EngineConfig, FeedEvent, ProctorEngine, SessionOutcome, SessionStore, Subscription,
};
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::timeline::{ReplayMedia, ScriptedSensors, Timeline};
use crate::CliError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Step {
    Focus(usize),
    ManualTest(usize),
    Visual,
    Audio,
}

#[derive(Debug, Serialize)]
struct OutcomeLine<'a> {
    outcome: &'a SessionOutcome,
    delivered: u64,
    pending: usize,
    rejected: u64,
}

fn schedule(timeline: &Timeline, config: &EngineConfig) -> Vec<(u64, Step)> {
    let mut steps = Vec::new();
    let visual_ms = config.visual.tick_interval_ms.max(1);
    let mut at = 0;
    while at <= timeline.duration_ms {
        steps.push((at, Step::Visual));
        at += visual_ms;
    }
    if timeline.has_audio() {
        let audio_ms = config.audio.sample_interval_ms.max(1);
        let mut at = 0;
        while at <= timeline.duration_ms {
            steps.push((at, Step::Audio));
            at += audio_ms;
        }
    }
    for (index, event) in timeline.focus.iter().enumerate() {
        if event.at_ms <= timeline.duration_ms {
            steps.push((event.at_ms, Step::Focus(index)));
        }
    }
    for (index, test) in timeline.manual_tests.iter().enumerate() {
        if test.at_ms <= timeline.duration_ms {
            steps.push((test.at_ms, Step::ManualTest(index)));
        }
    }
    steps.sort();
    steps
}

pub fn run(
    timeline: &Timeline,
    config: EngineConfig,
    store: Arc<dyn SessionStore>,
    out: &mut impl Write,
) -> Result<SessionOutcome, CliError> {
    let steps = schedule(timeline, &config);
    let sensors = Arc::new(ScriptedSensors::new());
    let media = Arc::new(ReplayMedia::new(Arc::clone(&sensors), timeline.has_audio()));
    let engine = ProctorEngine::new(config, media, store);
    let feed = engine.subscribe();

    let session_id = engine.start_manual()?;
    info!(
        session_id = %session_id,
        steps = steps.len(),
        duration_ms = timeline.duration_ms,
        "Replaying timeline"
    );

    let t0 = Instant::now();
    for (at_ms, step) in steps {
        let now = t0 + Duration::from_millis(at_ms);
        match step {
            Step::Visual => {
                sensors.set_frame(timeline.frame_at(at_ms));
                engine.tick_visual(now);
            }
            Step::Audio => {
                sensors.set_audio(timeline.audio_at(at_ms));
                engine.tick_audio(now);
            }
            Step::Focus(index) => {
                engine.notify_focus_at(timeline.focus[index].event.into(), now);
            }
            Step::ManualTest(index) => {
                engine.raise_manual_test(timeline.manual_tests[index].details.as_deref())?;
            }
        }
        write_feed(&feed, out)?;
    }

    let outcome = engine.end()?;
    write_feed(&feed, out)?;

    let status = engine.delivery_status();
    let line = OutcomeLine {
        outcome: &outcome,
        delivered: status.delivered,
        pending: status.pending,
        rejected: status.rejected,
    };
    writeln!(out, "{}", serde_json::to_string(&line)?)?;
    Ok(outcome)
}

fn write_feed(feed: &Subscription, out: &mut impl Write) -> Result<(), CliError> {
    for event in feed.drain() {
        match event {
            FeedEvent::Alert(alert) => writeln!(out, "{}", serde_json::to_string(&alert)?)?,
            FeedEvent::DeliveryPending { backlog } => {
                warn!(backlog, "Session store unreachable; alerts held locally");
            }
            FeedEvent::DeliveryRejected { code, message } => {
                warn!(code = %code, message = %message, "Session store rejected a submission");
            }
            _ => {}
        }
    }
    Ok(())
}
