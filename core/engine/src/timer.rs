//! Repeating timer with explicit start and cancel.
//!
//! Each timer owns one named thread. The first tick fires immediately, later
//! ticks keep a fixed rate. `cancel` returns only after the thread has exited,
//! so no tick can start once it returns.

use crate::poller::panic_message;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

pub struct RepeatingTimer {
    name: String,
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl RepeatingTimer {
    pub fn start<F>(name: &str, period: Duration, mut tick: F) -> io::Result<Self>
    where
        F: FnMut(Instant) + Send + 'static,
    {
        let signal = Arc::new(StopSignal::default());
        let thread_signal = Arc::clone(&signal);
        let period = period.max(Duration::from_millis(1));
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(format!("proctor-{}", name))
            .spawn(move || {
                let mut deadline = Instant::now();
                loop {
                    {
                        let mut stopped = thread_signal
                            .stopped
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner);
                        loop {
                            if *stopped {
                                return;
                            }
                            let now = Instant::now();
                            if now >= deadline {
                                break;
                            }
                            stopped = thread_signal
                                .wake
                                .wait_timeout(stopped, deadline - now)
                                .unwrap_or_else(PoisonError::into_inner)
                                .0;
                        }
                    }

                    let now = Instant::now();
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| tick(now))) {
                        warn!(
                            timer = %thread_name,
                            error = %panic_message(payload.as_ref()),
                            "Timer tick panicked; continuing"
                        );
                    }

                    deadline = next_deadline(deadline + period, Instant::now(), period);
                }
            })?;

        debug!(timer = name, period_ms = period.as_millis() as u64, "Timer started");
        Ok(Self {
            name: name.to_string(),
            signal,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        {
            let mut stopped = self
                .signal
                .stopped
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *stopped = true;
        }
        self.signal.wake.notify_all();
        if handle.join().is_err() {
            warn!(timer = %self.name, "Timer thread panicked");
        }
        debug!(timer = %self.name, "Timer cancelled");
    }
}

/// Keeps `deadline` when it is still ahead. Otherwise skips the missed ticks
/// (slow detector, suspended machine) instead of bursting to catch up.
fn next_deadline(deadline: Instant, now: Instant, period: Duration) -> Instant {
    if deadline >= now {
        return deadline;
    }
    let behind = now.duration_since(deadline);
    let skipped = behind.as_nanos() / period.as_nanos().max(1) + 1;
    let skipped = u32::try_from(skipped).unwrap_or(u32::MAX);
    period
        .checked_mul(skipped)
        .and_then(|step| deadline.checked_add(step))
        .filter(|next| *next > now)
        .unwrap_or(now + period)
}

impl Drop for RepeatingTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
