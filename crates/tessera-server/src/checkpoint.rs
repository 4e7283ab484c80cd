//! Periodic checkpoint driver.
//!
//! A dedicated thread sleeps for the configured interval and then runs the
//! checkpoint task. There is no catch-up: a slow checkpoint delays the next
//! one. A panicking checkpoint is logged and the loop carries on.

use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tessera_common::constants::CHECKPOINT_THREAD_NAME;
use tracing::{debug, error, warn};

struct TimerShared {
    stopped: Mutex<bool>,
    wake: Condvar,
    runs: AtomicU64,
    panics: AtomicU64,
}

/// Runs a task on a fixed interval until stopped.
pub struct CheckpointTimer {
    shared: Arc<TimerShared>,
    interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CheckpointTimer {
    /// Starts the timer thread.
    pub fn start<F>(interval: Duration, task: F) -> io::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let shared = Arc::new(TimerShared {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
            runs: AtomicU64::new(0),
            panics: AtomicU64::new(0),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(CHECKPOINT_THREAD_NAME.to_string())
            .spawn(move || run(&worker, interval, task))?;

        Ok(Self {
            shared,
            interval,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Checkpoints completed so far, including ones that panicked.
    pub fn runs(&self) -> u64 {
        self.shared.runs.load(AtomicOrdering::Relaxed)
    }

    /// Checkpoints that panicked.
    pub fn panics(&self) -> u64 {
        self.shared.panics.load(AtomicOrdering::Relaxed)
    }

    /// Configured interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wakes the thread and waits for it to exit. Idempotent.
    pub fn stop(&self) {
        {
            let mut stopped = self.shared.stopped.lock();
            *stopped = true;
            self.shared.wake.notify_all();
        }

        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("checkpoint thread panicked");
            }
        }
    }
}

fn run<F: Fn()>(shared: &TimerShared, interval: Duration, task: F) {
    debug!(interval_ms = interval.as_millis() as u64, "checkpoint timer started");

    loop {
        {
            let deadline = Instant::now() + interval;
            let mut stopped = shared.stopped.lock();
            while !*stopped {
                if shared.wake.wait_until(&mut stopped, deadline).timed_out() {
                    break;
                }
            }
            if *stopped {
                break;
            }
        }

        if panic::catch_unwind(AssertUnwindSafe(&task)).is_err() {
            shared.panics.fetch_add(1, AtomicOrdering::Relaxed);
            error!("checkpoint panicked, continuing");
        }
        shared.runs.fetch_add(1, AtomicOrdering::Relaxed);
    }

    debug!("checkpoint timer stopped");
}

impl Drop for CheckpointTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for CheckpointTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointTimer")
            .field("interval", &self.interval)
            .field("runs", &self.runs())
            .finish()
    }
}
