//! Expiry Scheduling
//!
//! Delayed callbacks that remove memoized entries once their time is up.
//! Each stored entry arms exactly one callback; nothing polls the cache.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant as StdInstant};

use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{MemoizeError, Result};

/// Name of the thread that runs [`ThreadScheduler`] callbacks.
pub const EXPIRY_THREAD_NAME: &str = "mem-cacher-expiry";

/// Callback run when an entry's delay has elapsed.
pub type ExpiryTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs a callback once, after a delay. Armed callbacks cannot be cancelled.
///
/// An `Err` means the callback was not armed and will never run.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: ExpiryTask) -> Result<()>;
}

// == Tokio Scheduler ==
/// Spawns each callback as a task on a tokio runtime.
///
/// The deadline is fixed when `schedule` is called, not when the spawned
/// task is first polled.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Returns a scheduler for the runtime the caller is running on, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: ExpiryTask) -> Result<()> {
        let _guard = self.handle.enter();
        // A deadline past the end of the clock is never reached.
        let Some(deadline) = Instant::now().checked_add(delay) else {
            trace!(delay_ms = delay.as_millis() as u64, "expiry delay out of range, not scheduled");
            return Ok(());
        };

        self.handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            task();
        });
        Ok(())
    }
}

// == Thread Scheduler ==
/// Runs callbacks on one process-wide timer thread.
///
/// Used when a memoized function is called outside any tokio runtime. The
/// thread is started on first use and keeps every armed callback in a
/// deadline-ordered heap, so the number of threads does not grow with the
/// number of cached entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: ExpiryTask) -> Result<()> {
        let Some(deadline) = StdInstant::now().checked_add(delay) else {
            trace!(delay_ms = delay.as_millis() as u64, "expiry delay out of range, not scheduled");
            return Ok(());
        };

        let sender = timer_thread().ok_or_else(|| {
            MemoizeError::SchedulerUnavailable("expiry thread could not be started".to_string())
        })?;
        let timer = Timer {
            deadline,
            seq: NEXT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            task,
        };
        sender.send(timer).map_err(|_| {
            MemoizeError::SchedulerUnavailable("expiry thread has stopped".to_string())
        })
    }
}

static TIMER_THREAD: OnceLock<Option<Sender<Timer>>> = OnceLock::new();
static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Returns the channel into the timer thread, starting it on first use.
fn timer_thread() -> Option<&'static Sender<Timer>> {
    TIMER_THREAD
        .get_or_init(|| {
            let (sender, receiver) = mpsc::channel();
            match thread::Builder::new()
                .name(EXPIRY_THREAD_NAME.to_string())
                .spawn(move || run_timers(receiver))
            {
                Ok(_) => {
                    debug!("expiry thread started");
                    Some(sender)
                }
                Err(err) => {
                    warn!(error = %err, "failed to start expiry thread");
                    None
                }
            }
        })
        .as_ref()
}

/// Armed callback, ordered so the earliest deadline sits on top of a
/// max-heap. Equal deadlines run in scheduling order.
struct Timer {
    deadline: StdInstant,
    seq: u64,
    task: ExpiryTask,
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        (self.deadline, self.seq) == (other.deadline, other.seq)
    }
}

impl Eq for Timer {}

// == Timer Loop ==
fn run_timers(receiver: Receiver<Timer>) {
    let mut heap: BinaryHeap<Timer> = BinaryHeap::new();
    let mut connected = true;

    loop {
        let Some(next) = heap.peek().map(|timer| timer.deadline) else {
            if !connected {
                return;
            }
            match receiver.recv() {
                Ok(timer) => heap.push(timer),
                Err(_) => return,
            }
            continue;
        };

        let now = StdInstant::now();
        if next <= now {
            if let Some(timer) = heap.pop() {
                (timer.task)();
            }
            continue;
        }

        if !connected {
            thread::sleep(next - now);
            continue;
        }
        match receiver.recv_timeout(next - now) {
            Ok(timer) => heap.push(timer),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => connected = false,
        }
    }
}

// == Default Scheduler ==
/// Uses the caller's tokio runtime when there is one, otherwise the timer
/// thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultScheduler;

impl Scheduler for DefaultScheduler {
    fn schedule(&self, delay: Duration, task: ExpiryTask) -> Result<()> {
        match TokioScheduler::current() {
            Some(scheduler) => scheduler.schedule(delay, task),
            None => ThreadScheduler.schedule(delay, task),
        }
    }
}
