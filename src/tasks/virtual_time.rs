//! Virtual Time
//!
//! A scheduler and clock driven by hand, for deterministic expiry behaviour
//! without real sleeping.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::clock::Clock;
use crate::error::Result;
use crate::tasks::{ExpiryTask, Scheduler};

// == Virtual Timer ==
/// Scheduler and clock whose time only moves through [`VirtualTimer::advance`].
///
/// Callbacks run synchronously inside `advance`, in deadline order, with the
/// clock set to their deadline. Callbacks scheduled at the same deadline run
/// in scheduling order. Clones share the same timeline.
///
/// ```
/// use std::time::Duration;
/// use chrono::Utc;
/// use mem_cacher::tasks::{Scheduler, VirtualTimer};
///
/// let timer = VirtualTimer::new(Utc::now());
/// timer.schedule(Duration::from_millis(50), Box::new(|| println!("fired")))?;
/// assert_eq!(timer.pending(), 1);
///
/// timer.advance(Duration::from_millis(50));
/// assert_eq!(timer.pending(), 0);
/// # Ok::<(), mem_cacher::MemoizeError>(())
/// ```
#[derive(Clone)]
pub struct VirtualTimer {
    state: Arc<Mutex<TimerState>>,
}

struct TimerState {
    /// Wall-clock instant at virtual time zero
    origin: DateTime<Utc>,
    /// Milliseconds since `origin`
    elapsed_ms: u64,
    /// Tie-breaker for callbacks sharing a deadline
    next_seq: u64,
    /// Armed callbacks keyed by (deadline ms, sequence)
    pending: BTreeMap<(u64, u64), ExpiryTask>,
}

impl VirtualTimer {
    // == Constructor ==
    /// Creates a timer whose clock starts at `origin`.
    pub fn new(origin: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(TimerState {
                origin,
                elapsed_ms: 0,
                next_seq: 0,
                pending: BTreeMap::new(),
            })),
        }
    }

    /// Virtual time elapsed since the timer was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.lock().elapsed_ms)
    }

    /// Number of callbacks not yet run.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    // == Advance ==
    /// Moves time forward by `by`, running every callback that falls due.
    ///
    /// Callbacks may schedule further callbacks or advance the timer
    /// themselves; anything due before the target time still runs.
    pub fn advance(&self, by: Duration) {
        let target = {
            let state = self.lock();
            state.elapsed_ms.saturating_add(duration_ms(by))
        };

        loop {
            let due = {
                let mut state = self.lock();
                match state.pending.first_key_value() {
                    Some((&(deadline, seq), _)) if deadline <= target => {
                        state.elapsed_ms = state.elapsed_ms.max(deadline);
                        state.pending.remove(&(deadline, seq))
                    }
                    _ => {
                        state.elapsed_ms = state.elapsed_ms.max(target);
                        None
                    }
                }
            };

            match due {
                Some(task) => task(),
                None => break,
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler for VirtualTimer {
    fn schedule(&self, delay: Duration, task: ExpiryTask) -> Result<()> {
        let mut state = self.lock();
        let deadline = state.elapsed_ms.saturating_add(duration_ms(delay));
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.insert((deadline, seq), task);
        Ok(())
    }
}

impl Clock for VirtualTimer {
    fn now(&self) -> DateTime<Utc> {
        let state = self.lock();
        i64::try_from(state.elapsed_ms)
            .ok()
            .and_then(TimeDelta::try_milliseconds)
            .and_then(|offset| state.origin.checked_add_signed(offset))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl fmt::Debug for VirtualTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("VirtualTimer")
            .field("origin", &state.origin)
            .field("elapsed_ms", &state.elapsed_ms)
            .field("pending", &state.pending.len())
            .finish()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn origin() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 4, 12, 14, 59, 0).unwrap()
    }

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> ExpiryTask) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let make = move |label: &'static str| -> ExpiryTask {
            let sink = sink.clone();
            Box::new(move || sink.lock().unwrap().push(label))
        };
        (log, make)
    }

    #[test]
    fn test_clock_follows_elapsed_time() {
        let timer = VirtualTimer::new(origin());
        timer.advance(Duration::from_secs(60));

        assert_eq!(timer.elapsed(), Duration::from_secs(60));
        assert_eq!(timer.now(), Utc.with_ymd_and_hms(2022, 4, 12, 15, 0, 0).unwrap());
    }

    #[test]
    fn test_callbacks_fire_at_deadline() {
        let timer = VirtualTimer::new(origin());
        let (log, task) = recorder();

        timer.schedule(Duration::from_millis(1000), task("a")).unwrap();
        timer.advance(Duration::from_millis(999));
        assert!(log.lock().unwrap().is_empty());

        timer.advance(Duration::from_millis(1));
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn test_callbacks_run_in_deadline_then_schedule_order() {
        let timer = VirtualTimer::new(origin());
        let (log, task) = recorder();

        timer.schedule(Duration::from_millis(300), task("late")).unwrap();
        timer.schedule(Duration::from_millis(100), task("first")).unwrap();
        timer.schedule(Duration::from_millis(100), task("second")).unwrap();

        timer.advance(Duration::from_secs(1));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "late"]);
    }

    #[test]
    fn test_callback_sees_its_deadline_as_now() {
        let timer = VirtualTimer::new(origin());
        let seen = Arc::new(Mutex::new(None));

        let observer = timer.clone();
        let sink = seen.clone();
        timer
            .schedule(
                Duration::from_millis(250),
                Box::new(move || *sink.lock().unwrap() = Some(observer.elapsed())),
            )
            .unwrap();

        timer.advance(Duration::from_secs(5));
        assert_eq!(*seen.lock().unwrap(), Some(Duration::from_millis(250)));
        assert_eq!(timer.elapsed(), Duration::from_secs(5));
    }

    #[test]
    fn test_nested_advance_does_not_rewind() {
        let timer = VirtualTimer::new(origin());
        let inner = timer.clone();
        timer
            .schedule(
                Duration::from_millis(10),
                Box::new(move || inner.advance(Duration::from_secs(10))),
            )
            .unwrap();

        timer.advance(Duration::from_millis(20));
        assert_eq!(timer.elapsed(), Duration::from_millis(10_010));
    }
}
