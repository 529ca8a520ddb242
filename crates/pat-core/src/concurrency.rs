//! Timing, counting, repetition and fan-out combinators.
//!
//! `once`, `repeat` and `repeat_every_until` build a [`Tasks`] source: a
//! shared schedule of calls to one function. `execute` drains a source on
//! the calling thread; `execute_concurrently` starts several lanes that all
//! drain the same source, so `repeat(k, f)` on `w` lanes makes `k` calls in
//! total, about `k / w` per lane. The laboratory builds both of its
//! schedules this way, and anything else that needs "run this N times on W
//! threads" can do the same.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// Run `f` and report how long it took alongside its result.
pub fn time<T, E>(f: impl FnOnce() -> Result<T, E>) -> (Duration, Result<T, E>) {
    let start = Instant::now();
    let result = f();
    (start.elapsed(), result)
}

// ─── Task sources ────────────────────────────────────────────────────────────

/// A schedule of calls shared by every lane draining it.
pub trait Tasks {
    /// Wait for the next call to come due, make it and return `true`.
    /// Returns `false` once the schedule has run dry.
    fn run_next(&self) -> bool;

    /// One lane's share of the schedule: take calls until none are left.
    fn drain(&self) {
        while self.run_next() {}
    }
}

/// `n` calls to `f`, handed out one at a time to whichever lane asks first.
pub struct Repeat<F> {
    remaining: AtomicUsize,
    cancel: Option<CancellationToken>,
    f: F,
}

/// A source that calls `f` exactly once.
pub fn once<F: Fn()>(f: F) -> Repeat<F> {
    repeat(1, f)
}

/// A source that calls `f` exactly `n` times.
pub fn repeat<F: Fn()>(n: usize, f: F) -> Repeat<F> {
    Repeat {
        remaining: AtomicUsize::new(n),
        cancel: None,
        f,
    }
}

impl<F: Fn()> Repeat<F> {
    /// Stop handing out calls once `cancel` fires. A call already taken
    /// still runs.
    pub fn until_cancelled(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Take one call off the budget.
    fn claim(&self) -> bool {
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return false;
        }
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl<F: Fn()> Tasks for Repeat<F> {
    fn run_next(&self) -> bool {
        if !self.claim() {
            return false;
        }
        (self.f)();
        true
    }
}

/// Calls to `f` now and then once every `interval` until the next tick would
/// land past `stop`. Each tick is made by one lane.
pub struct Every<F> {
    interval: Duration,
    stop: Duration,
    cancel: Option<CancellationToken>,
    schedule: Mutex<Schedule>,
    f: F,
}

#[derive(Default)]
struct Schedule {
    start: Option<Instant>,
    next_tick: u32,
    done: bool,
}

/// A source that calls `f` now and then once every `interval` until the
/// next tick would land past `stop`.
///
/// Ticks are scheduled against the time of the first call rather than
/// chained sleeps, so a slow `f` does not push later ticks out. A zero
/// `interval` or `stop` means a single call. `cancel` is only looked at when
/// a tick comes due, an in-progress sleep is never cut short.
pub fn repeat_every_until<F: Fn()>(
    interval: Duration,
    stop: Duration,
    f: F,
    cancel: Option<CancellationToken>,
) -> Every<F> {
    Every {
        interval,
        stop,
        cancel,
        schedule: Mutex::new(Schedule::default()),
        f,
    }
}

impl<F: Fn()> Every<F> {
    /// Reserve the next tick and return when it is due.
    fn claim(&self) -> Option<Instant> {
        let mut schedule = self.schedule.lock().unwrap_or_else(PoisonError::into_inner);
        if schedule.done {
            return None;
        }
        let start = *schedule.start.get_or_insert_with(Instant::now);
        let tick = schedule.next_tick;
        if tick == 0 && (self.interval.is_zero() || self.stop.is_zero()) {
            schedule.done = true;
            return Some(start);
        }

        let offset = self.interval.saturating_mul(tick);
        if offset > self.stop {
            schedule.done = true;
            return None;
        }
        schedule.next_tick += 1;
        Some(start + offset)
    }

    fn cancelled(&self) -> bool {
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            self.schedule.lock().unwrap_or_else(PoisonError::into_inner).done = true;
            return true;
        }
        false
    }
}

impl<F: Fn()> Tasks for Every<F> {
    fn run_next(&self) -> bool {
        let Some(due) = self.claim() else {
            return false;
        };
        thread::sleep(due.saturating_duration_since(Instant::now()));
        if self.cancelled() {
            return false;
        }
        (self.f)();
        true
    }
}

/// A source whose lanes announce themselves: `+1` is sent on the counter
/// when a lane starts draining and `-1` when it stops.
pub struct Counted<T> {
    counter: UnboundedSender<i32>,
    tasks: T,
}

/// Count the lanes draining `tasks` on `counter`.
///
/// The decrement is sent from a drop guard, so it also goes out when a call
/// unwinds. Sends never block; the receiver only has to drain eventually.
pub fn counted<T: Tasks>(counter: UnboundedSender<i32>, tasks: T) -> Counted<T> {
    Counted { counter, tasks }
}

impl<T: Tasks> Tasks for Counted<T> {
    fn run_next(&self) -> bool {
        self.tasks.run_next()
    }

    fn drain(&self) {
        let _ = self.counter.send(1);
        let _done = Decrement(&self.counter);
        self.tasks.drain();
    }
}

struct Decrement<'a>(&'a UnboundedSender<i32>);

impl Drop for Decrement<'_> {
    fn drop(&mut self) {
        let _ = self.0.send(-1);
    }
}

// ─── Execution ───────────────────────────────────────────────────────────────

/// Drain `tasks` from `width` lanes on their own threads and wait for all of
/// them.
///
/// A width of one drains on the calling thread; zero runs nothing.
pub fn execute_concurrently<T: Tasks + Sync>(width: usize, tasks: T) {
    match width {
        0 => {}
        1 => tasks.drain(),
        _ => {
            let tasks = &tasks;
            thread::scope(|scope| {
                for lane in 0..width {
                    let spawned = thread::Builder::new()
                        .name(format!("pat-lane-{lane}"))
                        .spawn_scoped(scope, move || tasks.drain());
                    if let Err(e) = spawned {
                        tracing::error!(lane, "failed to start lane: {}", e);
                    }
                }
            });
        }
    }
}

/// Drain `tasks` on the calling thread.
pub fn execute<T: Tasks>(tasks: T) {
    tasks.drain()
}
