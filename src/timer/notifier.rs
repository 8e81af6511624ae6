//! Timeout notifiers driven by a shared timing wheel
//!
//! A [`TimeoutTimer`] owns a [`SharedTimingWheel`] and hands out
//! [`TimeoutNotifier`]s, one per (subject, timeout kind). Each notifier is a
//! small state machine:
//!
//! ```text
//! Unscheduled --schedule--> Scheduled --fire--> TimedOut
//!      ^                      |   ^                 |
//!      +--------cancel--------+   +----schedule-----+
//!      +------------------reset-------------------- +
//! any state --close--> Closed (terminal)
//! ```
//!
//! `schedule`, `cancel` and `reset` never block: if another thread is
//! mutating the same notifier they return `false` ("not applied").
//! `close` blocks until it takes effect.
//!
//! A fire carries the handle of the wheel node it came from. If that handle no
//! longer matches the notifier's current schedule (the notifier was cancelled
//! or rescheduled while the tick was in progress) the fire is dropped.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use horizon_reactor::timer::{NotifierState, TimeoutTimer};
//!
//! let timer = TimeoutTimer::new(64);
//! let hits = Arc::new(AtomicUsize::new(0));
//! let notifier = timer.create_notifier("conn-1");
//! let counter = hits.clone();
//! notifier.listener(move |_subject: &&str| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! assert!(notifier.schedule(2));
//! timer.tick();
//! timer.tick();
//! assert_eq!(hits.load(Ordering::SeqCst), 1);
//! assert_eq!(notifier.state(), NotifierState::TimedOut);
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, trace};
use parking_lot::Mutex;

use super::shared::SharedTimingWheel;
use super::wheel::TimerHandle;
use crate::error::Error;

/// Observable state of a [`TimeoutNotifier`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifierState {
    Unscheduled,
    Scheduled,
    TimedOut,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Unscheduled,
    Scheduled(TimerHandle),
    TimedOut,
    Closed,
}

impl State {
    fn public(self) -> NotifierState {
        match self {
            State::Unscheduled => NotifierState::Unscheduled,
            State::Scheduled(_) => NotifierState::Scheduled,
            State::TimedOut => NotifierState::TimedOut,
            State::Closed => NotifierState::Closed,
        }
    }
}

type Listener<S> = Arc<dyn Fn(&S) + Send + Sync>;

struct TimerCore<S> {
    wheel: SharedTimingWheel<Weak<NotifierInner<S>>>,
    running: AtomicBool,
}

struct NotifierInner<S> {
    core: Arc<TimerCore<S>>,
    subject: S,
    state: Mutex<State>,
    listener: Mutex<Option<Listener<S>>>,
}

impl<S: Send + Sync + 'static> TimerCore<S> {
    fn tick(&self) -> usize {
        let mut delivered = 0;
        for (handle, weak) in self.wheel.tick() {
            if let Some(inner) = weak.upgrade() {
                if inner.fire(handle) {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

impl<S: Send + Sync + 'static> NotifierInner<S> {
    /// Delivers one fire; `false` when it was stale.
    fn fire(&self, handle: TimerHandle) -> bool {
        let listener = {
            let mut state = self.state.lock();
            match *state {
                State::Scheduled(current) if current == handle => {
                    *state = State::TimedOut;
                    self.listener.lock().clone()
                }
                _ => {
                    trace!("dropping stale timer fire for slot {}", handle.slot());
                    return false;
                }
            }
        };

        if let Some(listener) = listener {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(&self.subject))) {
                error!("timeout listener panicked: {}", Error::from_panic(payload));
            }
        }
        true
    }
}

/// Per-subject timeout with a four-state lifecycle
pub struct TimeoutNotifier<S: Send + Sync + 'static> {
    inner: Arc<NotifierInner<S>>,
}

impl<S: Send + Sync + 'static> Clone for TimeoutNotifier<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Send + Sync + 'static> TimeoutNotifier<S> {
    pub fn subject(&self) -> &S {
        &self.inner.subject
    }

    pub fn state(&self) -> NotifierState {
        self.inner.state.lock().public()
    }

    /// Installs the callback invoked with the subject when the timeout fires.
    pub fn listener<F>(&self, callback: F)
    where
        F: Fn(&S) + Send + Sync + 'static,
    {
        *self.inner.listener.lock() = Some(Arc::new(callback));
    }

    /// Arms the timeout to fire after `ticks` ticks.
    ///
    /// From `Scheduled` this restarts the countdown from the current hand.
    /// Returns `false` when closed or when another thread holds the notifier.
    pub fn schedule(&self, ticks: u64) -> bool {
        let Some(mut state) = self.inner.state.try_lock() else {
            return false;
        };
        let wheel = &self.inner.core.wheel;
        match *state {
            State::Closed => false,
            State::Scheduled(handle) => {
                let handle = match wheel.reschedule(handle, ticks) {
                    Some(handle) => handle,
                    // Popped by a tick that is about to find our handle stale
                    None => wheel.schedule(Arc::downgrade(&self.inner), ticks),
                };
                *state = State::Scheduled(handle);
                true
            }
            State::Unscheduled | State::TimedOut => {
                let handle = wheel.schedule(Arc::downgrade(&self.inner), ticks);
                *state = State::Scheduled(handle);
                true
            }
        }
    }

    /// Disarms a scheduled timeout.
    ///
    /// Returns `false` when nothing was scheduled or another thread holds the
    /// notifier.
    pub fn cancel(&self) -> bool {
        let Some(mut state) = self.inner.state.try_lock() else {
            return false;
        };
        match *state {
            State::Scheduled(handle) => {
                self.inner.core.wheel.cancel(handle);
                *state = State::Unscheduled;
                true
            }
            _ => false,
        }
    }

    /// Returns the notifier to `Unscheduled` from any state except `Closed`.
    pub fn reset(&self) -> bool {
        let Some(mut state) = self.inner.state.try_lock() else {
            return false;
        };
        match *state {
            State::Closed => false,
            State::Scheduled(handle) => {
                self.inner.core.wheel.cancel(handle);
                *state = State::Unscheduled;
                true
            }
            State::Unscheduled | State::TimedOut => {
                *state = State::Unscheduled;
                true
            }
        }
    }

    /// Moves the notifier to `Closed`; every later operation is a no-op.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if let State::Scheduled(handle) = *state {
            self.inner.core.wheel.cancel(handle);
        }
        *state = State::Closed;
        self.inner.listener.lock().take();
    }
}

impl<S: Send + Sync + std::fmt::Debug + 'static> std::fmt::Debug for TimeoutNotifier<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutNotifier")
            .field("subject", &self.inner.subject)
            .field("state", &self.state())
            .finish()
    }
}

/// Owner of a shared wheel and factory of notifiers
///
/// The wheel advances on [`TimeoutTimer::tick`], either called by the owner
/// or by the background thread started with [`TimeoutTimer::start_ticker`].
pub struct TimeoutTimer<S: Send + Sync + 'static> {
    core: Arc<TimerCore<S>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Send + Sync + 'static> TimeoutTimer<S> {
    /// Creates a timer whose wheel has at least `wheel_size` slots.
    pub fn new(wheel_size: usize) -> Self {
        Self {
            core: Arc::new(TimerCore {
                wheel: SharedTimingWheel::new(wheel_size),
                running: AtomicBool::new(false),
            }),
            ticker: Mutex::new(None),
        }
    }

    pub fn capacity(&self) -> usize {
        self.core.wheel.capacity()
    }

    /// Timers currently armed.
    pub fn scheduled(&self) -> usize {
        self.core.wheel.len()
    }

    pub fn create_notifier(&self, subject: S) -> TimeoutNotifier<S> {
        TimeoutNotifier {
            inner: Arc::new(NotifierInner {
                core: self.core.clone(),
                subject,
                state: Mutex::new(State::Unscheduled),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Advances the wheel one tick; returns the number of listeners invoked.
    pub fn tick(&self) -> usize {
        self.core.tick()
    }

    /// Starts a thread that ticks every `interval` until the timer is dropped
    /// or [`TimeoutTimer::stop_ticker`] is called. No-op if already running.
    pub fn start_ticker(&self, interval: Duration) -> std::io::Result<()> {
        let mut ticker = self.ticker.lock();
        if ticker.is_some() {
            return Ok(());
        }
        self.core.running.store(true, Ordering::Release);
        let core = self.core.clone();
        let handle = thread::Builder::new()
            .name("horizon-timer".into())
            .spawn(move || {
                debug!("timer ticker started, interval {interval:?}");
                let mut next = Instant::now() + interval;
                while core.running.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if now < next {
                        thread::park_timeout(next - now);
                        continue;
                    }
                    core.tick();
                    next += interval;
                }
                debug!("timer ticker stopped");
            })?;
        *ticker = Some(handle);
        Ok(())
    }

    /// Stops and joins the ticker thread, if any.
    pub fn stop_ticker(&self) {
        let handle = self.ticker.lock().take();
        if let Some(handle) = handle {
            self.core.running.store(false, Ordering::Release);
            handle.thread().unpark();
            if handle.join().is_err() {
                error!("timer ticker thread panicked");
            }
        }
    }
}

impl<S: Send + Sync + 'static> Drop for TimeoutTimer<S> {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(timer: &TimeoutTimer<u32>, subject: u32) -> (TimeoutNotifier<u32>, Arc<AtomicUsize>) {
        let notifier = timer.create_notifier(subject);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        notifier.listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (notifier, hits)
    }

    #[test]
    fn test_fires_once_on_nth_tick() {
        let timer = TimeoutTimer::new(16);
        let (notifier, hits) = counting(&timer, 1);
        assert!(notifier.schedule(3));
        assert_eq!(notifier.state(), NotifierState::Scheduled);
        timer.tick();
        timer.tick();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(timer.tick(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.state(), NotifierState::TimedOut);
        for _ in 0..32 {
            timer.tick();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_prevents_fire() {
        let timer = TimeoutTimer::new(16);
        let (notifier, hits) = counting(&timer, 1);
        assert!(notifier.schedule(2));
        timer.tick();
        assert!(notifier.cancel());
        assert_eq!(notifier.state(), NotifierState::Unscheduled);
        assert!(!notifier.cancel());
        for _ in 0..20 {
            timer.tick();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reschedule_restarts_countdown() {
        let timer = TimeoutTimer::new(16);
        let (notifier, hits) = counting(&timer, 1);
        notifier.schedule(3);
        timer.tick();
        timer.tick();
        assert!(notifier.schedule(3));
        timer.tick();
        timer.tick();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        timer.tick();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timed_out_can_be_rearmed_and_reset() {
        let timer = TimeoutTimer::new(8);
        let (notifier, hits) = counting(&timer, 1);
        notifier.schedule(1);
        timer.tick();
        assert_eq!(notifier.state(), NotifierState::TimedOut);
        assert!(notifier.reset());
        assert_eq!(notifier.state(), NotifierState::Unscheduled);
        assert!(notifier.schedule(1));
        timer.tick();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_close_is_terminal() {
        let timer = TimeoutTimer::new(8);
        let (notifier, hits) = counting(&timer, 1);
        notifier.schedule(1);
        notifier.close();
        assert_eq!(notifier.state(), NotifierState::Closed);
        assert!(!notifier.schedule(1));
        assert!(!notifier.cancel());
        assert!(!notifier.reset());
        timer.tick();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(timer.scheduled(), 0);
    }

    #[test]
    fn test_contended_operations_are_not_applied() {
        let timer = TimeoutTimer::new(8);
        let (notifier, _) = counting(&timer, 1);
        notifier.schedule(4);

        let guard = notifier.inner.state.lock();
        let contender = notifier.clone();
        let (scheduled, cancelled) = thread::spawn(move || (contender.schedule(1), contender.cancel()))
            .join()
            .unwrap();
        drop(guard);

        assert!(!scheduled);
        assert!(!cancelled);
        assert_eq!(notifier.state(), NotifierState::Scheduled);
    }

    #[test]
    fn test_stale_fire_is_dropped() {
        let timer = TimeoutTimer::new(8);
        let (notifier, hits) = counting(&timer, 1);
        notifier.schedule(1);
        let stale = match *notifier.inner.state.lock() {
            State::Scheduled(handle) => handle,
            other => panic!("unexpected {other:?}"),
        };
        // A reschedule replaces the node; a fire for the old one must not count
        notifier.schedule(5);
        assert!(!notifier.inner.fire(stale));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(notifier.state(), NotifierState::Scheduled);
    }

    #[test]
    fn test_concurrent_schedule_cancel_never_fires_after_cancel() {
        let timer = Arc::new(TimeoutTimer::new(16));
        let (notifier, hits) = counting(&timer, 7);

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let notifier = notifier.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        notifier.schedule(2);
                        notifier.cancel();
                    }
                })
            })
            .collect();
        let ticking = {
            let timer = timer.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    timer.tick();
                }
            })
        };
        for w in workers {
            w.join().unwrap();
        }
        ticking.join().unwrap();

        // Whatever fired during the race, a final cancel must silence the notifier
        while !notifier.cancel() && notifier.state() == NotifierState::Scheduled {}
        let before = hits.load(Ordering::SeqCst);
        for _ in 0..32 {
            timer.tick();
        }
        assert_eq!(hits.load(Ordering::SeqCst), before);
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        let timer = TimeoutTimer::new(8);
        let notifier = timer.create_notifier(1u32);
        notifier.listener(|_| panic!("listener failure"));
        notifier.schedule(1);
        assert_eq!(timer.tick(), 1);
        assert_eq!(notifier.state(), NotifierState::TimedOut);
    }

    #[test]
    fn test_background_ticker() {
        let timer = TimeoutTimer::new(8);
        let (notifier, hits) = counting(&timer, 1);
        notifier.schedule(2);
        timer.start_ticker(Duration::from_millis(5)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        timer.stop_ticker();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
