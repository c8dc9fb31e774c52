//! The high-resolution timer service this crate consumes (spec.md §6)
//! plus a deterministic, manually-advanced implementation for tests.
//!
//! Real kernels provide this already (a monotonic clock plus
//! absolute-mode timers); per spec.md §1 it's an external collaborator,
//! not something this crate owns. [`SimTimerService`] exists purely so
//! the scenarios in spec.md §8 can be driven from `cargo test` without
//! wall-clock sleeps.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use spin::Mutex;

use crate::ktime::Ktime;

/// Outcome of a cancel attempt (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    WasInactive,
    /// The callback is concurrently executing; the caller must treat
    /// this as tolerated (spec.md §7) and rely on the callback's own
    /// re-validation under the run-queue lock.
    RacingCallback,
}

/// What a fired timer callback decides (`HRTIMER_RESTART` /
/// `HRTIMER_NORESTART` in the original source).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restart {
    Restart,
    NoRestart,
}

/// One absolute-mode high-resolution timer (spec.md §6 consumed contract).
pub trait HrTimer: Send + Sync {
    fn start(&self, abs_expiry: Ktime);
    fn try_cancel(&self) -> CancelOutcome;
    fn active(&self) -> bool;
    fn get_expires(&self) -> Ktime;
    fn add_expires(&self, delta: Ktime);
}

/// Monotonic clock + timer factory this crate consumes.
pub trait TimerService: Send + Sync {
    fn now(&self) -> Ktime;
    fn create_timer(&self, callback: Box<dyn TimerCallback>) -> Arc<dyn HrTimer>;
}

/// A callback invoked when a [`SimTimer`] fires. Implementors hold a
/// non-owning (`Weak`) back-reference to whatever they act on — per
/// spec.md §9, the callback must not be able to outlive the task it
/// references.
pub trait TimerCallback: Send + Sync {
    fn on_expire(&self, now: Ktime) -> Restart;
}

/// A single simulated timer. Cheap to clone (`Arc`), satisfies [`HrTimer`].
pub struct SimTimer {
    expires: AtomicI64,
    active: AtomicBool,
    firing: AtomicBool,
    callback: Box<dyn TimerCallback>,
}

impl SimTimer {
    fn new(callback: Box<dyn TimerCallback>) -> Self {
        SimTimer {
            expires: AtomicI64::new(0),
            active: AtomicBool::new(false),
            firing: AtomicBool::new(false),
            callback,
        }
    }
}

impl HrTimer for SimTimer {
    fn start(&self, abs_expiry: Ktime) {
        self.expires.store(abs_expiry.as_nanos(), Ordering::Release);
        self.active.store(true, Ordering::Release);
    }

    fn try_cancel(&self) -> CancelOutcome {
        if self.firing.load(Ordering::Acquire) {
            return CancelOutcome::RacingCallback;
        }
        if self.active.swap(false, Ordering::AcqRel) {
            CancelOutcome::Cancelled
        } else {
            CancelOutcome::WasInactive
        }
    }

    fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn get_expires(&self) -> Ktime {
        Ktime::from_nanos(self.expires.load(Ordering::Acquire))
    }

    fn add_expires(&self, delta: Ktime) {
        self.expires.fetch_add(delta.as_nanos(), Ordering::AcqRel);
    }
}

/// Deterministic timer service: the virtual clock only moves when the
/// test calls [`SimTimerService::advance_to`]/`advance_by`.
pub struct SimTimerService {
    clock: AtomicI64,
    timers: Mutex<Vec<Arc<SimTimer>>>,
}

impl SimTimerService {
    pub fn new() -> Self {
        SimTimerService { clock: AtomicI64::new(0), timers: Mutex::new(Vec::new()) }
    }

    pub fn create_sim_timer(&self, callback: Box<dyn TimerCallback>) -> Arc<SimTimer> {
        let timer = Arc::new(SimTimer::new(callback));
        self.timers.lock().push(timer.clone());
        timer
    }

    pub fn advance_by(&self, delta: Ktime) {
        self.advance_to(self.now() + delta);
    }

    /// Fire every due timer, in expiry order, advancing the visible
    /// clock to each timer's own expiry before calling it (so `now()`
    /// observed inside a callback matches that timer's fire time).
    pub fn advance_to(&self, target: Ktime) {
        loop {
            let next_due = {
                let timers = self.timers.lock();
                timers
                    .iter()
                    .filter(|t| t.active() && t.get_expires() <= target)
                    .map(|t| t.clone())
                    .min_by_key(|t| t.get_expires())
            };

            let Some(timer) = next_due else { break };
            self.clock.store(timer.get_expires().as_nanos(), Ordering::Release);

            timer.firing.store(true, Ordering::Release);
            // A callback that doesn't want to fire again must have
            // already set `active = false` (e.g. via `try_cancel` on
            // itself) or we do it for it below on `NoRestart`.
            let restart = timer.callback.on_expire(timer.get_expires());
            timer.firing.store(false, Ordering::Release);

            match restart {
                Restart::Restart => {
                    // Callback is expected to have already forwarded
                    // `expires` into the future via `add_expires`.
                }
                Restart::NoRestart => {
                    timer.active.store(false, Ordering::Release);
                }
            }
        }
        self.clock.store(target.as_nanos(), Ordering::Release);
    }
}

impl Default for SimTimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerService for SimTimerService {
    fn now(&self) -> Ktime {
        Ktime::from_nanos(self.clock.load(Ordering::Acquire))
    }

    fn create_timer(&self, callback: Box<dyn TimerCallback>) -> Arc<dyn HrTimer> {
        self.create_sim_timer(callback)
    }
}
