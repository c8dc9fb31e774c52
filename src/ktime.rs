//! Nanosecond timestamp/duration type.
//!
//! Generalizes the teacher's `time.rs` (`uptime_ns`, `Timespec`) into
//! a single signed-nanosecond value, the way `sched_rt.c` uses
//! `ktime_t` throughout: absolute expiries and relative budgets share
//! the same representation so `ss_capacity`/`ss_fwd_repl_timer` style
//! arithmetic (subtract, add, compare) is uniform.

use core::ops::{Add, AddAssign, Sub};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Ktime(i64);

impl Ktime {
    pub const ZERO: Ktime = Ktime(0);

    pub const fn from_nanos(ns: i64) -> Self {
        Ktime(ns)
    }

    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn saturating_add(self, rhs: Ktime) -> Ktime {
        Ktime(self.0.saturating_add(rhs.0))
    }

    pub fn saturating_sub(self, rhs: Ktime) -> Ktime {
        Ktime(self.0.saturating_sub(rhs.0))
    }
}

impl Add for Ktime {
    type Output = Ktime;
    fn add(self, rhs: Ktime) -> Ktime {
        self.saturating_add(rhs)
    }
}

impl AddAssign for Ktime {
    fn add_assign(&mut self, rhs: Ktime) {
        *self = *self + rhs;
    }
}

impl Sub for Ktime {
    type Output = Ktime;
    fn sub(self, rhs: Ktime) -> Ktime {
        self.saturating_sub(rhs)
    }
}
