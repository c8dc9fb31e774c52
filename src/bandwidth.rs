//! RT bandwidth-group accounting (spec.md §4.3): per-CPU runtime quotas
//! against a shared period, with cross-CPU borrowing so an idle CPU's
//! unused share can be lent to a busy one, and full reclaim when a CPU
//! is taken offline.
//!
//! Grounded on `examples/original_source/kernel/sched_rt.c`'s
//! `sched_rt_period_timer`, `balance_runtime`/`do_balance_runtime`, and
//! `__disable_runtime`/`__enable_runtime`. Every CPU in a group starts
//! with the *same* nominal `runtime` allotment per `period` (not
//! `runtime / nr_cpus`): the cap that prevents one CPU from ever
//! exceeding a full period's worth is what keeps the group bounded,
//! not a per-cpu division.

use alloc::vec::Vec;

use crate::ktime::Ktime;
use crate::sync::IrqSafeMutex;
use crate::util::{KError, KResult};

#[derive(Debug, Clone, Copy)]
pub struct CpuBandwidth {
    pub rt_time: Ktime,
    pub rt_runtime: Ktime,
    pub rt_throttled: bool,
}

struct Slices {
    period: Ktime,
    /// `None` == `RUNTIME_INF`: unlimited, never throttles, never
    /// participates in borrowing.
    nominal_runtime: Option<Ktime>,
    per_cpu: Vec<CpuBandwidth>,
}

pub struct BandwidthGroup {
    slices: IrqSafeMutex<Slices>,
}

impl BandwidthGroup {
    pub fn new(nr_cpus: usize, period: Ktime, runtime: Option<Ktime>) -> KResult<Self> {
        if period.as_nanos() <= 0 {
            return Err(KError::Invalid);
        }
        if let Some(rt) = runtime {
            if rt.as_nanos() < 0 || rt > period {
                return Err(KError::Invalid);
            }
        }
        let starting = runtime.unwrap_or(period);
        let per_cpu = alloc::vec![
            CpuBandwidth { rt_time: Ktime::ZERO, rt_runtime: starting, rt_throttled: false };
            nr_cpus
        ];
        Ok(BandwidthGroup {
            slices: IrqSafeMutex::new(Slices { period, nominal_runtime: runtime, per_cpu }),
        })
    }

    pub fn is_throttled(&self, cpu: usize) -> bool {
        self.slices.lock().per_cpu[cpu].rt_throttled
    }

    /// Charge `delta` of consumed RT runtime against `cpu`'s quota.
    /// Returns `true` if this charge just caused the CPU to throttle.
    pub fn charge(&self, cpu: usize, delta: Ktime) -> bool {
        let mut slices = self.slices.lock();
        if slices.nominal_runtime.is_none() {
            return false;
        }
        slices.per_cpu[cpu].rt_time += delta;
        if !over_quota(&slices.per_cpu[cpu]) {
            return false;
        }
        drop(slices);
        if self.balance_runtime(cpu) {
            let mut slices = self.slices.lock();
            if !over_quota(&slices.per_cpu[cpu]) {
                return false;
            }
            slices.per_cpu[cpu].rt_throttled = true;
            return true;
        }
        let mut slices = self.slices.lock();
        slices.per_cpu[cpu].rt_throttled = true;
        true
    }

    /// Once-per-period housekeeping (`sched_rt_period_timer` equivalent):
    /// un-throttle every CPU and reset its consumed-time counter.
    /// Returns the list of CPUs that were throttled and are now free to
    /// run again, so the caller can re-trigger dispatch there.
    pub fn period_tick(&self) -> Vec<usize> {
        let mut slices = self.slices.lock();
        let mut unthrottled = Vec::new();
        for (cpu, slice) in slices.per_cpu.iter_mut().enumerate() {
            slice.rt_time = Ktime::ZERO;
            if slice.rt_throttled {
                slice.rt_throttled = false;
                unthrottled.push(cpu);
            }
        }
        unthrottled
    }

    /// Try to borrow spare runtime from other CPUs in the group before
    /// `cpu` throttles. Returns whether any runtime was transferred.
    pub fn balance_runtime(&self, cpu: usize) -> bool {
        let mut slices = self.slices.lock();
        let Some(_) = slices.nominal_runtime else { return false };
        if !over_quota(&slices.per_cpu[cpu]) {
            return false;
        }
        let period = slices.period;
        let weight = slices.per_cpu.len().max(1) as i64;
        let mut more = false;
        let n = slices.per_cpu.len();
        for i in 0..n {
            if i == cpu {
                continue;
            }
            let diff = slices.per_cpu[i].rt_runtime - slices.per_cpu[i].rt_time;
            if diff.as_nanos() <= 0 {
                continue;
            }
            let mut share = Ktime::from_nanos(diff.as_nanos() / weight);
            if share.as_nanos() == 0 {
                continue;
            }
            if slices.per_cpu[cpu].rt_runtime + share > period {
                share = period - slices.per_cpu[cpu].rt_runtime;
            }
            if share.as_nanos() <= 0 {
                continue;
            }
            slices.per_cpu[i].rt_runtime = slices.per_cpu[i].rt_runtime - share;
            slices.per_cpu[cpu].rt_runtime = slices.per_cpu[cpu].rt_runtime + share;
            more = true;
            if slices.per_cpu[cpu].rt_runtime == period {
                break;
            }
        }
        more
    }

    /// Reclaim everything `cpu` has borrowed (or lend back anything it
    /// was over its nominal share by), driving its own quota to zero
    /// before it goes offline. Per spec.md §7 this must never leave a
    /// deficit outstanding anywhere in the group — that would be a
    /// fatal accounting bug, not a recoverable error.
    pub fn disable_runtime(&self, cpu: usize) {
        let mut slices = self.slices.lock();
        let Some(nominal) = slices.nominal_runtime else { return };
        let mut want = nominal - slices.per_cpu[cpu].rt_runtime;
        let n = slices.per_cpu.len();
        for i in 0..n {
            if i == cpu || want.as_nanos() == 0 {
                continue;
            }
            if want.as_nanos() > 0 {
                let diff = core::cmp::min(slices.per_cpu[i].rt_runtime.as_nanos(), want.as_nanos());
                let diff = Ktime::from_nanos(diff);
                slices.per_cpu[i].rt_runtime = slices.per_cpu[i].rt_runtime - diff;
                want = want - diff;
            } else {
                slices.per_cpu[i].rt_runtime = slices.per_cpu[i].rt_runtime - want;
                want = Ktime::ZERO;
            }
            if want.as_nanos() == 0 {
                break;
            }
        }
        assert!(want.as_nanos() == 0, "bandwidth group left a reclaim deficit on disable_runtime");
        slices.per_cpu[cpu].rt_runtime = Ktime::ZERO;
        slices.per_cpu[cpu].rt_time = Ktime::ZERO;
        slices.per_cpu[cpu].rt_throttled = false;
    }

    /// Restore `cpu`'s nominal share when it comes back online.
    pub fn enable_runtime(&self, cpu: usize) {
        let mut slices = self.slices.lock();
        let nominal = slices.nominal_runtime.unwrap_or(slices.period);
        slices.per_cpu[cpu] =
            CpuBandwidth { rt_time: Ktime::ZERO, rt_runtime: nominal, rt_throttled: false };
    }

    pub fn snapshot(&self, cpu: usize) -> CpuBandwidth {
        self.slices.lock().per_cpu[cpu]
    }
}

fn over_quota(slice: &CpuBandwidth) -> bool {
    slice.rt_time > slice.rt_runtime
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: i64) -> Ktime {
        Ktime::from_nanos(n * 1_000_000)
    }

    #[test]
    fn charges_under_quota_do_not_throttle() {
        let group = BandwidthGroup::new(2, ms(1000), Some(ms(950))).unwrap();
        assert!(!group.charge(0, ms(500)));
        assert!(!group.is_throttled(0));
    }

    #[test]
    fn exceeding_quota_without_spare_elsewhere_throttles() {
        let group = BandwidthGroup::new(2, ms(1000), Some(ms(500))).unwrap();
        // CPU 1 is also near its own cap, so there's nothing to lend.
        group.charge(1, ms(500));
        assert!(group.charge(0, ms(600)));
        assert!(group.is_throttled(0));
    }

    #[test]
    fn borrows_spare_runtime_from_an_idle_cpu() {
        let group = BandwidthGroup::new(2, ms(1000), Some(ms(500))).unwrap();
        // CPU 1 hasn't used any of its share; CPU 0 can borrow from it.
        assert!(!group.charge(0, ms(600)));
        assert!(!group.is_throttled(0));
    }

    #[test]
    fn period_tick_clears_throttle() {
        let group = BandwidthGroup::new(1, ms(1000), Some(ms(500))).unwrap();
        group.charge(0, ms(600));
        assert!(group.is_throttled(0));
        let unthrottled = group.period_tick();
        assert_eq!(unthrottled, alloc::vec![0]);
        assert!(!group.is_throttled(0));
    }

    #[test]
    fn infinite_runtime_never_throttles() {
        let group = BandwidthGroup::new(1, ms(1000), None).unwrap();
        assert!(!group.charge(0, ms(1_000_000)));
    }

    #[test]
    fn disable_runtime_fully_reclaims_before_going_offline() {
        let group = BandwidthGroup::new(2, ms(1000), Some(ms(500))).unwrap();
        group.charge(0, ms(600));
        group.disable_runtime(0);
        let slice = group.snapshot(0);
        assert_eq!(slice.rt_runtime, Ktime::ZERO);
    }
}
