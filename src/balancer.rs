//! SMP load balancing for RT tasks (spec.md §4.5): push a task off an
//! overloaded CPU, pull one onto a CPU that just dropped its priority
//! bar, via root-domain overload tracking plus the [`CpuPriority`]
//! index.
//!
//! Grounded on the teacher's `sched/balance.rs`: the root-domain
//! overload bitmask with an atomic CPU count, `RT_MAX_TRIES`, and the
//! double-lock-with-revalidation discipline needed because locking two
//! per-CPU run queues at once can deadlock against the reverse order
//! unless one side uses a non-blocking attempt.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crate::cpupri::CpuPriority;
use crate::run_queue::{RtRunQueue, NO_RT_TASK};
use crate::sync::IrqSafeMutex;

/// Bounded number of push/pull attempts before giving up on a round
/// (`RT_MAX_TRIES` in the original source) — avoids livelock when
/// every candidate loses the race to requeue elsewhere first.
pub const RT_MAX_TRIES: u32 = 3;

/// Root-domain-wide overload tracking, shared by every CPU in the
/// domain. `rto_count` is written with a release barrier before being
/// incremented so a concurrent reader of the bitmask never observes a
/// set bit before the corresponding run queue's `overloaded` flag is
/// itself visible.
pub struct RootDomain {
    overload_mask: IrqSafeMutex<Vec<bool>>,
    rto_count: AtomicUsize,
}

impl RootDomain {
    pub fn new(nr_cpus: usize) -> Self {
        RootDomain {
            overload_mask: IrqSafeMutex::new(alloc::vec![false; nr_cpus]),
            rto_count: AtomicUsize::new(0),
        }
    }

    pub fn set_overload(&self, cpu: usize, overloaded: bool) {
        let mut mask = self.overload_mask.lock();
        if mask[cpu] == overloaded {
            return;
        }
        mask[cpu] = overloaded;
        drop(mask);
        // Publish the mask write before the count becomes visible, so
        // `any_overloaded` readers that only check the count never
        // race ahead of the bit they're about to go inspect.
        core::sync::atomic::fence(Ordering::Release);
        if overloaded {
            self.rto_count.fetch_add(1, Ordering::AcqRel);
        } else {
            self.rto_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn any_overloaded(&self) -> bool {
        self.rto_count.load(Ordering::Acquire) > 0
    }

    pub fn overloaded_cpus(&self) -> Vec<usize> {
        self.overload_mask
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(cpu, &over)| over.then_some(cpu))
            .collect()
    }
}

/// Per-domain balancer: owns the overload tracker and CPU-priority
/// index; run queues themselves stay owned by the caller (the facade),
/// passed in by reference for each operation.
pub struct SmpBalancer {
    pub root_domain: RootDomain,
    cpupri: IrqSafeMutex<CpuPriority>,
    /// Per-CPU `highest_prio.next`, maintained independently of
    /// `cpupri` (which only tracks `curr`) so `pull_rt_task` can fast-
    /// reject a source CPU without taking its run-queue lock (spec.md
    /// §4.5, SPEC_FULL.md §11).
    next_prio: Vec<AtomicI32>,
    nr_cpus: usize,
}

impl SmpBalancer {
    pub fn new(nr_cpus: usize) -> Self {
        SmpBalancer {
            root_domain: RootDomain::new(nr_cpus),
            cpupri: IrqSafeMutex::new(CpuPriority::new(nr_cpus)),
            next_prio: (0..nr_cpus).map(|_| AtomicI32::new(NO_RT_TASK)).collect(),
            nr_cpus,
        }
    }

    /// Tied to `highest_prio.curr` changes only, per SPEC_FULL.md §11.
    pub fn note_highest_prio_changed(&self, cpu: usize, new_curr: i32) {
        self.cpupri.lock().set(cpu, new_curr);
    }

    /// Tied to `highest_prio.next` changes, incrementally maintained by
    /// the run queue on enqueue/dequeue (SPEC_FULL.md §11).
    pub fn note_next_prio_changed(&self, cpu: usize, new_next: i32) {
        if let Some(slot) = self.next_prio.get(cpu) {
            slot.store(new_next, Ordering::Release);
        }
    }

    fn next_prio(&self, cpu: usize) -> i32 {
        self.next_prio.get(cpu).map(|s| s.load(Ordering::Acquire)).unwrap_or(NO_RT_TASK)
    }

    pub fn note_overload_changed(&self, cpu: usize, overloaded: bool) {
        self.root_domain.set_overload(cpu, overloaded);
    }

    /// Find CPUs that could usefully take a task of `task_prio`,
    /// best-first. Excludes `from_cpu`.
    pub fn find_lowest_cpus(&self, task_prio: i32, from_cpu: usize, out: &mut Vec<usize>) -> bool {
        let found = self.cpupri.lock().find(task_prio, out);
        out.retain(|&cpu| cpu != from_cpu);
        found && !out.is_empty()
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }
}

/// Outcome of a push/pull attempt, reported up to the facade so it can
/// decide whether to reschedule the destination CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub task_id: u64,
    pub from_cpu: usize,
    pub to_cpu: usize,
}

/// Try to push the highest-priority pushable task off `from_rq` onto
/// whichever candidate CPU (from `find_lowest_cpus`) can actually take
/// it. Note this may not be `from_rq`'s current top task — the top
/// task can be pinned to this CPU while a lower-priority migratable
/// one is the only thing actually eligible to move. `lock_rq` is the
/// caller's double-lock-with-revalidation primitive: it must re-check,
/// once the destination is locked, that the task is still there and
/// still worth moving (another CPU may have gotten there first),
/// matching `find_lock_lowest_rq` in the original source.
pub fn push_rt_task(
    balancer: &SmpBalancer,
    from_cpu: usize,
    from_rq: &mut RtRunQueue,
    mut lock_rq: impl FnMut(usize) -> Option<Arc<IrqSafeMutex<RtRunQueue>>>,
) -> Option<Migration> {
    for _ in 0..RT_MAX_TRIES {
        let Some((task_prio, task_id)) = from_rq.highest_pushable(NO_RT_TASK) else { return None };

        let mut candidates = Vec::new();
        if !balancer.find_lowest_cpus(task_prio, from_cpu, &mut candidates) {
            return None;
        }

        for &candidate_cpu in &candidates {
            let Some(dest_lock) = lock_rq(candidate_cpu) else { continue };
            let Some(mut dest) = dest_lock.try_lock() else { continue };

            // Revalidate: the candidate may have picked up an
            // equal-or-better task while we were finding it.
            if dest.highest_prio.curr <= task_prio {
                continue;
            }
            if from_rq.highest_pushable(NO_RT_TASK) != Some((task_prio, task_id)) {
                // Someone else already moved our candidate task.
                continue;
            }

            from_rq.dequeue(task_id, task_prio, true);
            dest.enqueue(task_id, task_prio, true, false);
            return Some(Migration { task_id, from_cpu, to_cpu: candidate_cpu });
        }
    }
    None
}

/// Try to pull tasks onto `to_rq` from whichever overloaded CPUs have a
/// pushable task this CPU can usefully take. Keeps scanning every
/// overloaded CPU after a successful pull — spec.md §4.5 "Continue
/// scanning other CPUs for possibly-higher tasks" — rather than
/// stopping at the first migration, matching the original source's
/// `pull_rt_task` loop (`examples/original_source/kernel/sched_rt.c`),
/// which never breaks out early.
pub fn pull_rt_task(
    balancer: &SmpBalancer,
    to_cpu: usize,
    to_rq: &mut RtRunQueue,
    mut lock_rq: impl FnMut(usize) -> Option<Arc<IrqSafeMutex<RtRunQueue>>>,
) -> Vec<Migration> {
    let mut migrations = Vec::new();
    if !balancer.root_domain.any_overloaded() {
        return migrations;
    }
    for source_cpu in balancer.root_domain.overloaded_cpus() {
        if source_cpu == to_cpu {
            continue;
        }
        let my_prio = to_rq.highest_prio.curr;
        // Fast reject without locking: if even the source's *second*
        // highest-priority task can't outrank us, its pushable
        // candidate (strictly lower priority still) certainly can't.
        if balancer.next_prio(source_cpu) >= my_prio {
            continue;
        }
        let Some(source_lock) = lock_rq(source_cpu) else { continue };
        let Some(mut source) = source_lock.try_lock() else { continue };

        let Some((prio, task_id)) = source.highest_pushable(my_prio) else { continue };
        if prio < source.highest_prio.curr {
            // `prio` outranks whatever the source is currently running —
            // it's mid wake-up and just hasn't been scheduled there
            // yet. Leave it for its own CPU rather than stealing it.
            continue;
        }

        source.dequeue(task_id, prio, true);
        to_rq.enqueue(task_id, prio, true, false);
        migrations.push(Migration { task_id, from_cpu: source_cpu, to_cpu });
    }
    migrations
}

/// `task_woken_rt` in the original source: a task just woke up
/// migratable and strictly below the waking CPU's current top — if
/// this CPU is already overloaded, it's worth immediately trying to
/// push it elsewhere rather than waiting for the next tick.
pub fn should_push_on_wake(rq: &RtRunQueue, woken_prio: i32, nr_cpus_allowed: u32) -> bool {
    rq.overloaded && nr_cpus_allowed > 1 && woken_prio > rq.highest_prio.curr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overload_count_tracks_set_calls() {
        let rd = RootDomain::new(4);
        assert!(!rd.any_overloaded());
        rd.set_overload(0, true);
        assert!(rd.any_overloaded());
        rd.set_overload(1, true);
        rd.set_overload(0, false);
        assert!(rd.any_overloaded());
        rd.set_overload(1, false);
        assert!(!rd.any_overloaded());
    }

    #[test]
    fn duplicate_sets_are_idempotent() {
        let rd = RootDomain::new(2);
        rd.set_overload(0, true);
        rd.set_overload(0, true);
        assert_eq!(rd.overloaded_cpus(), alloc::vec![0]);
    }

    #[test]
    fn push_moves_highest_pushable_to_an_idle_cpu() {
        let balancer = SmpBalancer::new(2);
        let mut rq0 = RtRunQueue::new(0);
        rq0.enqueue(1, 10, true, false);
        balancer.note_highest_prio_changed(0, 10);
        balancer.note_highest_prio_changed(1, NO_RT_TASK);

        let rq1 = Arc::new(IrqSafeMutex::new(RtRunQueue::new(1)));
        let rq1_for_closure = rq1.clone();
        let migration = push_rt_task(&balancer, 0, &mut rq0, move |cpu| {
            if cpu == 1 {
                Some(rq1_for_closure.clone())
            } else {
                None
            }
        });

        let migration = migration.expect("expected a migration");
        assert_eq!(migration.to_cpu, 1);
        assert_eq!(rq1.lock().rt_nr_running, 1);
        assert_eq!(rq0.rt_nr_running, 0);
    }

    #[test]
    fn pull_takes_from_an_overloaded_cpu() {
        let balancer = SmpBalancer::new(2);
        let rq0 = Arc::new(IrqSafeMutex::new(RtRunQueue::new(0)));
        {
            let mut rq = rq0.lock();
            rq.enqueue(1, 10, true, false); // running, highest_prio.curr
            rq.enqueue(2, 20, true, false); // pushable
            balancer.note_next_prio_changed(0, rq.highest_prio.next);
        }
        balancer.note_overload_changed(0, true);

        let mut rq1 = RtRunQueue::new(1);
        let rq0_for_closure = rq0.clone();
        let migrations = pull_rt_task(&balancer, 1, &mut rq1, move |cpu| {
            if cpu == 0 {
                Some(rq0_for_closure.clone())
            } else {
                None
            }
        });

        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].task_id, 2);
        assert_eq!(rq1.rt_nr_running, 1);
    }

    #[test]
    fn pull_fast_rejects_a_source_with_no_real_candidate() {
        let balancer = SmpBalancer::new(2);
        let rq0 = Arc::new(IrqSafeMutex::new(RtRunQueue::new(0)));
        {
            // A single pinned task: overloaded is false here (needs 2
            // tasks), so force the overload flag directly to exercise
            // the fast-reject path on its own.
            let mut rq = rq0.lock();
            rq.enqueue(1, 10, false, false);
            balancer.note_next_prio_changed(0, rq.highest_prio.next);
        }
        balancer.note_overload_changed(0, true);

        let mut rq1 = RtRunQueue::new(1);
        let rq0_for_closure = rq0.clone();
        let migrations = pull_rt_task(&balancer, 1, &mut rq1, move |cpu| {
            if cpu == 0 {
                Some(rq0_for_closure.clone())
            } else {
                None
            }
        });

        assert!(migrations.is_empty());
    }

    #[test]
    fn wake_push_requires_overload_and_migratability() {
        let mut rq = RtRunQueue::new(0);
        rq.enqueue(1, 50, true, false);
        rq.enqueue(2, 60, true, false);
        assert!(rq.overloaded);
        assert!(should_push_on_wake(&rq, 70, 2));
        assert!(!should_push_on_wake(&rq, 70, 1));
        assert!(!should_push_on_wake(&rq, 10, 2));
    }
}
