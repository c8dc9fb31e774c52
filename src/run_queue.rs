//! Per-CPU real-time run queue (spec.md §4.1): the priority array plus
//! the bookkeeping needed for overload detection and the SMP balancer's
//! "which of my tasks could move elsewhere" query.
//!
//! Grounded on the teacher's `sched/rt.rs` `RtRunqueue` struct (counts,
//! highest-priority cache) and `sched/balance.rs` (`pushable_tasks`).
//! Maintenance of `highest_prio` follows SPEC_FULL.md §11: enqueue is
//! purely incremental (a newly queued task can only raise, never lower,
//! the cached top); only a dequeue that removes the current top needs
//! to rescan the bitmap.

use alloc::collections::{BTreeMap, VecDeque};

use crate::prio_array::PrioArray;
use crate::task::MAX_RT_PRIO;

/// Sentinel meaning "no RT task queued on this CPU".
pub const NO_RT_TASK: i32 = MAX_RT_PRIO;

#[derive(Debug, Clone, Copy)]
pub struct HighestPrio {
    pub curr: i32,
    pub next: i32,
}

impl Default for HighestPrio {
    fn default() -> Self {
        HighestPrio { curr: NO_RT_TASK, next: NO_RT_TASK }
    }
}

pub struct RtRunQueue {
    pub cpu: usize,
    array: PrioArray,
    pub rt_nr_running: u32,
    pub rt_nr_migratory: u32,
    pub highest_prio: HighestPrio,
    pub overloaded: bool,
    /// Migratable tasks only, keyed by priority, for the balancer's
    /// "find me something to push" query (spec.md §4.5).
    pushable: BTreeMap<i32, VecDeque<u64>>,
}

impl RtRunQueue {
    pub fn new(cpu: usize) -> Self {
        RtRunQueue {
            cpu,
            array: PrioArray::new(),
            rt_nr_running: 0,
            rt_nr_migratory: 0,
            highest_prio: HighestPrio::default(),
            overloaded: false,
            pushable: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rt_nr_running == 0
    }

    pub fn enqueue(&mut self, task_id: u64, prio: i32, migratable: bool, front: bool) {
        if front {
            self.array.enqueue_front(prio, task_id);
        } else {
            self.array.enqueue_back(prio, task_id);
        }
        self.rt_nr_running += 1;
        if migratable {
            self.rt_nr_migratory += 1;
            self.pushable.entry(prio).or_default().push_back(task_id);
        }
        if prio < self.highest_prio.curr {
            self.highest_prio.next = self.highest_prio.curr;
            self.highest_prio.curr = prio;
        } else if prio < self.highest_prio.next && prio != self.highest_prio.curr {
            self.highest_prio.next = prio;
        }
        self.update_overload();
    }

    pub fn dequeue(&mut self, task_id: u64, prio: i32, migratable: bool) -> bool {
        let found = self.array.dequeue(prio, task_id);
        if !found {
            return false;
        }
        self.rt_nr_running -= 1;
        if migratable {
            self.rt_nr_migratory -= 1;
            self.remove_pushable(prio, task_id);
        }
        if prio == self.highest_prio.curr {
            self.rescan_highest_prio();
        }
        self.update_overload();
        true
    }

    /// Called when a queued task's priority changes in place (sporadic
    /// server fg/bg switch): equivalent to dequeue-then-enqueue but kept
    /// as one call so the run queue only recomputes overload once.
    pub fn requeue_at_new_prio(
        &mut self,
        task_id: u64,
        old_prio: i32,
        new_prio: i32,
        migratable: bool,
        front: bool,
    ) {
        self.dequeue(task_id, old_prio, migratable);
        self.enqueue(task_id, new_prio, migratable, front);
    }

    pub fn rotate_round_robin(&mut self, prio: i32) {
        self.array.rotate_front_to_back(prio);
    }

    pub fn pick_next(&self) -> Option<(i32, u64)> {
        let prio = self.array.find_first_set()?;
        let task_id = self.array.front(prio)?;
        Some((prio, task_id))
    }

    /// Highest-priority migratable task on this CPU, for the balancer's
    /// push path, together with its own priority level — which is not
    /// necessarily this run queue's `highest_prio.curr` (the current
    /// top task may be pinned to one CPU while a lower-priority task
    /// is the one actually eligible to move). `below_prio` excludes
    /// anything at or above that priority (the puller is never worse
    /// off for stealing it).
    pub fn highest_pushable(&self, below_prio: i32) -> Option<(i32, u64)> {
        self.pushable
            .range(..below_prio)
            .next()
            .and_then(|(&prio, q)| q.front().copied().map(|id| (prio, id)))
    }

    /// Mark `task_id` as the task now actually executing on this CPU
    /// (spec.md §4.2/§8 invariant 3: the pushable index excludes a
    /// CPU's own current task even while it's still queued). Pairs
    /// with [`Self::put_prev`].
    pub fn set_curr(&mut self, task_id: u64, prio: i32) {
        self.remove_pushable(prio, task_id);
    }

    /// Mark `task_id` as no longer this CPU's current task — preempted,
    /// blocked, or otherwise descheduled. If it's still queued and
    /// migratable, restore it to the pushable index.
    pub fn put_prev(&mut self, task_id: u64, prio: i32, migratable: bool, still_on_rq: bool) {
        if still_on_rq && migratable {
            self.pushable.entry(prio).or_default().push_back(task_id);
        }
    }

    fn remove_pushable(&mut self, prio: i32, task_id: u64) {
        if let Some(queue) = self.pushable.get_mut(&prio) {
            if let Some(pos) = queue.iter().position(|&id| id == task_id) {
                queue.remove(pos);
            }
            if queue.is_empty() {
                self.pushable.remove(&prio);
            }
        }
    }

    fn rescan_highest_prio(&mut self) {
        self.highest_prio.curr = self.array.find_first_set().unwrap_or(NO_RT_TASK);
        self.highest_prio.next = self.next_after(self.highest_prio.curr);
    }

    fn next_after(&self, curr: i32) -> i32 {
        if curr >= NO_RT_TASK {
            return NO_RT_TASK;
        }
        for prio in (curr + 1)..MAX_RT_PRIO {
            if !self.array.is_empty_at(prio) {
                return prio;
            }
        }
        NO_RT_TASK
    }

    fn update_overload(&mut self) {
        self.overloaded = self.rt_nr_running > 1 && self.rt_nr_migratory > 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_highest_priority_on_enqueue() {
        let mut rq = RtRunQueue::new(0);
        rq.enqueue(1, 50, true, false);
        assert_eq!(rq.highest_prio.curr, 50);
        rq.enqueue(2, 10, true, false);
        assert_eq!(rq.highest_prio.curr, 10);
        assert_eq!(rq.highest_prio.next, 50);
    }

    #[test]
    fn rescans_on_removal_of_top() {
        let mut rq = RtRunQueue::new(0);
        rq.enqueue(1, 50, true, false);
        rq.enqueue(2, 10, true, false);
        rq.dequeue(2, 10, true);
        assert_eq!(rq.highest_prio.curr, 50);
        assert_eq!(rq.highest_prio.next, NO_RT_TASK);
    }

    #[test]
    fn overload_requires_two_tasks_and_migratory() {
        let mut rq = RtRunQueue::new(0);
        rq.enqueue(1, 50, true, false);
        assert!(!rq.overloaded);
        rq.enqueue(2, 60, true, false);
        assert!(rq.overloaded);
        rq.dequeue(2, 60, true);
        assert!(!rq.overloaded);
    }

    #[test]
    fn non_migratable_never_overloads() {
        let mut rq = RtRunQueue::new(0);
        rq.enqueue(1, 50, false, false);
        rq.enqueue(2, 60, false, false);
        assert!(!rq.overloaded);
    }

    #[test]
    fn highest_pushable_excludes_better_or_equal() {
        let mut rq = RtRunQueue::new(0);
        rq.enqueue(1, 20, true, false);
        rq.enqueue(2, 40, true, false);
        assert_eq!(rq.highest_pushable(30), Some((40, 2)));
        assert_eq!(rq.highest_pushable(20), None);
    }

    #[test]
    fn highest_pushable_can_differ_from_the_current_top() {
        let mut rq = RtRunQueue::new(0);
        rq.enqueue(1, 5, false, false); // pinned, and the current top
        rq.enqueue(2, 10, true, false); // migratable, not the top
        assert_eq!(rq.highest_prio.curr, 5);
        assert_eq!(rq.highest_pushable(NO_RT_TASK), Some((10, 2)));
    }

    #[test]
    fn set_curr_removes_from_pushable_put_prev_restores_it() {
        let mut rq = RtRunQueue::new(0);
        rq.enqueue(1, 10, true, false);
        assert_eq!(rq.highest_pushable(NO_RT_TASK), Some((10, 1)));

        rq.set_curr(1, 10);
        assert_eq!(rq.highest_pushable(NO_RT_TASK), None);

        rq.put_prev(1, 10, true, true);
        assert_eq!(rq.highest_pushable(NO_RT_TASK), Some((10, 1)));
    }

    #[test]
    fn put_prev_does_not_restore_a_task_that_left_the_run_queue() {
        let mut rq = RtRunQueue::new(0);
        rq.enqueue(1, 10, true, false);
        rq.set_curr(1, 10);
        rq.put_prev(1, 10, true, false);
        assert_eq!(rq.highest_pushable(NO_RT_TASK), None);
    }
}
