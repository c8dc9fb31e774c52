//! Scheduling-class facade (spec.md §4.6): the dispatcher-facing API
//! that wires together the per-CPU run queues, the bandwidth group,
//! the SMP balancer, and the sporadic-server timers.
//!
//! Grounded on the teacher's `sched/mod.rs` (the trait a scheduling
//! class implements toward the generic dispatcher: enqueue, dequeue,
//! pick_next, tick, ...). Lock order, innermost last: a CPU's
//! `RtRunQueue` lock, then the `BandwidthGroup`'s internal lock, then
//! a task's own state lock (spec.md §5).

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use crate::balancer::{self, Migration, SmpBalancer};
use crate::bandwidth::BandwidthGroup;
use crate::ktime::Ktime;
use crate::run_queue::RtRunQueue;
use crate::sporadic::{self, ExhaustionTimerCallback, PrioSwitch, ReplTimerCallback, SsDispatcher};
use crate::sync::IrqSafeMutex;
use crate::task::{RtTask, SchedPolicy};
use crate::timer::TimerService;
use crate::util::{KError, KResult, Level};
use crate::klog;

/// Default SCHED_RR quantum, the way most systems default it
/// (100ms-scale); callers can override per class instance.
pub const DEF_TIMESLICE: Ktime = Ktime::from_nanos(100 * 1_000_000);

/// Outcome of [`RtClass::check_preempt_curr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptDecision {
    KeepRunning,
    Reschedule,
    ConsiderMigratingCurr,
}

struct PerCpu {
    rq: Arc<IrqSafeMutex<RtRunQueue>>,
}

pub struct RtClass {
    cpus: Vec<PerCpu>,
    bandwidth: Arc<BandwidthGroup>,
    balancer: SmpBalancer,
    timers: Arc<dyn TimerService>,
    tasks: IrqSafeMutex<BTreeMap<u64, Arc<RtTask>>>,
}

impl RtClass {
    pub fn new(nr_cpus: usize, bandwidth: Arc<BandwidthGroup>, timers: Arc<dyn TimerService>) -> Self {
        let cpus = (0..nr_cpus)
            .map(|cpu| PerCpu { rq: Arc::new(IrqSafeMutex::new(RtRunQueue::new(cpu))) })
            .collect();
        RtClass {
            cpus,
            bandwidth,
            balancer: SmpBalancer::new(nr_cpus),
            timers,
            tasks: IrqSafeMutex::new(BTreeMap::new()),
        }
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// Register a task with the class and, for sporadic-server tasks,
    /// attach its replenishment/exhaustion timers, wired back to
    /// `self` through a weak reference so a pending timer can never
    /// keep the whole class alive.
    pub fn admit(self: &Arc<Self>, task: Arc<RtTask>, cpu: usize) -> KResult<()> {
        if cpu >= self.cpus.len() {
            return Err(KError::Invalid);
        }
        let is_ss = matches!(task.state.lock().policy, SchedPolicy::Sporadic);
        if is_ss {
            let dispatcher: Weak<dyn SsDispatcher> = Arc::downgrade(self);
            let task_id = task.id;
            let repl_dispatcher = dispatcher.clone();
            let exh_dispatcher = dispatcher;
            let timers = self.timers.clone();
            let repl_timers = timers.clone();
            sporadic::attach_timers(
                &task,
                move || {
                    repl_timers.create_timer(Box::new(ReplTimerCallback {
                        task_id,
                        cpu,
                        dispatcher: repl_dispatcher,
                    }))
                },
                move || {
                    timers.create_timer(Box::new(ExhaustionTimerCallback {
                        task_id,
                        cpu,
                        dispatcher: exh_dispatcher,
                    }))
                },
            );
        }
        self.tasks.lock().insert(task.id, task);
        Ok(())
    }

    /// Enqueue a task that has just woken up or is being admitted for
    /// the first time (spec.md §4.4 "Enqueue (wake-up)").
    pub fn enqueue_task(&self, task: &Arc<RtTask>, cpu: usize) {
        let now = self.timers.now();
        if matches!(task.state.lock().policy, SchedPolicy::Sporadic) {
            sporadic::on_wake(task, now);
        }
        let (prio, nr_cpus_allowed) = {
            let mut state = task.state.lock();
            state.on_rq = true;
            state.cpu = cpu;
            (state.prio, state.nr_cpus_allowed)
        };
        let migratable = nr_cpus_allowed > 1;
        let mut rq = self.cpus[cpu].rq.lock();
        rq.enqueue(task.id, prio, migratable, false);
        self.publish_rq_state(cpu, &rq);
        let should_push = balancer::should_push_on_wake(&rq, prio, nr_cpus_allowed);
        drop(rq);

        if should_push {
            self.try_push(cpu);
        }
    }

    pub fn dequeue_task(&self, task: &Arc<RtTask>) {
        let is_ss = matches!(task.state.lock().policy, SchedPolicy::Sporadic);
        let (cpu, prio, migratable) = {
            let mut state = task.state.lock();
            state.on_rq = false;
            (state.cpu, state.prio, state.nr_cpus_allowed > 1)
        };
        let mut rq = self.cpus[cpu].rq.lock();
        rq.dequeue(task.id, prio, migratable);
        self.publish_rq_state(cpu, &rq);
        drop(rq);
        if is_ss {
            sporadic::on_dequeue(task, self.timers.now());
        }
    }

    /// RR quantum tick (spec.md §4.2): rotate the task to the back of
    /// its priority level when its slice drains, and charge sporadic
    /// server budget when applicable.
    pub fn task_tick(&self, task: &Arc<RtTask>, delta: Ktime) {
        let cpu = task.state.lock().cpu;
        let now = self.timers.now();

        if !self.bandwidth.is_throttled(cpu) && self.bandwidth.charge(cpu, delta) {
            klog!(Level::Warn, "rt: cpu{} exhausted its bandwidth quota, throttling", cpu);
        }

        let mut rq = self.cpus[cpu].rq.lock();
        let switch = sporadic::charge_budget(task, &mut rq, delta, now);
        self.after_prio_switch(cpu, &mut rq, switch);

        let (is_rr, prio) = {
            let mut state = task.state.lock();
            if state.policy != SchedPolicy::RoundRobin {
                (false, state.prio)
            } else {
                state.time_slice = state.time_slice.saturating_sub(delta);
                let expired = state.time_slice.as_nanos() <= 0;
                if expired {
                    state.time_slice = DEF_TIMESLICE;
                }
                (expired, state.prio)
            }
        };
        if is_rr {
            rq.rotate_round_robin(prio);
        }
    }

    /// `pick_next_task` (spec.md §4.6): the PrioArray head, skipping a
    /// throttled group's queue entirely rather than handing it a task
    /// it isn't allowed to run. The picked task becomes this CPU's
    /// current task, so it drops out of the pushable index until
    /// [`Self::put_prev_task`] puts it back.
    pub fn pick_next(&self, cpu: usize) -> Option<u64> {
        if self.bandwidth.is_throttled(cpu) {
            return None;
        }
        let mut rq = self.cpus[cpu].rq.lock();
        let (prio, id) = rq.pick_next()?;
        rq.set_curr(id, prio);
        drop(rq);
        if let Some(task) = self.tasks.lock().get(&id) {
            task.state.lock().running = true;
        }
        Some(id)
    }

    /// `put_prev_task` (spec.md §4.6): `task` is no longer this CPU's
    /// current task — preempted, or about to block/dequeue. If it's
    /// still queued and migratable, restore it to the pushable index
    /// (spec.md §8 invariant 3).
    pub fn put_prev_task(&self, task: &Arc<RtTask>) {
        let (cpu, prio, migratable, on_rq) = {
            let mut state = task.state.lock();
            state.running = false;
            (state.cpu, state.prio, state.nr_cpus_allowed > 1, state.on_rq)
        };
        let mut rq = self.cpus[cpu].rq.lock();
        rq.put_prev(task.id, prio, migratable, on_rq);
    }

    /// `yield_task` (spec.md §4.6): requeue the current task at the
    /// tail of its own priority bucket. Unlike a full dequeue+enqueue,
    /// this never touches SS timers or priority — a sporadic-server
    /// task yielding the CPU hasn't blocked.
    pub fn yield_task(&self, task: &Arc<RtTask>) {
        let (cpu, prio) = {
            let state = task.state.lock();
            (state.cpu, state.prio)
        };
        let mut rq = self.cpus[cpu].rq.lock();
        rq.rotate_round_robin(prio);
    }

    /// `check_preempt_curr` (spec.md §4.6): should a newly woken/
    /// enqueued task preempt whatever is currently running on `cpu`?
    pub fn check_preempt_curr(
        &self,
        curr_prio: i32,
        curr_migratable: bool,
        woken_prio: i32,
        woken_migratable: bool,
    ) -> PreemptDecision {
        if woken_prio < curr_prio {
            return PreemptDecision::Reschedule;
        }
        if woken_prio == curr_prio && curr_migratable && !woken_migratable {
            // The current task could move elsewhere to make room for a
            // task that's pinned here (spec.md §4.6 "on SMP ties,
            // consider migrating curr").
            return PreemptDecision::ConsiderMigratingCurr;
        }
        PreemptDecision::KeepRunning
    }

    /// `prio_changed` (spec.md §4.6). If the running task's priority
    /// just dropped numerically (got worse), this may free up capacity
    /// elsewhere in the domain, so attempt a pull. Returns whether the
    /// caller should reschedule `task_id`'s CPU.
    pub fn prio_changed(&self, cpu: usize, old_prio: i32, new_prio: i32, is_curr: bool) -> bool {
        if is_curr && old_prio < new_prio {
            self.try_pull(cpu);
        }
        let highest = self.highest_prio(cpu);
        if is_curr {
            new_prio > highest
        } else {
            new_prio < highest
        }
    }

    /// `switched_to_rt` (spec.md §4.6): a task just became RT-scheduled
    /// while already queued elsewhere but not yet running. Try to push
    /// if this CPU is already overloaded; otherwise report whether the
    /// caller should reschedule the current task.
    pub fn switched_to_rt(&self, cpu: usize, task_prio: i32, is_curr: bool) -> bool {
        if is_curr {
            return false;
        }
        if self.is_overloaded(cpu) && self.try_push(cpu).is_some() {
            return false;
        }
        task_prio < self.highest_prio(cpu)
    }

    /// `switched_from_rt` (spec.md §4.6): the last RT task left this
    /// CPU; give the balancer a chance to pull work back onto it.
    pub fn switched_from_rt(&self, cpu: usize) {
        if self.rq_len(cpu) == 0 {
            self.try_pull(cpu);
        }
    }

    /// `get_rr_interval` (spec.md §4.6): `DEF_TIMESLICE` for RR, 0
    /// (FIFO tasks don't time-slice).
    pub fn get_rr_interval(&self, policy: SchedPolicy) -> Ktime {
        if policy.is_round_robin() {
            DEF_TIMESLICE
        } else {
            Ktime::ZERO
        }
    }

    fn try_push(&self, cpu: usize) -> Option<Migration> {
        let mut from_rq = self.cpus[cpu].rq.lock();
        let migration = balancer::push_rt_task(&self.balancer, cpu, &mut from_rq, |dest_cpu| {
            self.cpus.get(dest_cpu).map(|pc| pc.rq.clone())
        });
        self.publish_rq_state(cpu, &from_rq);
        if let Some(m) = migration {
            klog!(Level::Info, "rt: pushed task {} from cpu{} to cpu{}", m.task_id, m.from_cpu, m.to_cpu);
        }
        migration
    }

    pub fn try_pull(&self, cpu: usize) -> Vec<Migration> {
        let mut to_rq = self.cpus[cpu].rq.lock();
        let migrations = balancer::pull_rt_task(&self.balancer, cpu, &mut to_rq, |src_cpu| {
            self.cpus.get(src_cpu).map(|pc| pc.rq.clone())
        });
        self.publish_rq_state(cpu, &to_rq);
        for m in &migrations {
            klog!(Level::Info, "rt: pulled task {} onto cpu{} from cpu{}", m.task_id, m.to_cpu, m.from_cpu);
        }
        migrations
    }

    fn after_prio_switch(&self, cpu: usize, rq: &mut RtRunQueue, switch: PrioSwitch) {
        if switch != PrioSwitch::None {
            self.publish_rq_state(cpu, rq);
        }
    }

    fn publish_rq_state(&self, cpu: usize, rq: &RtRunQueue) {
        self.balancer.note_highest_prio_changed(cpu, rq.highest_prio.curr);
        self.balancer.note_next_prio_changed(cpu, rq.highest_prio.next);
        self.balancer.note_overload_changed(cpu, rq.overloaded);
    }

    /// Bandwidth-group period tick: un-throttle any CPU whose quota
    /// just rolled over (spec.md §4.3) and give it a chance to dispatch.
    pub fn bandwidth_period_tick(&self) {
        for cpu in self.bandwidth.period_tick() {
            klog!(Level::Info, "rt: cpu{} unthrottled at period rollover", cpu);
            if cpu < self.cpus.len() {
                let _ = self.pick_next(cpu);
            }
        }
    }

    pub fn highest_prio(&self, cpu: usize) -> i32 {
        self.cpus[cpu].rq.lock().highest_prio.curr
    }

    pub fn is_overloaded(&self, cpu: usize) -> bool {
        self.cpus[cpu].rq.lock().overloaded
    }

    pub fn rq_len(&self, cpu: usize) -> u32 {
        self.cpus[cpu].rq.lock().rt_nr_running
    }
}

impl SsDispatcher for RtClass {
    fn on_replenishment_due(&self, task_id: u64, cpu: usize, now: Ktime) {
        let Some(task) = self.tasks.lock().get(&task_id).cloned() else { return };
        let mut rq = self.cpus[cpu].rq.lock();
        let switch = sporadic::apply_due_replenishments(&task, &mut rq, now);
        self.after_prio_switch(cpu, &mut rq, switch);
    }

    fn on_exhaustion_due(&self, task_id: u64, cpu: usize, now: Ktime) {
        let Some(task) = self.tasks.lock().get(&task_id).cloned() else { return };
        let mut rq = self.cpus[cpu].rq.lock();
        let switch = sporadic::on_exhaustion_timer(&task, &mut rq, now);
        self.after_prio_switch(cpu, &mut rq, switch);
    }
}
