//! Sporadic-server mechanics (spec.md §4.4): foreground/background
//! priority switching driven by a budget that is charged while running
//! at foreground priority and paid back by a replenishment ledger.
//!
//! Grounded on `examples/original_source/kernel/sched_rt.c`'s
//! `sched_ss_*` family: `update_curr_rt`'s budget-charging branch,
//! `ss_change_prio`, and the paired `ss_repl_timer`/`ss_exh_timer`
//! callbacks (SPEC_FULL.md §11). The exhaustion timer is armed
//! defensively on every charge (so a continuous-time caller still gets
//! exhaustion precisely between ticks); this crate's own tick-driven
//! callers additionally detect exhaustion synchronously the moment a
//! charge drains the budget, since that's the granularity they charge
//! at anyway.

use alloc::sync::{Arc, Weak};

use crate::ktime::Ktime;
use crate::run_queue::RtRunQueue;
use crate::task::{RtTask, RtTaskState, SchedPolicy};
use crate::timer::{HrTimer, Restart, TimerCallback};

/// What the caller should do after a charge or a priority switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrioSwitch {
    None,
    ToBackground,
    ToForeground,
}

/// Charge `delta` of consumed CPU time against `task`'s budget. Must
/// only be called while the task is running — and, per the sporadic
/// server rule, only actually deducts budget while it's running at its
/// foreground priority (spec.md §4.4: background execution is free).
///
/// On exhaustion, requeues `task` at background priority within `rq`
/// and returns [`PrioSwitch::ToBackground`].
pub fn charge_budget(task: &RtTask, rq: &mut RtRunQueue, delta: Ktime, now: Ktime) -> PrioSwitch {
    let mut state = task.state.lock();
    if state.policy != SchedPolicy::Sporadic {
        return PrioSwitch::None;
    }
    state.sum_exec_runtime += delta;

    let fg_prio = task.fg_prio(state.rt_priority);
    let at_foreground = state.prio == fg_prio;

    let Some(ss) = state.ss.as_mut() else { return PrioSwitch::None };
    if !at_foreground || delta.as_nanos() <= 0 {
        return PrioSwitch::None;
    }

    ss.usage += delta;
    // A ledger overrun (too many replenishments outstanding) is a
    // configuration error that should have been caught at admission;
    // treat it as "can't track this charge precisely" rather than a
    // fatal condition by folding it into the most recent entry.
    if ss.rl_add(now + ss.config.repl_period, delta).is_err() {
        if let Some(last) = ss.repl_list.get_mut(ss.repl_head.max(0) as usize) {
            last.amt += delta;
        }
    }
    // The ledger just grew (or its tail amount changed); make sure the
    // replenishment timer is actually tracking its new earliest entry.
    ss_fwd_repl_timer(ss, now);

    let exhausted = ss.out_of_budget();
    let remaining = ss.capacity();
    let exh_timer = ss.exh_timer.clone();
    drop(state);

    if exhausted {
        switch_to_background(task, rq, now);
        return PrioSwitch::ToBackground;
    }
    if let Some(timer) = exh_timer {
        timer.start(now + remaining);
    }
    PrioSwitch::None
}

/// Drain every replenishment ledger entry due at or before `now`,
/// restoring budget and switching `task` back to foreground if it had
/// dropped to background. Called from the replenishment timer
/// callback and is also safe to call eagerly (e.g. right after a wake).
pub fn apply_due_replenishments(task: &RtTask, rq: &mut RtRunQueue, now: Ktime) -> PrioSwitch {
    let mut restored = false;
    {
        let mut state = task.state.lock();
        let Some(ss) = state.ss.as_mut() else { return PrioSwitch::None };
        while let Some(due) = ss.rl_next_due() {
            if due > now {
                break;
            }
            let record = ss.rl_pop().expect("rl_next_due said Some");
            ss.usage = ss.usage - record.amt;
            restored = true;
        }
        if ss.usage.as_nanos() < 0 {
            ss.usage = Ktime::ZERO;
        }
        ss_fwd_repl_timer(ss, now);
    }
    if !restored {
        return PrioSwitch::None;
    }

    let (was_background, fg_prio) = {
        let state = task.state.lock();
        let fg_prio = task.fg_prio(state.rt_priority);
        (state.prio != fg_prio, fg_prio)
    };
    if was_background {
        let _ = fg_prio;
        switch_to_foreground(task, rq, now);
        PrioSwitch::ToForeground
    } else {
        PrioSwitch::None
    }
}

/// Handle the exhaustion timer actually firing. spec.md §4.4: the
/// timer may fire slightly late (the task was preempted, or a
/// replenishment landed in the race window between arming and firing)
/// so re-check the live budget under the RQ lock rather than trusting
/// that firing alone proves exhaustion. Only force the background
/// switch if it's actually still out of budget; otherwise leave the
/// task at foreground and re-arm for whatever is left, since this
/// timer is `HRTIMER_NORESTART` and nothing else will.
pub fn on_exhaustion_timer(task: &RtTask, rq: &mut RtRunQueue, now: Ktime) -> PrioSwitch {
    let (out_of_budget, remaining, exh_timer) = {
        let state = task.state.lock();
        let Some(ss) = state.ss.as_ref() else { return PrioSwitch::None };
        (ss.out_of_budget(), ss.capacity(), ss.exh_timer.clone())
    };
    if !out_of_budget {
        if let Some(timer) = exh_timer {
            if remaining.as_nanos() > 0 {
                timer.start(now + remaining);
            }
        }
        return PrioSwitch::None;
    }
    switch_to_background(task, rq, now);
    PrioSwitch::ToBackground
}

/// Re-arm the replenishment timer for the new earliest ledger entry,
/// or leave it cancelled if the ledger has drained (`ss_fwd_repl_timer`
/// in the original source). If the ledger's earliest due time has
/// already slipped into the past — a task blocked across one or more
/// replenishment periods — forward it by whole `repl_period`
/// increments until it's strictly in the future, per spec.md §4.4 item
/// 4, logging when more than one period was skipped (a sign of
/// starvation rather than an ordinary, expected wake-up gap). This
/// only moves the *timer's* expiry; the ledger entry's own recorded
/// due time is left untouched, since `apply_due_replenishments` only
/// needs it to compare `<= now`, never to rearm anything itself.
fn ss_fwd_repl_timer(ss: &mut crate::task::SsState, now: Ktime) {
    let Some(timer) = ss.repl_timer.clone() else { return };
    let Some(mut due) = ss.rl_next_due() else {
        timer.try_cancel();
        return;
    };
    let mut missed = 0u32;
    while due <= now {
        due += ss.config.repl_period;
        missed += 1;
    }
    if missed > 1 {
        crate::klog!(
            crate::util::Level::Warn,
            "ss: forwarded replenishment timer past {} missed period(s)",
            missed - 1
        );
    }
    timer.start(due);
}

fn switch_to_background(task: &RtTask, rq: &mut RtRunQueue, now: Ktime) {
    ss_change_prio(task, rq, now, false);
}

fn switch_to_foreground(task: &RtTask, rq: &mut RtRunQueue, now: Ktime) {
    ss_change_prio(task, rq, now, true);
}

/// Atomically move a queued sporadic-server task between its
/// foreground and background priority. Mirrors `ss_change_prio`: pull
/// it out of its current priority level, rewrite `normal_prio`, fold
/// in any priority-inheritance boost, and reinsert it at the front of
/// its new level so it doesn't lose its place to tasks that were
/// already waiting there.
fn ss_change_prio(task: &RtTask, rq: &mut RtRunQueue, now: Ktime, to_foreground: bool) {
    let mut state = task.state.lock();
    let fg_prio = task.fg_prio(state.rt_priority);
    let bg_prio = match &state.ss {
        Some(ss) => ss.config.low_priority,
        None => return,
    };
    let new_normal = if to_foreground { fg_prio } else { bg_prio };
    if new_normal == state.normal_prio {
        return; // already there; avoid a redundant dequeue/enqueue
    }

    let run_in_background = state.ss.as_ref().map(|ss| ss.config.run_in_background).unwrap_or(false);
    if !to_foreground && !run_in_background && !state.on_rq {
        // Not queued (e.g. blocked): nothing to requeue, just record
        // the new normal priority for when it next wakes.
        state.normal_prio = new_normal;
        state.prio = task.recompute_effective_prio(new_normal);
        return;
    }

    let old_prio = state.prio;
    let was_on_rq = state.on_rq;
    let migratable = state.nr_cpus_allowed > 1;

    state.normal_prio = new_normal;
    state.prio = task.recompute_effective_prio(new_normal);

    if was_on_rq {
        rq.requeue_at_new_prio(task.id, old_prio, state.prio, migratable, true);
    }

    arm_exhaustion_for_new_priority(&mut state, now, to_foreground);
}

fn arm_exhaustion_for_new_priority(state: &mut RtTaskState, now: Ktime, at_foreground: bool) {
    let Some(ss) = state.ss.as_mut() else { return };
    let Some(timer) = &ss.exh_timer else { return };
    if at_foreground {
        let remaining = ss.capacity();
        if remaining.as_nanos() > 0 {
            timer.start(now + remaining);
        }
    } else {
        timer.try_cancel();
    }
}

/// Sporadic-server half of dequeuing a task that is blocking/exiting
/// (spec.md §4.4 "Dequeue (sleep/exit)"). The caller has already pulled
/// `task` out of its run queue; this just applies the SS-specific
/// side effects: force background priority, expire the remaining
/// budget, and cancel both timers (the replenishment ledger itself is
/// preserved, not emptied, so a later wake resumes where it left off).
pub fn on_dequeue(task: &RtTask, _now: Ktime) {
    let mut state = task.state.lock();
    let bg_prio = match &state.ss {
        Some(ss) => ss.config.low_priority,
        None => return,
    };
    state.normal_prio = bg_prio;
    state.prio = task.recompute_effective_prio(bg_prio);
    if let Some(ss) = state.ss.as_mut() {
        ss.usage = ss.config.init_budget;
        if let Some(timer) = &ss.repl_timer {
            timer.try_cancel();
        }
        if let Some(timer) = &ss.exh_timer {
            timer.try_cancel();
        }
    }
}

/// Sporadic-server half of enqueuing a task that was previously
/// blocked (spec.md §4.4 "Enqueue (wake-up)"): re-align the
/// replenishment timer to the present ledger state. The task itself
/// stays at whatever priority `on_dequeue` left it at (background) —
/// it is promoted to foreground only by a subsequent replenishment,
/// never by the wake itself (see `ss_unblock_check` below).
pub fn on_wake(task: &RtTask, now: Ktime) {
    let mut state = task.state.lock();
    let Some(ss) = state.ss.as_mut() else { return };
    ss_fwd_repl_timer(ss, now);
}

/// spec.md §9 Open Question: whether an unblocking sporadic-server
/// task can be admitted back at foreground priority on the strength of
/// its own wake-up. Reserved — this crate always wakes an SS task at
/// whatever priority `ss_change_prio`/replenishment last left it at,
/// and never lets the wake path itself grant capacity.
pub fn ss_unblock_check(_task: &RtTask) -> bool {
    false
}

/// Forwarding back-reference a timer callback holds to the scheduler
/// facade (spec.md §9: callbacks must not keep the task or the
/// scheduler alive on their own).
pub trait SsDispatcher: Send + Sync {
    fn on_replenishment_due(&self, task_id: u64, cpu: usize, now: Ktime);
    fn on_exhaustion_due(&self, task_id: u64, cpu: usize, now: Ktime);
}

pub struct ReplTimerCallback {
    pub task_id: u64,
    pub cpu: usize,
    pub dispatcher: Weak<dyn SsDispatcher>,
}

impl TimerCallback for ReplTimerCallback {
    fn on_expire(&self, now: Ktime) -> Restart {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.on_replenishment_due(self.task_id, self.cpu, now);
        }
        // spec.md §4.4 item 6: HRTIMER_RESTART. `on_replenishment_due`
        // (via `apply_due_replenishments`/`ss_fwd_repl_timer`) has
        // already rearmed the timer's expiry to the next period
        // boundary; returning `NoRestart` here would have the timer
        // service stomp that and deactivate it for good.
        Restart::Restart
    }
}

pub struct ExhaustionTimerCallback {
    pub task_id: u64,
    pub cpu: usize,
    pub dispatcher: Weak<dyn SsDispatcher>,
}

impl TimerCallback for ExhaustionTimerCallback {
    fn on_expire(&self, now: Ktime) -> Restart {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.on_exhaustion_due(self.task_id, self.cpu, now);
        }
        Restart::NoRestart
    }
}

/// Attach timers to a freshly created sporadic-server task. Must be
/// called once, before the task is ever enqueued.
pub fn attach_timers(
    task: &Arc<RtTask>,
    make_repl: impl FnOnce() -> Arc<dyn HrTimer>,
    make_exh: impl FnOnce() -> Arc<dyn HrTimer>,
) {
    let mut state = task.state.lock();
    if let Some(ss) = state.ss.as_mut() {
        ss.repl_timer = Some(make_repl());
        ss.exh_timer = Some(make_exh());
    }
}
