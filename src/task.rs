//! Task-facing data (spec.md §3): scheduling policy, nominal/normal/
//! effective priority, RR time slice, and the sporadic-server ledger.
//!
//! Priority-space convention (spec.md §3): `0 .. MAX_RT_PRIO-1`, lower
//! numeric value = higher scheduling priority. `rt_priority` is the
//! POSIX-style knob handed in by configuration (`sched_priority`,
//! 1..MAX_RT_PRIO-1, *higher* number = more urgent, matching
//! `sched_setscheduler`); [`prio_from_rt_priority`] is the fixed
//! transform between the two spaces, shared by plain FIFO/RR tasks and
//! a sporadic server's foreground priority (`ss_fg_prio` in the
//! original source).

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::ktime::Ktime;
use crate::sync::IrqSafeMutex;
use crate::timer::HrTimer;
use crate::util::{KError, KResult};

/// Highest numeric RT priority value plus one (spec.md glossary: values
/// in `0..MAX_RT_PRIO` are "RT"; `>= MAX_RT_PRIO` are non-RT).
pub const MAX_RT_PRIO: i32 = 100;

/// Lowest/highest nominal (POSIX `sched_priority`) RT priority.
pub const RT_PRIO_MIN: i32 = 1;
pub const RT_PRIO_MAX: i32 = MAX_RT_PRIO - 1;

/// Translate a POSIX-style `rt_priority` (higher = more urgent) into
/// this crate's internal priority space (lower = more urgent).
pub const fn prio_from_rt_priority(rt_priority: i32) -> i32 {
    MAX_RT_PRIO - 1 - rt_priority
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    Fifo,
    RoundRobin,
    Sporadic,
}

impl SchedPolicy {
    pub fn is_round_robin(self) -> bool {
        matches!(self, SchedPolicy::RoundRobin)
    }
}

/// Priority-inheritance collaborator (spec.md §9): boosts are opaque to
/// this class. "Higher" means numerically lower.
pub trait PrioritySource: Send + Sync {
    fn effective_prio(&self, task_id: u64, normal_prio: i32) -> i32;
}

/// Default collaborator: no boosting, `prio == normal_prio`.
pub struct NoBoost;

impl PrioritySource for NoBoost {
    fn effective_prio(&self, _task_id: u64, normal_prio: i32) -> i32 {
        normal_prio
    }
}

/// One pending replenishment (spec.md §3 replenishment ledger).
#[derive(Debug, Clone, Copy)]
pub struct ReplRecord {
    pub time: Ktime,
    pub amt: Ktime,
}

/// Per-task sporadic-server configuration (spec.md §6).
#[derive(Debug, Clone, Copy)]
pub struct SsConfig {
    pub repl_period: Ktime,
    pub init_budget: Ktime,
    /// Background priority, internal prio-space (lower = more urgent).
    /// Must be numerically >= the task's foreground priority (i.e. no
    /// more urgent than foreground) — see DESIGN.md for why this reads
    /// `>=` rather than spec.md's literal "≤ foreground" wording.
    pub low_priority: i32,
    pub max_repl: usize,
    /// spec.md §9 Open Question: whether an SS task is allowed to keep
    /// running at background priority, or must be fully dequeued and
    /// forced to reschedule. Defaults to `false` (matches the original
    /// source's unconditional branch).
    pub run_in_background: bool,
}

impl SsConfig {
    pub fn validate(&self, fg_prio: i32) -> KResult<()> {
        if self.max_repl < 1 {
            return Err(KError::Invalid);
        }
        if self.init_budget.as_nanos() <= 0 || self.init_budget > self.repl_period {
            return Err(KError::Invalid);
        }
        if self.repl_period.as_nanos() <= 0 {
            return Err(KError::Invalid);
        }
        if self.low_priority < 0 || self.low_priority >= MAX_RT_PRIO {
            return Err(KError::Invalid);
        }
        if self.low_priority < fg_prio {
            return Err(KError::Invalid);
        }
        Ok(())
    }
}

/// Sporadic-server runtime state (spec.md §3, §4.4).
pub struct SsState {
    pub config: SsConfig,
    pub usage: Ktime,
    /// Index 0 = earliest pending replenishment; `repl_head == -1` means
    /// empty. Mirrors the original source's shift-on-insert ledger.
    pub repl_list: Vec<ReplRecord>,
    pub repl_head: i32,
    pub repl_timer: Option<Arc<dyn HrTimer>>,
    pub exh_timer: Option<Arc<dyn HrTimer>>,
}

impl SsState {
    pub fn new(config: SsConfig) -> Self {
        SsState {
            repl_list: alloc::vec![ReplRecord { time: Ktime::ZERO, amt: Ktime::ZERO }; config.max_repl],
            config,
            usage: Ktime::ZERO,
            repl_head: -1,
            repl_timer: None,
            exh_timer: None,
        }
    }

    pub fn rl_empty(&self) -> bool {
        self.repl_head == -1
    }

    pub fn rl_full(&self) -> bool {
        (self.repl_head + 1) as usize >= self.config.max_repl
    }

    /// Budget remaining: the initial allotment minus everything charged
    /// and not yet replenished.
    pub fn capacity(&self) -> Ktime {
        self.config.init_budget - self.usage
    }

    pub fn out_of_budget(&self) -> bool {
        self.capacity().as_nanos() <= 0
    }

    /// Record a pending replenishment due at `time` for `amt`. Charges
    /// arrive with monotonically non-decreasing due times, so the
    /// ledger stays sorted by simple append — no per-insert scan.
    pub fn rl_add(&mut self, time: Ktime, amt: Ktime) -> KResult<()> {
        if self.rl_full() {
            return Err(KError::Busy);
        }
        self.repl_head += 1;
        self.repl_list[self.repl_head as usize] = ReplRecord { time, amt };
        Ok(())
    }

    /// Pop the earliest pending replenishment (index 0), shifting the
    /// rest down. Returns `None` if the ledger is empty.
    pub fn rl_pop(&mut self) -> Option<ReplRecord> {
        if self.rl_empty() {
            return None;
        }
        let earliest = self.repl_list[0];
        for i in 0..self.repl_head as usize {
            self.repl_list[i] = self.repl_list[i + 1];
        }
        self.repl_head -= 1;
        Some(earliest)
    }

    /// Due time of the earliest pending replenishment, if any.
    pub fn rl_next_due(&self) -> Option<Ktime> {
        if self.rl_empty() {
            None
        } else {
            Some(self.repl_list[0].time)
        }
    }
}

/// Per-task real-time scheduling state, guarded by a single lock
/// (spec.md §5 treats fields like these as protected by the owning
/// run-queue's lock; this crate factors that protection onto the task
/// itself so call sites can't forget to take it — see DESIGN.md).
pub struct RtTaskState {
    pub policy: SchedPolicy,
    pub rt_priority: i32,
    pub normal_prio: i32,
    pub prio: i32,
    pub on_rq: bool,
    pub nr_cpus_allowed: u32,
    pub cpu: usize,
    pub running: bool,
    pub time_slice: Ktime,
    pub sum_exec_runtime: Ktime,
    pub ss: Option<SsState>,
}

pub struct RtTask {
    pub id: u64,
    pi_source: Box<dyn PrioritySource>,
    pub state: IrqSafeMutex<RtTaskState>,
}

impl RtTask {
    pub fn new_fifo(id: u64, rt_priority: i32, cpu: usize, nr_cpus_allowed: u32) -> KResult<Arc<Self>> {
        Self::new(id, SchedPolicy::Fifo, rt_priority, cpu, nr_cpus_allowed, None)
    }

    pub fn new_round_robin(
        id: u64,
        rt_priority: i32,
        cpu: usize,
        nr_cpus_allowed: u32,
    ) -> KResult<Arc<Self>> {
        Self::new(id, SchedPolicy::RoundRobin, rt_priority, cpu, nr_cpus_allowed, None)
    }

    pub fn new_sporadic(
        id: u64,
        rt_priority: i32,
        cpu: usize,
        nr_cpus_allowed: u32,
        ss_config: SsConfig,
    ) -> KResult<Arc<Self>> {
        Self::new(id, SchedPolicy::Sporadic, rt_priority, cpu, nr_cpus_allowed, Some(ss_config))
    }

    fn new(
        id: u64,
        policy: SchedPolicy,
        rt_priority: i32,
        cpu: usize,
        nr_cpus_allowed: u32,
        ss_config: Option<SsConfig>,
    ) -> KResult<Arc<Self>> {
        if !(RT_PRIO_MIN..=RT_PRIO_MAX).contains(&rt_priority) {
            return Err(KError::Invalid);
        }
        if nr_cpus_allowed == 0 {
            return Err(KError::Invalid);
        }
        let fg_prio = prio_from_rt_priority(rt_priority);
        let ss = match ss_config {
            Some(cfg) => {
                cfg.validate(fg_prio)?;
                Some(SsState::new(cfg))
            }
            None => None,
        };
        // A freshly admitted SS task starts at foreground with a full,
        // unspent budget — it hasn't blocked yet, so the §4.4 "always
        // wakes at background" rule (which governs resuming after a
        // block, see `sporadic::on_dequeue`/`on_wake`) doesn't apply to
        // genesis. Plain FIFO/RR start at their nominal priority too.
        let normal_prio = fg_prio;
        let time_slice = if policy.is_round_robin() {
            crate::rt_class::DEF_TIMESLICE
        } else {
            Ktime::ZERO
        };
        Ok(Arc::new(RtTask {
            id,
            pi_source: Box::new(NoBoost),
            state: IrqSafeMutex::new(RtTaskState {
                policy,
                rt_priority,
                normal_prio,
                prio: normal_prio,
                on_rq: false,
                nr_cpus_allowed,
                cpu,
                running: false,
                time_slice,
                sum_exec_runtime: Ktime::ZERO,
                ss,
            }),
        }))
    }

    pub fn with_pi_source(mut self: Arc<Self>, _source: Box<dyn PrioritySource>) -> Arc<Self> {
        // Arc<Self> doesn't allow mutating `pi_source` in place once
        // shared; this constructor-time hook exists for embedders that
        // want a custom collaborator and call it before sharing the Arc.
        if let Some(task) = Arc::get_mut(&mut self) {
            task.pi_source = _source;
        }
        self
    }

    pub fn fg_prio(&self, rt_priority: i32) -> i32 {
        prio_from_rt_priority(rt_priority)
    }

    pub fn recompute_effective_prio(&self, normal_prio: i32) -> i32 {
        self.pi_source.effective_prio(self.id, normal_prio)
    }
}
