//! End-to-end coverage of the six literal scenarios from spec.md §8,
//! driven entirely through `SimTimerService`'s manually-advanced clock
//! — no wall-clock sleeps.

use std::sync::Arc;

use rt_sched::balancer::{pull_rt_task, push_rt_task, SmpBalancer};
use rt_sched::run_queue::RtRunQueue;
use rt_sched::task::SsConfig;
use rt_sched::{BandwidthGroup, Ktime, RtClass, RtTask, SimTimerService};

fn ms(n: i64) -> Ktime {
    Ktime::from_nanos(n * 1_000_000)
}

fn make_class(nr_cpus: usize) -> (Arc<RtClass>, Arc<SimTimerService>) {
    let timers = Arc::new(SimTimerService::new());
    let bandwidth = Arc::new(BandwidthGroup::new(nr_cpus, ms(1000), None).unwrap());
    let class = Arc::new(RtClass::new(nr_cpus, bandwidth, timers.clone()));
    (class, timers)
}

// Scenario 1: FIFO ordering.
#[test]
fn fifo_ordering_is_preserved_across_yield_and_dequeue() {
    let (class, _timers) = make_class(1);
    // internal prio 10 -> rt_priority = MAX_RT_PRIO - 1 - 10 = 89
    let a = RtTask::new_fifo(1, 89, 0, 1).unwrap();
    let b = RtTask::new_fifo(2, 89, 0, 1).unwrap();
    class.admit(a.clone(), 0).unwrap();
    class.admit(b.clone(), 0).unwrap();
    class.enqueue_task(&a, 0);
    class.enqueue_task(&b, 0);

    assert_eq!(class.pick_next(0), Some(1));

    // A yields: moves to the back of its priority level without
    // touching timers or priority (a full dequeue+enqueue would).
    class.yield_task(&a);
    assert_eq!(class.pick_next(0), Some(2));

    class.dequeue_task(&b);
    assert_eq!(class.pick_next(0), Some(1));
}

// Scenario 2: SS budget exhaustion.
#[test]
fn ss_budget_exhaustion_and_replenishment_cycle() {
    let (class, timers) = make_class(1);
    let cfg = SsConfig {
        repl_period: ms(100),
        init_budget: ms(20),
        low_priority: 30,
        max_repl: 2,
        run_in_background: false,
    };
    // fg_prio 10 -> rt_priority = 99 - 10 = 89
    let task = RtTask::new_sporadic(1, 89, 0, 1, cfg).unwrap();
    class.admit(task.clone(), 0).unwrap();
    class.enqueue_task(&task, 0);
    assert_eq!(task.state.lock().prio, 10);

    // Runs continuously for the full 20ms budget in one charge.
    class.task_tick(&task, ms(20));
    assert_eq!(task.state.lock().prio, 30);

    // At the period boundary the replenishment timer fires on its own.
    timers.advance_to(ms(100));
    assert_eq!(task.state.lock().prio, 10);
}

// Scenario 3: skipped replenishment.
#[test]
fn skipped_replenishment_forwards_timer_to_next_period_boundary() {
    let (class, timers) = make_class(1);
    let cfg = SsConfig {
        repl_period: ms(100),
        init_budget: ms(20),
        low_priority: 30,
        max_repl: 2,
        run_in_background: false,
    };
    let task = RtTask::new_sporadic(1, 89, 0, 1, cfg).unwrap();
    class.admit(task.clone(), 0).unwrap();
    class.enqueue_task(&task, 0);

    // Runs long enough to exhaust its budget synchronously, then
    // blocks at t=50ms.
    class.task_tick(&task, ms(20));
    timers.advance_to(ms(50));
    class.dequeue_task(&task);
    assert_eq!(task.state.lock().prio, 30);

    // Blocked across the t=100ms period boundary; wakes at t=250ms.
    timers.advance_to(ms(250));
    class.enqueue_task(&task, 0);

    let expiry = {
        let state = task.state.lock();
        let ss = state.ss.as_ref().unwrap();
        ss.repl_timer.as_ref().unwrap().get_expires()
    };
    assert_eq!(expiry, ms(300));
    assert_eq!(task.state.lock().prio, 30);
}

// Scenario 4: push on overload.
#[test]
fn push_moves_overloaded_cpus_highest_pushable_task() {
    let balancer = SmpBalancer::new(2);

    let mut rq0 = RtRunQueue::new(0);
    rq0.enqueue(100, 5, false, false); // X: running, pinned
    rq0.enqueue(101, 10, true, false); // A: migratable
    rq0.enqueue(102, 15, true, false); // B: migratable
    balancer.note_highest_prio_changed(0, rq0.highest_prio.curr);
    balancer.note_overload_changed(0, rq0.overloaded);

    let rq1 = Arc::new(rt_sched::sync::IrqSafeMutex::new(RtRunQueue::new(1)));
    rq1.lock().enqueue(200, 50, true, false); // Y
    balancer.note_highest_prio_changed(1, rq1.lock().highest_prio.curr);

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
    assert_eq!(rq0.highest_prio.curr, 5);
    assert_eq!(rq1.lock().highest_prio.curr, 10);
}

// Scenario 5: pull on priority drop.
#[test]
fn pull_takes_overloaded_cpus_pushable_task_on_priority_drop() {
    let balancer = SmpBalancer::new(2);

    let rq1 = Arc::new(rt_sched::sync::IrqSafeMutex::new(RtRunQueue::new(1)));
    {
        let mut rq = rq1.lock();
        rq.enqueue(500, 15, false, false); // Z: running, pinned
        rq.enqueue(300, 20, true, false); // pushable task on CPU1
        balancer.note_next_prio_changed(1, rq.highest_prio.next);
    }
    balancer.note_overload_changed(1, true);

    // CPU0's running task just had its priority lowered from 10 to 60.
    let mut rq0 = RtRunQueue::new(0);
    rq0.enqueue(400, 60, false, false);

    let rq1_for_closure = rq1.clone();
    let migrations = pull_rt_task(&balancer, 0, &mut rq0, move |cpu| {
        if cpu == 1 {
            Some(rq1_for_closure.clone())
        } else {
            None
        }
    });

    assert_eq!(migrations.len(), 1);
    assert_eq!(migrations[0].task_id, 300);
    assert_eq!(migrations[0].from_cpu, 1);
    assert_eq!(rq0.highest_prio.curr, 20);
}

// Scenario 6: bandwidth throttle.
#[test]
fn bandwidth_group_throttles_and_recovers_at_period_rollover() {
    let timers = Arc::new(SimTimerService::new());
    let bandwidth = Arc::new(BandwidthGroup::new(1, ms(100), Some(ms(50))).unwrap());
    let class = Arc::new(RtClass::new(1, bandwidth.clone(), timers.clone()));

    let task = RtTask::new_fifo(1, 89, 0, 1).unwrap();
    class.admit(task.clone(), 0).unwrap();
    class.enqueue_task(&task, 0);

    // Runs continuously; it reaches its 50ms quota exactly...
    class.task_tick(&task, ms(50));
    assert!(!bandwidth.is_throttled(0));
    // ...and the next tick pushes it strictly over, throttling it.
    class.task_tick(&task, ms(1));
    assert!(bandwidth.is_throttled(0));

    // Period tick at t=100ms resets and unthrottles it.
    timers.advance_to(ms(100));
    class.bandwidth_period_tick();
    assert!(!bandwidth.is_throttled(0));
}
